// Scripted database endpoints for exercising the interceptors end to end.
//
// Each upstream speaks just enough of its protocol to drive the proxy's
// state machines deterministically, so the integration tests assert on real
// TCP traffic without a containerized database.
pub mod mysql;
pub mod postgres;
