//! Per-connection relay for the PostgreSQL dialect.
//!
//! # Purpose
//! Runs the startup/auth phase as an opaque byte relay, then forwards framed
//! messages in both directions while capturing queries on the client side
//! and finalizing them when the response terminator arrives upstream.
//!
//! # Key invariants
//! - Forwarded bytes are exactly the bytes read; nothing is re-encoded.
//! - The pending event is written by the request direction and taken by the
//!   response direction; both go through one mutex.
//! - When either direction exits, the peer task is aborted so both sockets
//!   close together and neither task leaks.
use sqltap_common::{Event, Op};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::tx::TxTracker;
use crate::{is_closed, is_closed_io, EventSink, ProxyError, Result};

use super::wire;

struct ConnState {
    next_id: u64,
    tx: TxTracker,
    // Statement name -> query text, for named prepared statements.
    prepared: HashMap<String, String>,
    last_parse: String,
    last_bind_statement: String,
    last_bind_args: Vec<String>,
    pending: Option<Event>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            next_id: 0,
            tx: TxTracker::postgres(),
            prepared: HashMap::new(),
            last_parse: String::new(),
            last_bind_statement: String::new(),
            last_bind_args: Vec::new(),
            pending: None,
        }
    }

    fn next_event_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

fn lock(state: &Mutex<ConnState>) -> MutexGuard<'_, ConnState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run one proxied connection to completion.
pub(crate) async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    sink: EventSink,
    max_frame: usize,
) -> Result<()> {
    let (client, upstream) = relay_startup(client, upstream, max_frame).await?;

    let state = Arc::new(Mutex::new(ConnState::new()));
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut request_dir = tokio::spawn(pump_requests(
        client_read,
        upstream_write,
        Arc::clone(&state),
        max_frame,
    ));
    let mut response_dir = tokio::spawn(pump_responses(
        upstream_read,
        client_write,
        Arc::clone(&state),
        sink,
        max_frame,
    ));

    // First direction to exit wins; aborting the peer drops its socket
    // halves, which unblocks and terminates the other side.
    let (first, second) = tokio::select! {
        res = &mut request_dir => (res, &mut response_dir),
        res = &mut response_dir => (res, &mut request_dir),
    };
    second.abort();
    let _ = second.await;

    match first {
        Ok(result) => result,
        Err(join_err) if join_err.is_cancelled() => Ok(()),
        Err(join_err) => Err(ProxyError::Protocol(format!("relay task: {join_err}"))),
    }
}

// Startup/auth runs as a raw byte shuttle: re-encoding opaque SCRAM or MD5
// payloads is fragile and the tap only cares about post-auth traffic.
async fn relay_startup(
    mut client: TcpStream,
    mut upstream: TcpStream,
    max_frame: usize,
) -> Result<(TcpStream, TcpStream)> {
    // Decline encryption upgrades until the real StartupMessage arrives.
    loop {
        let frame = wire::read_startup_frame(&mut client, max_frame).await?;
        match wire::startup_request_code(&frame) {
            Some(wire::SSL_REQUEST_CODE) | Some(wire::GSSENC_REQUEST_CODE) => {
                client.write_all(b"N").await?;
            }
            _ => {
                upstream.write_all(&frame).await?;
                break;
            }
        }
    }

    // Shuttle authentication opaquely until ReadyForQuery.
    loop {
        let frame = wire::read_frame(&mut upstream, max_frame).await?;
        client.write_all(&frame).await?;

        match wire::frame_type(&frame) {
            wire::MSG_READY_FOR_QUERY => return Ok((client, upstream)),
            wire::MSG_ERROR_RESPONSE => return Err(ProxyError::AuthFailed),
            wire::MSG_AUTHENTICATION => {
                if let Some(auth_type) = wire::auth_type(&frame) {
                    // AuthenticationOk and SASLFinal need no client response.
                    if auth_type != wire::AUTH_TYPE_OK && auth_type != wire::AUTH_TYPE_SASL_FINAL {
                        let response = wire::read_frame(&mut client, max_frame).await?;
                        upstream.write_all(&response).await?;
                    }
                }
            }
            _ => {}
        }
    }
}

async fn pump_requests(
    mut from_client: OwnedReadHalf,
    mut to_upstream: OwnedWriteHalf,
    state: Arc<Mutex<ConnState>>,
    max_frame: usize,
) -> Result<()> {
    loop {
        let frame = match wire::read_frame(&mut from_client, max_frame).await {
            Ok(frame) => frame,
            Err(err) if is_closed(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        capture_request(&state, &frame)?;

        if let Err(err) = to_upstream.write_all(&frame).await {
            if is_closed_io(&err) {
                return Ok(());
            }
            return Err(err.into());
        }
    }
}

async fn pump_responses(
    mut from_upstream: OwnedReadHalf,
    mut to_client: OwnedWriteHalf,
    state: Arc<Mutex<ConnState>>,
    sink: EventSink,
    max_frame: usize,
) -> Result<()> {
    loop {
        let frame = match wire::read_frame(&mut from_upstream, max_frame).await {
            Ok(frame) => frame,
            Err(err) if is_closed(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        capture_response(&state, &sink, &frame);

        if let Err(err) = to_client.write_all(&frame).await {
            if is_closed_io(&err) {
                return Ok(());
            }
            return Err(err.into());
        }
    }
}

fn capture_request(state: &Mutex<ConnState>, frame: &[u8]) -> Result<()> {
    let payload = wire::frame_payload(frame);
    match wire::frame_type(frame) {
        wire::MSG_QUERY => {
            let query = wire::parse_query(payload);
            let mut st = lock(state);
            let decision = st.tx.observe(&query, Op::Query);
            let id = st.next_event_id();
            let mut event = Event::new(id, decision.op, query);
            event.tx_id = decision.tx_id;
            st.pending = Some(event);
        }
        wire::MSG_PARSE => {
            let (name, query) = wire::parse_parse(payload)
                .ok_or_else(|| ProxyError::Protocol("malformed Parse message".into()))?;
            let mut st = lock(state);
            st.last_parse = query.clone();
            if !name.is_empty() {
                st.prepared.insert(name, query);
            }
        }
        wire::MSG_BIND => {
            let bind = wire::parse_bind(payload)
                .ok_or_else(|| ProxyError::Protocol("malformed Bind message".into()))?;
            let mut st = lock(state);
            st.last_bind_statement = bind.statement;
            st.last_bind_args = bind.args;
        }
        wire::MSG_EXECUTE => {
            let mut st = lock(state);
            let query = if st.last_bind_statement.is_empty() {
                st.last_parse.clone()
            } else {
                st.prepared
                    .get(&st.last_bind_statement)
                    .cloned()
                    .unwrap_or_else(|| st.last_parse.clone())
            };
            let decision = st.tx.observe(&query, Op::Execute);
            let id = st.next_event_id();
            let mut event = Event::new(id, decision.op, query);
            event.args = st.last_bind_args.clone();
            event.tx_id = decision.tx_id;
            st.pending = Some(event);
        }
        wire::MSG_CLOSE => {
            if let Some((b'S', name)) = wire::parse_close(payload) {
                lock(state).prepared.remove(&name);
            }
        }
        _ => {}
    }
    Ok(())
}

fn capture_response(state: &Mutex<ConnState>, sink: &EventSink, frame: &[u8]) {
    let payload = wire::frame_payload(frame);
    match wire::frame_type(frame) {
        wire::MSG_COMMAND_COMPLETE => {
            if let Some(mut event) = lock(state).pending.take() {
                event.duration = event.start_time.elapsed().unwrap_or_default();
                event.rows_affected = wire::parse_rows_affected(payload);
                sink.emit(event);
            }
        }
        wire::MSG_ERROR_RESPONSE => {
            if let Some(mut event) = lock(state).pending.take() {
                event.duration = event.start_time.elapsed().unwrap_or_default();
                event.error = wire::parse_error_message(payload);
                sink.emit(event);
            }
        }
        _ => {}
    }
}
