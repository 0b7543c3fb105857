// Shared data types carried between the interceptors and their consumers.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub mod ids {
    // Strongly typed IDs so correlation values cannot be mixed up at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                // Wrap an existing UUID when decoding from the outside.
                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                // Expose the underlying UUID for interoperability.
                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(TxId);
}

/// Kind of database operation captured on the wire.
///
/// ```
/// use sqltap_common::Op;
///
/// assert_eq!(Op::Execute.as_str(), "Execute");
/// assert_eq!(Op::Begin.to_string(), "Begin");
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Simple (text protocol) query.
    Query,
    /// Non-query execution.
    Exec,
    /// Prepared statement parse.
    Prepare,
    /// Parameter binding.
    Bind,
    /// Extended-protocol execute.
    Execute,
    /// Transaction begin.
    Begin,
    /// Transaction commit.
    Commit,
    /// Transaction rollback.
    Rollback,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Query => "Query",
            Op::Exec => "Exec",
            Op::Prepare => "Prepare",
            Op::Bind => "Bind",
            Op::Execute => "Execute",
            Op::Begin => "Begin",
            Op::Commit => "Commit",
            Op::Rollback => "Rollback",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured query event.
///
/// Created when a request is observed on the client side of a connection,
/// finalized (`duration`, `rows_affected`, `error`) when the matching
/// response terminator arrives from upstream, then emitted exactly once.
/// Consumers own the value after delivery and may receive shallow copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Connection-local monotonically increasing identifier.
    pub id: String,
    pub op: Op,
    /// SQL text. For a prepared execution, the text of the original prepare.
    pub query: String,
    /// Bound parameter values rendered as text. Empty unless the event is a
    /// parameter-bound execute.
    pub args: Vec<String>,
    /// Wall-clock time the request packet was seen.
    pub start_time: SystemTime,
    /// Request-to-terminator latency. Zero until finalized.
    pub duration: Duration,
    /// Parsed from the response tag when applicable, otherwise zero.
    pub rows_affected: i64,
    /// Error message from the response stream, empty on success.
    pub error: String,
    /// Correlation id grouping events between BEGIN and COMMIT/ROLLBACK.
    /// Empty outside an explicit transaction.
    pub tx_id: String,
    pub nplus1: bool,
    pub slow_query: bool,
    pub normalized_query: String,
}

impl Event {
    /// New event stamped with the current wall-clock time.
    pub fn new(id: String, op: Op, query: impl Into<String>) -> Self {
        Self {
            id,
            op,
            query: query.into(),
            args: Vec::new(),
            start_time: SystemTime::now(),
            duration: Duration::ZERO,
            rows_affected: 0,
            error: String::new(),
            tx_id: String::new(),
            nplus1: false,
            slow_query: false,
            normalized_query: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ids::TxId, Error, Event, Op};
    use std::str::FromStr;
    use std::time::Duration;

    #[test]
    fn tx_id_round_trip() {
        // IDs should render and parse without loss.
        let id = TxId::new();
        let parsed = TxId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn tx_id_rejects_invalid_input() {
        let err = TxId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn tx_ids_are_distinct() {
        assert_ne!(TxId::new(), TxId::new());
    }

    #[test]
    fn op_display_names() {
        for (op, name) in [
            (Op::Query, "Query"),
            (Op::Exec, "Exec"),
            (Op::Prepare, "Prepare"),
            (Op::Bind, "Bind"),
            (Op::Execute, "Execute"),
            (Op::Begin, "Begin"),
            (Op::Commit, "Commit"),
            (Op::Rollback, "Rollback"),
        ] {
            assert_eq!(op.to_string(), name);
        }
    }

    #[test]
    fn new_event_starts_unfinalized() {
        let ev = Event::new("1".into(), Op::Query, "SELECT 1");
        assert_eq!(ev.duration, Duration::ZERO);
        assert_eq!(ev.rows_affected, 0);
        assert!(ev.error.is_empty());
        assert!(ev.tx_id.is_empty());
        assert!(ev.args.is_empty());
    }

    #[test]
    fn event_serializes_to_json() {
        let ev = Event::new("7".into(), Op::Execute, "SELECT $1");
        let json = serde_json::to_string(&ev).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ev, back);
    }
}
