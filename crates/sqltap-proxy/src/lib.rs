//! Wire-protocol interceptors for PostgreSQL and MySQL/TiDB.
//!
//! # Purpose
//! Each proxy accepts client connections, dials the real database, and
//! relays protocol bytes in both directions while reconstructing a timed
//! stream of [`Event`] records: one per query, finalized when the response
//! terminator is observed upstream.
//!
//! # Notes
//! The proxies are faithful pass-throughs except for capability masking
//! during the handshake: TLS (and GSSAPI encryption on PostgreSQL) is
//! declined so negotiation stays in cleartext. A server that requires TLS
//! cannot sit behind this tap.
use sqltap_common::Event;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub mod mysql;
pub mod postgres;
mod tx;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("frame length {length} exceeds cap {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("upstream rejected authentication")]
    AuthFailed,
}

/// Hard safety cap for any single relayed frame.
///
/// Frame readers allocate a buffer sized by the peer-declared length;
/// without a cap a buggy or hostile peer could advertise an enormous length
/// and trigger OOM before the first byte of payload arrives.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 1024;

/// Listener/upstream addressing and per-connection limits.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Client-facing listen address.
    pub listen: SocketAddr,
    /// `host:port` of the real database server.
    pub upstream: String,
    /// Capacity of the captured-event channel.
    pub event_queue_depth: usize,
    /// Upper bound on a single frame/packet length.
    pub max_frame_bytes: usize,
}

impl ProxySettings {
    pub fn new(listen: SocketAddr, upstream: impl Into<String>) -> Self {
        Self {
            listen,
            upstream: upstream.into(),
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Non-blocking emission side of the captured-event channel.
///
/// Relay loops must never stall on a slow consumer, so a full channel drops
/// the event and bumps a counter instead of applying backpressure.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub(crate) fn bounded(depth: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            metrics::counter!("sqltap_events_dropped_total").increment(1);
        }
    }
}

// Socket teardown shows up as one of a few error kinds depending on which
// side closed first; all of them end the connection pair without noise.
pub(crate) fn is_closed_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

pub(crate) fn is_closed(err: &ProxyError) -> bool {
    matches!(err, ProxyError::Io(io_err) if is_closed_io(io_err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltap_common::Op;

    #[tokio::test]
    async fn sink_drops_when_full_without_blocking() {
        let (sink, mut rx) = EventSink::bounded(2);
        for i in 0..5 {
            sink.emit(Event::new(i.to_string(), Op::Query, "SELECT 1"));
        }
        assert_eq!(rx.recv().await.expect("first").id, "0");
        assert_eq!(rx.recv().await.expect("second").id, "1");
        assert!(rx.try_recv().is_err(), "overflow events are dropped");
    }

    #[test]
    fn closed_io_classification() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_closed(&ProxyError::Io(eof)));
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(!is_closed(&ProxyError::Io(denied)));
        assert!(!is_closed(&ProxyError::Protocol("bad".into())));
    }
}
