//! PostgreSQL (frontend/backend protocol v3) interceptor.
//!
//! Declines `SSLRequest`/`GSSENCRequest` so the session stays cleartext,
//! shuttles authentication opaquely, then captures queries from the framed
//! message stream while relaying bytes untouched.
use sqltap_common::Event;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::{EventSink, ProxySettings, Result};

mod conn;
mod wire;

/// Listening interceptor for the PostgreSQL dialect.
///
/// ```no_run
/// use sqltap_proxy::{postgres::PostgresProxy, ProxySettings};
///
/// async fn run() -> sqltap_proxy::Result<()> {
///     let settings = ProxySettings::new("127.0.0.1:6432".parse().expect("addr"), "127.0.0.1:5432");
///     let (proxy, mut events) = PostgresProxy::bind(settings).await?;
///     tokio::spawn(async move { proxy.serve().await });
///     while let Some(event) = events.recv().await {
///         println!("{} {}", event.op, event.query);
///     }
///     Ok(())
/// }
/// ```
pub struct PostgresProxy {
    listener: TcpListener,
    settings: ProxySettings,
    sink: EventSink,
}

impl PostgresProxy {
    /// Bind the client listener and open the captured-event channel.
    pub async fn bind(settings: ProxySettings) -> Result<(Self, mpsc::Receiver<Event>)> {
        let listener = TcpListener::bind(settings.listen).await?;
        let (sink, events) = EventSink::bounded(settings.event_queue_depth);
        Ok((
            Self {
                listener,
                settings,
                sink,
            },
            events,
        ))
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the listener fails or the task is aborted.
    ///
    /// Each accepted client gets its own upstream dial and relay task; a
    /// failure on one connection pair never affects the others.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            listen = %self.settings.listen,
            upstream = %self.settings.upstream,
            "postgres proxy listening"
        );
        loop {
            let (client, peer) = self.listener.accept().await?;
            let upstream_addr = self.settings.upstream.clone();
            let sink = self.sink.clone();
            let max_frame = self.settings.max_frame_bytes;
            tokio::spawn(async move {
                let upstream = match TcpStream::connect(&upstream_addr).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(error = %err, peer = %peer, "upstream dial failed");
                        return;
                    }
                };
                let _ = client.set_nodelay(true);
                let _ = upstream.set_nodelay(true);
                if let Err(err) = conn::relay(client, upstream, sink, max_frame).await {
                    tracing::warn!(error = %err, peer = %peer, "postgres connection failed");
                }
            });
        }
    }
}
