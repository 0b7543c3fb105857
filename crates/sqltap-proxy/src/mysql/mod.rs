//! MySQL/TiDB (client/server protocol v10) interceptor.
//!
//! Rewrites the handshake so TLS and `DEPRECATE_EOF` framing are off the
//! table, then captures commands and their responses packet by packet while
//! relaying bytes untouched.
use sqltap_common::Event;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::{EventSink, ProxySettings, Result};

mod conn;
mod wire;

/// Listening interceptor for the MySQL dialect (TiDB speaks the same
/// protocol and is handled identically).
///
/// ```no_run
/// use sqltap_proxy::{mysql::MySqlProxy, ProxySettings};
///
/// async fn run() -> sqltap_proxy::Result<()> {
///     let settings = ProxySettings::new("127.0.0.1:3307".parse().expect("addr"), "127.0.0.1:3306");
///     let (proxy, mut events) = MySqlProxy::bind(settings).await?;
///     tokio::spawn(async move { proxy.serve().await });
///     while let Some(event) = events.recv().await {
///         println!("{} {}", event.op, event.query);
///     }
///     Ok(())
/// }
/// ```
pub struct MySqlProxy {
    listener: TcpListener,
    settings: ProxySettings,
    sink: EventSink,
}

impl MySqlProxy {
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
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            listen = %self.settings.listen,
            upstream = %self.settings.upstream,
            "mysql proxy listening"
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
                    tracing::warn!(error = %err, peer = %peer, "mysql connection failed");
                }
            });
        }
    }
}
