// Scripted PostgreSQL upstream and a raw-protocol client.
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const AUTH_OK: u32 = 0;

/// What the scripted upstream answers to one statement.
pub enum PgResponse {
    /// CommandComplete with this tag (e.g. `"SELECT 1"`, `"INSERT 0 3"`).
    Complete(String),
    /// ErrorResponse with this message, followed by ReadyForQuery.
    Error(String),
}

fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![msg_type];
    out.extend_from_slice(&((payload.len() as u32 + 4).to_be_bytes()));
    out.extend_from_slice(payload);
    out
}

fn cstr(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.push(0);
    out
}

async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; 5];
    stream.read_exact(&mut hdr).await.context("read frame header")?;
    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    if len < 4 {
        bail!("frame length {len} below minimum");
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await.context("read frame payload")?;
    Ok((hdr[0], payload))
}

async fn read_startup(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await.context("read startup header")?;
    let len = u32::from_be_bytes(hdr) as usize;
    if len < 4 {
        bail!("startup length {len} below minimum");
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await.context("read startup payload")?;
    Ok(payload)
}

fn ready_for_query() -> Vec<u8> {
    frame(b'Z', b"I")
}

fn error_response(message: &str) -> Vec<u8> {
    let payload = [
        [vec![b'S'], cstr("ERROR")].concat(),
        [vec![b'C'], cstr("42P01")].concat(),
        [vec![b'M'], cstr(message)].concat(),
        vec![0],
    ]
    .concat();
    frame(b'E', &payload)
}

/// Accept connections and answer each statement via `respond`.
///
/// Returns the address the upstream listens on. The server task lives until
/// the process (test) ends.
pub async fn spawn_upstream<F>(respond: F) -> Result<SocketAddr>
where
    F: Fn(&str) -> PgResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind upstream")?;
    let addr = listener.local_addr().context("upstream addr")?;
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, respond).await {
                    tracing::debug!(error = %err, "scripted postgres upstream connection ended");
                }
            });
        }
    });

    Ok(addr)
}

async fn serve_connection(
    mut stream: TcpStream,
    respond: Arc<impl Fn(&str) -> PgResponse>,
) -> Result<()> {
    let _startup = read_startup(&mut stream).await?;
    let mut auth_ok = frame(b'R', &AUTH_OK.to_be_bytes());
    auth_ok.extend_from_slice(&ready_for_query());
    stream.write_all(&auth_ok).await?;

    // Last Parse text stands in for a statement table: the scripted client
    // executes what it just prepared.
    let mut last_parse = String::new();
    loop {
        let (msg_type, payload) = match read_frame(&mut stream).await {
            Ok(message) => message,
            Err(_) => return Ok(()),
        };
        match msg_type {
            b'Q' => {
                let sql = String::from_utf8_lossy(payload.split(|b| *b == 0).next().unwrap_or(&[]))
                    .into_owned();
                let mut out = match respond(&sql) {
                    PgResponse::Complete(tag) => frame(b'C', &cstr(&tag)),
                    PgResponse::Error(message) => error_response(&message),
                };
                out.extend_from_slice(&ready_for_query());
                stream.write_all(&out).await?;
            }
            b'P' => {
                let mut parts = payload.split(|b| *b == 0);
                let _name = parts.next();
                last_parse = String::from_utf8_lossy(parts.next().unwrap_or(&[])).into_owned();
            }
            b'S' => {
                // Sync closes an extended-protocol round: answer for the
                // statement that was parsed.
                let mut out = frame(b'1', &[]); // ParseComplete
                out.extend_from_slice(&frame(b'2', &[])); // BindComplete
                match respond(&last_parse) {
                    PgResponse::Complete(tag) => out.extend_from_slice(&frame(b'C', &cstr(&tag))),
                    PgResponse::Error(message) => out.extend_from_slice(&error_response(&message)),
                }
                out.extend_from_slice(&ready_for_query());
                stream.write_all(&out).await?;
            }
            b'X' => return Ok(()), // Terminate
            _ => {}
        }
    }
}

/// Raw protocol client for driving the proxy like a real frontend.
pub struct PgClient {
    stream: TcpStream,
}

impl PgClient {
    /// Connect and complete the startup handshake.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect proxy")?;
        let mut client = Self { stream };
        client.send_startup().await?;
        client.drain_until_ready().await?;
        Ok(client)
    }

    /// Connect, probe for TLS first, and assert the proxy declines with 'N'.
    pub async fn connect_declining_ssl(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await.context("connect proxy")?;
        let mut ssl_request = Vec::new();
        ssl_request.extend_from_slice(&8u32.to_be_bytes());
        ssl_request.extend_from_slice(&80877103u32.to_be_bytes());
        stream.write_all(&ssl_request).await?;
        let mut answer = [0u8; 1];
        stream.read_exact(&mut answer).await?;
        if answer[0] != b'N' {
            bail!("expected SSL denial 'N', got {:#04x}", answer[0]);
        }
        let mut client = Self { stream };
        client.send_startup().await?;
        client.drain_until_ready().await?;
        Ok(client)
    }

    async fn send_startup(&mut self) -> Result<()> {
        let body = [
            196608u32.to_be_bytes().to_vec(), // protocol 3.0
            cstr("user"),
            cstr("tester"),
            cstr("database"),
            cstr("testdb"),
            vec![0],
        ]
        .concat();
        let mut startup = Vec::new();
        startup.extend_from_slice(&((body.len() as u32 + 4).to_be_bytes()));
        startup.extend_from_slice(&body);
        self.stream.write_all(&startup).await.context("send startup")
    }

    // Read backend messages until ReadyForQuery; return an error message if
    // one was seen on the way.
    async fn drain_until_ready(&mut self) -> Result<Option<String>> {
        let mut error = None;
        loop {
            let (msg_type, payload) = read_frame(&mut self.stream).await?;
            match msg_type {
                b'Z' => return Ok(error),
                b'E' => {
                    let mut off = 0;
                    while off < payload.len() && payload[off] != 0 {
                        let code = payload[off];
                        let end = payload[off + 1..]
                            .iter()
                            .position(|b| *b == 0)
                            .map(|p| off + 1 + p)
                            .unwrap_or(payload.len());
                        if code == b'M' {
                            error =
                                Some(String::from_utf8_lossy(&payload[off + 1..end]).into_owned());
                        }
                        off = end + 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// Issue a simple ('Q') query and wait for the round to finish.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Option<String>> {
        self.stream.write_all(&frame(b'Q', &cstr(sql))).await?;
        self.drain_until_ready().await
    }

    /// Issue an unnamed Parse/Bind/Execute/Sync round with text-format args.
    pub async fn extended_query(&mut self, sql: &str, args: &[&str]) -> Result<Option<String>> {
        let parse_payload = [cstr(""), cstr(sql), 0u16.to_be_bytes().to_vec()].concat();

        let mut bind_payload = Vec::new();
        bind_payload.extend_from_slice(&cstr("")); // portal
        bind_payload.extend_from_slice(&cstr("")); // statement
        bind_payload.extend_from_slice(&0u16.to_be_bytes());
        bind_payload.extend_from_slice(&(args.len() as u16).to_be_bytes());
        for arg in args {
            bind_payload.extend_from_slice(&(arg.len() as i32).to_be_bytes());
            bind_payload.extend_from_slice(arg.as_bytes());
        }
        bind_payload.extend_from_slice(&0u16.to_be_bytes());

        let execute_payload = [cstr(""), 0u32.to_be_bytes().to_vec()].concat();

        let mut out = frame(b'P', &parse_payload);
        out.extend_from_slice(&frame(b'B', &bind_payload));
        out.extend_from_slice(&frame(b'E', &execute_payload));
        out.extend_from_slice(&frame(b'S', &[]));
        self.stream.write_all(&out).await?;
        self.drain_until_ready().await
    }
}
