// Scripted MySQL upstream and a raw-protocol client.
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

const OK_HEADER: u8 = 0x00;
const ERR_HEADER: u8 = 0xFF;
const EOF_HEADER: u8 = 0xFE;

pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SSL: u32 = 1 << 11;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// What the scripted upstream answers to one statement.
pub enum MySqlResponse {
    Ok { affected_rows: u64 },
    /// Text-protocol result set with this many columns and rows.
    ResultSet { columns: usize, rows: usize },
    Error { message: String },
}

/// Result of one client round trip, as seen by the raw client.
#[derive(Debug, Default)]
pub struct RoundTrip {
    pub affected_rows: u64,
    pub rows: usize,
    pub error: Option<String>,
}

fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = vec![
        (len & 0xFF) as u8,
        (len >> 8 & 0xFF) as u8,
        (len >> 16) as u8,
        seq,
    ];
    out.extend_from_slice(payload);
    out
}

async fn read_packet(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await.context("read packet header")?;
    let len = usize::from(hdr[0]) | usize::from(hdr[1]) << 8 | usize::from(hdr[2]) << 16;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.context("read packet payload")?;
    }
    Ok((hdr[3], payload))
}

fn lenenc(value: u64) -> Vec<u8> {
    match value {
        v if v < 0xFB => vec![v as u8],
        v if v <= 0xFFFF => {
            let mut out = vec![0xFC];
            out.extend_from_slice(&(v as u16).to_le_bytes());
            out
        }
        v if v <= 0xFF_FFFF => vec![0xFD, v as u8, (v >> 8) as u8, (v >> 16) as u8],
        v => {
            let mut out = vec![0xFE];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
    }
}

fn ok_packet(seq: u8, affected_rows: u64) -> Vec<u8> {
    let mut payload = vec![OK_HEADER];
    payload.extend_from_slice(&lenenc(affected_rows));
    payload.extend_from_slice(&lenenc(0)); // last insert id
    payload.extend_from_slice(&[2, 0, 0, 0]); // status flags + warnings
    packet(seq, &payload)
}

fn err_packet(seq: u8, message: &str) -> Vec<u8> {
    let mut payload = vec![ERR_HEADER, 0x7A, 0x04, b'#'];
    payload.extend_from_slice(b"42S02");
    payload.extend_from_slice(message.as_bytes());
    packet(seq, &payload)
}

fn eof_packet(seq: u8) -> Vec<u8> {
    packet(seq, &[EOF_HEADER, 0, 0, 2, 0])
}

// HandshakeV10 greeting advertising TLS and DEPRECATE_EOF so tests can show
// the proxy stripped them.
fn greeting_packet() -> Vec<u8> {
    let caps = CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_DEPRECATE_EOF | 0xFF;
    let mut payload = vec![0x0a];
    payload.extend_from_slice(b"8.0.36-scripted");
    payload.push(0);
    payload.extend_from_slice(&1u32.to_le_bytes()); // connection id
    payload.extend_from_slice(&[0x55; 8]); // auth-plugin-data part 1
    payload.push(0); // filler
    payload.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
    payload.push(0x21); // charset
    payload.extend_from_slice(&2u16.to_le_bytes()); // status flags
    payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    payload.extend_from_slice(&[0u8; 13]);
    packet(0, &payload)
}

/// Capability flags advertised by a greeting packet payload.
pub fn greeting_capabilities(payload: &[u8]) -> Option<u32> {
    let nul = payload.get(1..)?.iter().position(|b| *b == 0)?;
    let base = 1 + nul + 1;
    let lower = payload.get(base + 13..base + 15)?;
    let upper = payload.get(base + 18..base + 20)?;
    Some(
        u32::from(u16::from_le_bytes([lower[0], lower[1]]))
            | u32::from(u16::from_le_bytes([upper[0], upper[1]])) << 16,
    )
}

/// Accept connections and answer each statement via `respond`.
pub async fn spawn_upstream<F>(respond: F) -> Result<SocketAddr>
where
    F: Fn(&str) -> MySqlResponse + Send + Sync + 'static,
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
                    tracing::debug!(error = %err, "scripted mysql upstream connection ended");
                }
            });
        }
    });

    Ok(addr)
}

async fn serve_connection(
    mut stream: TcpStream,
    respond: Arc<impl Fn(&str) -> MySqlResponse>,
) -> Result<()> {
    stream.write_all(&greeting_packet()).await?;
    let _handshake_response = read_packet(&mut stream).await?;
    stream.write_all(&ok_packet(2, 0)).await?;

    let mut next_stmt_id = 1u32;

    loop {
        let (_, payload) = match read_packet(&mut stream).await {
            Ok(received) => received,
            Err(_) => return Ok(()),
        };
        let Some(&command) = payload.first() else { continue };

        match command {
            COM_QUERY => {
                let sql = String::from_utf8_lossy(&payload[1..]).into_owned();
                write_response(&mut stream, respond(&sql)).await?;
            }
            COM_STMT_PREPARE => {
                let sql = String::from_utf8_lossy(&payload[1..]).into_owned();
                let num_params = sql.matches('?').count() as u16;
                let stmt_id = next_stmt_id;
                next_stmt_id += 1;

                let mut prepare_ok = vec![OK_HEADER];
                prepare_ok.extend_from_slice(&stmt_id.to_le_bytes());
                prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // num_columns
                prepare_ok.extend_from_slice(&num_params.to_le_bytes());
                prepare_ok.push(0);
                prepare_ok.extend_from_slice(&0u16.to_le_bytes());
                let mut out = packet(1, &prepare_ok);
                let mut seq = 2;
                for _ in 0..num_params {
                    out.extend_from_slice(&packet(seq, &[3, b'd', b'e', b'f']));
                    seq += 1;
                }
                if num_params > 0 {
                    out.extend_from_slice(&eof_packet(seq));
                    seq += 1;
                }
                out.extend_from_slice(&packet(seq, &[3, b'd', b'e', b'f']));
                out.extend_from_slice(&eof_packet(seq + 1));
                stream.write_all(&out).await?;
            }
            COM_STMT_EXECUTE => {
                write_response(
                    &mut stream,
                    MySqlResponse::ResultSet {
                        columns: 1,
                        rows: 1,
                    },
                )
                .await?;
            }
            COM_STMT_CLOSE => {}
            COM_QUIT => return Ok(()),
            _ => {
                stream.write_all(&ok_packet(1, 0)).await?;
            }
        }
    }
}

async fn write_response(stream: &mut TcpStream, response: MySqlResponse) -> Result<()> {
    match response {
        MySqlResponse::Ok { affected_rows } => {
            stream.write_all(&ok_packet(1, affected_rows)).await?;
        }
        MySqlResponse::Error { message } => {
            stream.write_all(&err_packet(1, &message)).await?;
        }
        MySqlResponse::ResultSet { columns, rows } => {
            let mut out = packet(1, &lenenc(columns as u64));
            let mut seq = 2;
            for _ in 0..columns {
                out.extend_from_slice(&packet(seq, &[3, b'd', b'e', b'f']));
                seq += 1;
            }
            out.extend_from_slice(&eof_packet(seq));
            seq += 1;
            for _ in 0..rows {
                let mut row = Vec::new();
                for _ in 0..columns {
                    row.push(1);
                    row.push(b'1');
                }
                out.extend_from_slice(&packet(seq, &row));
                seq += 1;
            }
            out.extend_from_slice(&eof_packet(seq));
            stream.write_all(&out).await?;
        }
    }
    Ok(())
}

/// Raw protocol client for driving the proxy like a real MySQL frontend.
pub struct MySqlClient {
    stream: TcpStream,
    /// Capability flags the server side of the proxy advertised to us.
    pub server_capabilities: u32,
}

impl MySqlClient {
    /// Connect and complete the handshake.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await.context("connect proxy")?;

        let (_, greeting) = read_packet(&mut stream).await?;
        let server_capabilities =
            greeting_capabilities(&greeting).context("parse greeting capabilities")?;

        let mut response = Vec::new();
        response.extend_from_slice(&(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF).to_le_bytes());
        response.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes());
        response.push(0x21); // charset
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(b"tester\0");
        response.push(0); // empty auth response
        stream.write_all(&packet(1, &response)).await?;

        let (_, auth_result) = read_packet(&mut stream).await?;
        if auth_result.first() != Some(&OK_HEADER) {
            bail!("authentication against scripted upstream failed");
        }

        Ok(Self {
            stream,
            server_capabilities,
        })
    }

    /// COM_QUERY round trip.
    pub async fn query(&mut self, sql: &str) -> Result<RoundTrip> {
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(sql.as_bytes());
        self.stream.write_all(&packet(0, &payload)).await?;
        self.read_round_trip().await
    }

    /// COM_STMT_PREPARE round trip; returns the statement id.
    pub async fn prepare(&mut self, sql: &str) -> Result<u32> {
        let mut payload = vec![COM_STMT_PREPARE];
        payload.extend_from_slice(sql.as_bytes());
        self.stream.write_all(&packet(0, &payload)).await?;

        let (_, prepare_ok) = read_packet(&mut self.stream).await?;
        if prepare_ok.first() == Some(&ERR_HEADER) {
            bail!("prepare failed");
        }
        if prepare_ok.len() < 12 {
            bail!("short COM_STMT_PREPARE_OK");
        }
        let stmt_id = u32::from_le_bytes([prepare_ok[1], prepare_ok[2], prepare_ok[3], prepare_ok[4]]);
        let num_columns = u16::from_le_bytes([prepare_ok[5], prepare_ok[6]]) as usize;
        let num_params = u16::from_le_bytes([prepare_ok[7], prepare_ok[8]]) as usize;

        let mut skip = 0;
        if num_params > 0 {
            skip += num_params + 1;
        }
        if num_columns > 0 {
            skip += num_columns + 1;
        }
        for _ in 0..skip {
            read_packet(&mut self.stream).await?;
        }
        Ok(stmt_id)
    }

    /// COM_STMT_EXECUTE with signed 32-bit integer parameters.
    pub async fn execute_ints(&mut self, stmt_id: u32, values: &[i32]) -> Result<RoundTrip> {
        let mut payload = vec![COM_STMT_EXECUTE];
        payload.extend_from_slice(&stmt_id.to_le_bytes());
        payload.push(0); // flags
        payload.extend_from_slice(&1u32.to_le_bytes()); // iteration count
        if !values.is_empty() {
            payload.extend_from_slice(&vec![0u8; values.len().div_ceil(8)]); // null bitmap
            payload.push(1); // new params bound
            for _ in values {
                payload.push(0x03); // MYSQL_TYPE_LONG
                payload.push(0);
            }
            for value in values {
                payload.extend_from_slice(&value.to_le_bytes());
            }
        }
        self.stream.write_all(&packet(0, &payload)).await?;
        self.read_round_trip().await
    }

    /// COM_STMT_CLOSE (no response packet).
    pub async fn close_statement(&mut self, stmt_id: u32) -> Result<()> {
        let mut payload = vec![COM_STMT_CLOSE];
        payload.extend_from_slice(&stmt_id.to_le_bytes());
        self.stream.write_all(&packet(0, &payload)).await?;
        Ok(())
    }

    // Read one response: OK, ERR, or an EOF-terminated result set.
    async fn read_round_trip(&mut self) -> Result<RoundTrip> {
        let (_, first) = read_packet(&mut self.stream).await?;
        match first.first() {
            Some(&OK_HEADER) => {
                let mut trip = RoundTrip::default();
                if first.len() > 1 {
                    trip.affected_rows = lenenc_value(&first[1..]);
                }
                Ok(trip)
            }
            Some(&ERR_HEADER) => {
                let message = if first.len() > 9 && first[3] == b'#' {
                    String::from_utf8_lossy(&first[9..]).into_owned()
                } else {
                    String::from_utf8_lossy(first.get(3..).unwrap_or(&[])).into_owned()
                };
                Ok(RoundTrip {
                    error: Some(message),
                    ..Default::default()
                })
            }
            _ => {
                // Result set: column definitions, EOF, rows, EOF.
                let mut trip = RoundTrip::default();
                loop {
                    let (_, payload) = read_packet(&mut self.stream).await?;
                    if payload.first() == Some(&EOF_HEADER) && payload.len() < 9 {
                        break;
                    }
                }
                loop {
                    let (_, payload) = read_packet(&mut self.stream).await?;
                    if payload.first() == Some(&EOF_HEADER) && payload.len() < 9 {
                        break;
                    }
                    trip.rows += 1;
                }
                Ok(trip)
            }
        }
    }
}

fn lenenc_value(data: &[u8]) -> u64 {
    match data.first() {
        Some(&b) if b < 0xFB => u64::from(b),
        Some(&0xFC) if data.len() >= 3 => u64::from(u16::from_le_bytes([data[1], data[2]])),
        Some(&0xFD) if data.len() >= 4 => {
            u64::from(data[1]) | u64::from(data[2]) << 8 | u64::from(data[3]) << 16
        }
        Some(&0xFE) if data.len() >= 9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[1..9]);
            u64::from_le_bytes(raw)
        }
        _ => 0,
    }
}
