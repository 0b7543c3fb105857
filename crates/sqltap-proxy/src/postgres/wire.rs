// PostgreSQL v3 message framing and the few payload shapes the tap reads.
//
// Startup-format messages carry no type byte: 4-byte big-endian length
// (self-inclusive) then payload. Every other message is 1 type byte + the
// same length format. Frames are kept as the raw bytes that came off the
// socket so forwarding never re-encodes.
use crate::{ProxyError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const SSL_REQUEST_CODE: u32 = 80877103;
pub(crate) const GSSENC_REQUEST_CODE: u32 = 80877104;

// Frontend message types.
pub(crate) const MSG_QUERY: u8 = b'Q';
pub(crate) const MSG_PARSE: u8 = b'P';
pub(crate) const MSG_BIND: u8 = b'B';
pub(crate) const MSG_EXECUTE: u8 = b'E';
pub(crate) const MSG_CLOSE: u8 = b'C';

// Backend message types.
pub(crate) const MSG_COMMAND_COMPLETE: u8 = b'C';
pub(crate) const MSG_ERROR_RESPONSE: u8 = b'E';
pub(crate) const MSG_READY_FOR_QUERY: u8 = b'Z';
pub(crate) const MSG_AUTHENTICATION: u8 = b'R';

pub(crate) const AUTH_TYPE_OK: u32 = 0;
pub(crate) const AUTH_TYPE_SASL_FINAL: u32 = 12;

/// Read one startup-format message, returning the raw frame including its
/// length prefix.
pub(crate) async fn read_startup_frame<R>(r: &mut R, max: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes(hdr) as usize;
    if len < 4 {
        return Err(ProxyError::Protocol(format!(
            "startup message length {len} below minimum"
        )));
    }
    // Validate the declared length before trusting it with an allocation.
    if len > max {
        return Err(ProxyError::FrameTooLarge { length: len, max });
    }
    let mut frame = BytesMut::zeroed(len);
    frame[..4].copy_from_slice(&hdr);
    r.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

/// Read one regular message, returning the raw frame including type byte and
/// length prefix.
pub(crate) async fn read_frame<R>(r: &mut R, max: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 5];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    if len < 4 {
        return Err(ProxyError::Protocol(format!(
            "message length {len} below minimum"
        )));
    }
    if len > max {
        return Err(ProxyError::FrameTooLarge { length: len, max });
    }
    let mut frame = BytesMut::zeroed(1 + len);
    frame[..5].copy_from_slice(&hdr);
    r.read_exact(&mut frame[5..]).await?;
    Ok(frame)
}

pub(crate) fn frame_type(frame: &[u8]) -> u8 {
    frame.first().copied().unwrap_or(0)
}

pub(crate) fn frame_payload(frame: &[u8]) -> &[u8] {
    if frame.len() > 5 { &frame[5..] } else { &[] }
}

// SSLRequest/GSSENCRequest are 8-byte startup messages whose payload is a
// single magic code.
pub(crate) fn startup_request_code(frame: &[u8]) -> Option<u32> {
    if frame.len() != 8 {
        return None;
    }
    Some(u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]))
}

// Authentication ('R') messages carry the auth mechanism as the first four
// payload bytes.
pub(crate) fn auth_type(frame: &[u8]) -> Option<u32> {
    let payload = frame_payload(frame);
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

fn read_cstr(buf: &[u8], offset: usize) -> Option<(String, usize)> {
    let rest = buf.get(offset..)?;
    let nul = rest.iter().position(|b| *b == 0)?;
    let text = String::from_utf8_lossy(&rest[..nul]).into_owned();
    Some((text, offset + nul + 1))
}

/// Query ('Q') payload: the SQL text as a C string.
pub(crate) fn parse_query(payload: &[u8]) -> String {
    read_cstr(payload, 0)
        .map(|(text, _)| text)
        .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned())
}

/// Parse ('P') payload: statement name, query, then parameter type OIDs the
/// tap does not need.
pub(crate) fn parse_parse(payload: &[u8]) -> Option<(String, String)> {
    let (name, off) = read_cstr(payload, 0)?;
    let (query, _) = read_cstr(payload, off)?;
    Some((name, query))
}

pub(crate) struct BindInfo {
    pub statement: String,
    pub args: Vec<String>,
}

/// Bind ('B') payload: portal, statement, format codes, then length-prefixed
/// parameter values. Values are captured as raw bytes rendered as text; a
/// length of -1 is a NULL and renders empty.
pub(crate) fn parse_bind(payload: &[u8]) -> Option<BindInfo> {
    let (_portal, off) = read_cstr(payload, 0)?;
    let (statement, off) = read_cstr(payload, off)?;

    let format_count = read_u16(payload, off)? as usize;
    let mut off = off + 2 + format_count * 2;

    let param_count = read_u16(payload, off)? as usize;
    off += 2;

    let mut args = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        let len = read_i32(payload, off)?;
        off += 4;
        if len < 0 {
            args.push(String::new());
            continue;
        }
        let len = len as usize;
        let value = payload.get(off..off + len)?;
        args.push(String::from_utf8_lossy(value).into_owned());
        off += len;
    }
    Some(BindInfo { statement, args })
}

/// Close ('C', frontend) payload: kind byte ('S' statement / 'P' portal)
/// then the name.
pub(crate) fn parse_close(payload: &[u8]) -> Option<(u8, String)> {
    let kind = *payload.first()?;
    let (name, _) = read_cstr(payload, 1)?;
    Some((kind, name))
}

/// Rows affected from a CommandComplete tag: the last space-separated token,
/// e.g. `INSERT 0 5` -> 5, `SELECT 3` -> 3. Zero when the tag carries none.
pub(crate) fn parse_rows_affected(payload: &[u8]) -> i64 {
    let tag = match read_cstr(payload, 0) {
        Some((tag, _)) => tag,
        None => String::from_utf8_lossy(payload).into_owned(),
    };
    tag.rsplit(' ')
        .next()
        .and_then(|token| token.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Human-readable message ('M') field of an ErrorResponse payload.
pub(crate) fn parse_error_message(payload: &[u8]) -> String {
    let mut off = 0;
    while let Some(&code) = payload.get(off) {
        if code == 0 {
            break;
        }
        match read_cstr(payload, off + 1) {
            Some((value, next)) => {
                if code == b'M' {
                    return value;
                }
                off = next;
            }
            None => break,
        }
    }
    String::new()
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn read_frame_round_trip() {
        let encoded = frame(MSG_QUERY, &cstr("SELECT 1"));
        let mut cursor = encoded.as_slice();
        let read = read_frame(&mut cursor, 1024).await.expect("frame");
        assert_eq!(read, encoded);
        assert_eq!(frame_type(&read), MSG_QUERY);
        assert_eq!(parse_query(frame_payload(&read)), "SELECT 1");
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let encoded = frame(MSG_QUERY, &[0u8; 64]);
        let mut cursor = encoded.as_slice();
        let err = read_frame(&mut cursor, 16).await.expect_err("cap");
        assert!(matches!(err, ProxyError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn read_frame_rejects_undersized_length() {
        let mut bad = vec![MSG_QUERY];
        bad.extend_from_slice(&2u32.to_be_bytes());
        let mut cursor = bad.as_slice();
        let err = read_frame(&mut cursor, 1024).await.expect_err("short");
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn startup_frame_and_request_codes() {
        let mut ssl_request = Vec::new();
        ssl_request.extend_from_slice(&8u32.to_be_bytes());
        ssl_request.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let mut cursor = ssl_request.as_slice();
        let read = read_startup_frame(&mut cursor, 1024).await.expect("frame");
        assert_eq!(startup_request_code(&read), Some(SSL_REQUEST_CODE));

        let mut gss_request = Vec::new();
        gss_request.extend_from_slice(&8u32.to_be_bytes());
        gss_request.extend_from_slice(&GSSENC_REQUEST_CODE.to_be_bytes());
        let mut cursor = gss_request.as_slice();
        let read = read_startup_frame(&mut cursor, 1024).await.expect("frame");
        assert_eq!(startup_request_code(&read), Some(GSSENC_REQUEST_CODE));

        // A real startup message is longer than 8 bytes and has no code.
        let mut startup = Vec::new();
        let body = [196608u32.to_be_bytes().to_vec(), cstr("user"), cstr("app")].concat();
        startup.extend_from_slice(&((body.len() as u32 + 4).to_be_bytes()));
        startup.extend_from_slice(&body);
        let mut cursor = startup.as_slice();
        let read = read_startup_frame(&mut cursor, 1024).await.expect("frame");
        assert_eq!(startup_request_code(&read), None);
    }

    #[test]
    fn parse_parse_extracts_name_and_query() {
        let payload = [
            cstr("stmt_1"),
            cstr("SELECT id FROM users WHERE id = $1"),
            vec![0, 0],
        ]
        .concat();
        let (name, query) = parse_parse(&payload).expect("parse");
        assert_eq!(name, "stmt_1");
        assert_eq!(query, "SELECT id FROM users WHERE id = $1");
    }

    #[test]
    fn parse_bind_extracts_statement_and_args() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&cstr("")); // portal
        payload.extend_from_slice(&cstr("stmt_1"));
        payload.extend_from_slice(&0u16.to_be_bytes()); // no format codes
        payload.extend_from_slice(&3u16.to_be_bytes()); // three parameters
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // NULL
        payload.extend_from_slice(&5i32.to_be_bytes());
        payload.extend_from_slice(b"alice");
        payload.extend_from_slice(&0u16.to_be_bytes()); // result formats

        let bind = parse_bind(&payload).expect("bind");
        assert_eq!(bind.statement, "stmt_1");
        assert_eq!(bind.args, vec!["42".to_string(), String::new(), "alice".to_string()]);
    }

    #[test]
    fn parse_bind_rejects_truncated_values() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&cstr(""));
        payload.extend_from_slice(&cstr("s"));
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&100i32.to_be_bytes()); // longer than remaining
        payload.extend_from_slice(b"short");
        assert!(parse_bind(&payload).is_none());
    }

    #[test]
    fn rows_affected_from_command_tags() {
        assert_eq!(parse_rows_affected(&cstr("INSERT 0 5")), 5);
        assert_eq!(parse_rows_affected(&cstr("SELECT 3")), 3);
        assert_eq!(parse_rows_affected(&cstr("UPDATE 10")), 10);
        assert_eq!(parse_rows_affected(&cstr("BEGIN")), 0);
    }

    #[test]
    fn error_message_field_is_extracted() {
        let payload = [
            b"SERROR\0".to_vec(),
            b"C42P01\0".to_vec(),
            b"Mrelation \"_nonexistent\" does not exist\0".to_vec(),
            vec![0],
        ]
        .concat();
        assert_eq!(
            parse_error_message(&payload),
            "relation \"_nonexistent\" does not exist"
        );
    }

    #[test]
    fn close_statement_payload() {
        let payload = [vec![b'S'], cstr("stmt_1")].concat();
        assert_eq!(parse_close(&payload), Some((b'S', "stmt_1".to_string())));
    }
}
