// MySQL packet framing and the payload shapes the tap reads.
//
// Every packet is [3-byte little-endian payload length][1-byte sequence id]
// [payload]. Packets are kept as the raw bytes read off the socket; the only
// mutation anywhere is clearing capability bits during the handshake.
use crate::{ProxyError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

// Command bytes (first payload byte, client -> server).
pub(crate) const COM_QUERY: u8 = 0x03;
pub(crate) const COM_STMT_PREPARE: u8 = 0x16;
pub(crate) const COM_STMT_EXECUTE: u8 = 0x17;
pub(crate) const COM_STMT_CLOSE: u8 = 0x19;

// Response packet indicators (first payload byte, server -> client).
pub(crate) const OK_HEADER: u8 = 0x00;
pub(crate) const ERR_HEADER: u8 = 0xFF;
pub(crate) const EOF_HEADER: u8 = 0xFE;
pub(crate) const AUTH_MORE_DATA: u8 = 0x01;
pub(crate) const FAST_AUTH_SUCCESS: u8 = 0x03;

// Capability flags cleared during the handshake.
pub(crate) const CLIENT_SSL: u32 = 1 << 11;
pub(crate) const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

// Binary protocol field types.
pub(crate) const TYPE_TINY: u8 = 0x01;
pub(crate) const TYPE_SHORT: u8 = 0x02;
pub(crate) const TYPE_LONG: u8 = 0x03;
pub(crate) const TYPE_FLOAT: u8 = 0x04;
pub(crate) const TYPE_DOUBLE: u8 = 0x05;
pub(crate) const TYPE_NULL: u8 = 0x06;
pub(crate) const TYPE_LONGLONG: u8 = 0x08;
pub(crate) const TYPE_INT24: u8 = 0x09;
pub(crate) const TYPE_YEAR: u8 = 0x0d;

/// Read one packet, returning the raw bytes including the 4-byte header.
pub(crate) async fn read_packet<R>(r: &mut R, max: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    let len = usize::from(hdr[0]) | usize::from(hdr[1]) << 8 | usize::from(hdr[2]) << 16;
    // Validate the declared length before trusting it with an allocation.
    if len > max {
        return Err(ProxyError::FrameTooLarge { length: len, max });
    }
    let mut packet = BytesMut::zeroed(4 + len);
    packet[..4].copy_from_slice(&hdr);
    if len > 0 {
        r.read_exact(&mut packet[4..]).await?;
    }
    Ok(packet)
}

pub(crate) fn payload(packet: &[u8]) -> &[u8] {
    if packet.len() > 4 { &packet[4..] } else { &[] }
}

pub(crate) fn payload_len(packet: &[u8]) -> usize {
    packet.len().saturating_sub(4)
}

// First payload byte: the command on the client side, the packet type
// indicator on the server side.
pub(crate) fn payload_byte(packet: &[u8]) -> u8 {
    packet.get(4).copied().unwrap_or(0)
}

// An EOF packet is 0xFE with a payload shorter than 9 bytes; longer packets
// starting with 0xFE are row data using a length-encoded integer prefix.
pub(crate) fn is_eof_packet(packet: &[u8]) -> bool {
    payload_byte(packet) == EOF_HEADER && payload_len(packet) < 9
}

/// Length-encoded integer at `offset`, returning the value and the number of
/// bytes consumed. `None` on truncation or the 0xFB NULL marker.
pub(crate) fn read_lenenc_int(data: &[u8], offset: usize) -> Option<(u64, usize)> {
    let first = *data.get(offset)?;
    match first {
        b if b < 0xFB => Some((u64::from(b), 1)),
        0xFC => {
            let bytes = data.get(offset + 1..offset + 3)?;
            Some((u64::from(u16::from_le_bytes([bytes[0], bytes[1]])), 3))
        }
        0xFD => {
            let bytes = data.get(offset + 1..offset + 4)?;
            Some((
                u64::from(bytes[0]) | u64::from(bytes[1]) << 8 | u64::from(bytes[2]) << 16,
                4,
            ))
        }
        0xFE => {
            let bytes = data.get(offset + 1..offset + 9)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Some((u64::from_le_bytes(raw), 9))
        }
        _ => None,
    }
}

// Clear capability bits in a server greeting (HandshakeV10) in place.
//
// The greeting has a variable-length NUL-terminated server version string,
// so the capability offsets float:
//
//   payload[0]        protocol version
//   payload[1..NUL]   server version
//   base + 0..3       connection id
//   base + 4..11      auth-plugin-data part 1
//   base + 12         filler
//   base + 13..14     capability flags, lower 16 bits
//   base + 15         charset
//   base + 16..17     status flags
//   base + 18..19     capability flags, upper 16 bits
pub(crate) fn clear_capability_bits(packet: &mut [u8], bits: u32) {
    if packet.len() <= 4 {
        return;
    }
    let payload = &mut packet[4..];
    let Some(nul) = payload[1..].iter().position(|b| *b == 0) else {
        return;
    };
    let base = 1 + nul + 1;

    let lower_off = base + 13;
    if lower_off + 2 > payload.len() {
        return;
    }
    let lower = u16::from_le_bytes([payload[lower_off], payload[lower_off + 1]]);
    let lower = lower & !((bits & 0xFFFF) as u16);
    payload[lower_off..lower_off + 2].copy_from_slice(&lower.to_le_bytes());

    let upper_off = base + 18;
    if upper_off + 2 > payload.len() {
        return;
    }
    let upper = u16::from_le_bytes([payload[upper_off], payload[upper_off + 1]]);
    let upper = upper & !((bits >> 16) as u16);
    payload[upper_off..upper_off + 2].copy_from_slice(&upper.to_le_bytes());
}

// Clear capability bits in a client handshake response: the flags are the
// first four payload bytes.
pub(crate) fn clear_client_capability_bits(packet: &mut [u8], bits: u32) {
    if packet.len() < 8 {
        return;
    }
    let payload = &mut packet[4..];
    let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let caps = caps & !bits;
    payload[..4].copy_from_slice(&caps.to_le_bytes());
}

/// Parameter values from a COM_STMT_EXECUTE payload.
///
/// Layout after the command byte: stmt_id(4) + flags(1) + iteration_count(4),
/// then a NULL bitmap of ceil(num_params / 8) bytes, the new-params-bound
/// flag, and (when bound) the (type, unsigned) pairs followed by the values.
pub(crate) fn parse_stmt_execute_args(payload: &[u8], num_params: usize) -> Vec<String> {
    if num_params == 0 {
        return Vec::new();
    }

    let mut off = 10; // command(1) + stmt_id(4) + flags(1) + iteration_count(4)
    let bitmap_len = num_params.div_ceil(8);
    if off + bitmap_len + 1 > payload.len() {
        return Vec::new();
    }
    let null_bitmap = &payload[off..off + bitmap_len];
    off += bitmap_len;

    let bound_flag = payload[off];
    off += 1;

    let mut types = vec![0u8; num_params];
    if bound_flag == 1 {
        if off + num_params * 2 > payload.len() {
            return Vec::new();
        }
        for (i, slot) in types.iter_mut().enumerate() {
            // The second byte of each pair is the unsigned flag; the text
            // rendering ignores it.
            *slot = payload[off + i * 2];
        }
        off += num_params * 2;
    }

    let mut args = Vec::with_capacity(num_params);
    for (i, typ) in types.iter().enumerate() {
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            args.push("NULL".to_string());
            continue;
        }
        let (value, consumed) = read_binary_value(payload, off, *typ);
        args.push(value);
        off += consumed;
    }
    args
}

// One binary-encoded value at `off`, as (text rendering, bytes consumed).
fn read_binary_value(data: &[u8], off: usize, typ: u8) -> (String, usize) {
    fn le_bytes<const N: usize>(data: &[u8], off: usize) -> Option<[u8; N]> {
        let slice = data.get(off..off + N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(slice);
        Some(raw)
    }

    match typ {
        TYPE_TINY => match data.get(off) {
            Some(b) => ((*b as i8).to_string(), 1),
            None => ("?".to_string(), 0),
        },
        TYPE_SHORT | TYPE_YEAR => match le_bytes::<2>(data, off) {
            Some(raw) => (i16::from_le_bytes(raw).to_string(), 2),
            None => ("?".to_string(), 0),
        },
        TYPE_LONG | TYPE_INT24 => match le_bytes::<4>(data, off) {
            Some(raw) => (i32::from_le_bytes(raw).to_string(), 4),
            None => ("?".to_string(), 0),
        },
        TYPE_LONGLONG => match le_bytes::<8>(data, off) {
            Some(raw) => (i64::from_le_bytes(raw).to_string(), 8),
            None => ("?".to_string(), 0),
        },
        TYPE_FLOAT => match le_bytes::<4>(data, off) {
            Some(raw) => (f32::from_le_bytes(raw).to_string(), 4),
            None => ("?".to_string(), 0),
        },
        TYPE_DOUBLE => match le_bytes::<8>(data, off) {
            Some(raw) => (f64::from_le_bytes(raw).to_string(), 8),
            None => ("?".to_string(), 0),
        },
        TYPE_NULL => ("NULL".to_string(), 0),
        // Everything else (VARCHAR, BLOB, VAR_STRING, STRING, NEWDECIMAL,
        // ...) is a length-encoded string.
        _ => match read_lenenc_int(data, off) {
            Some((length, consumed)) => {
                let start = off + consumed;
                let end = start + length as usize;
                match data.get(start..end) {
                    Some(bytes) => (
                        String::from_utf8_lossy(bytes).into_owned(),
                        consumed + length as usize,
                    ),
                    None => ("?".to_string(), 0),
                }
            }
            None => ("?".to_string(), 0),
        },
    }
}
