//! Per-connection relay for the MySQL/TiDB dialect.
//!
//! # Purpose
//! Strips `CLIENT_SSL` and `CLIENT_DEPRECATE_EOF` from the handshake so the
//! session stays cleartext with classic EOF-terminated result sets, relays
//! authentication opaquely, then tracks a response state machine to finalize
//! each captured command when its terminator packet arrives.
//!
//! # Key invariants
//! - Packets are forwarded exactly as read; only handshake capability bytes
//!   are rewritten.
//! - All per-connection state (prepared statements, response state, pending
//!   event) lives behind one mutex shared by both relay directions.
use sqltap_common::{Event, Op};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::tx::TxTracker;
use crate::{is_closed, is_closed_io, EventSink, ProxyError, Result};

use super::wire;

// Where we are in parsing a server response sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResponseState {
    Idle,
    // Waiting for the first response to a command.
    FirstResp,
    // Reading column definitions of a result set.
    ColumnDefs,
    // Reading result-set rows.
    RowData,
    // Skipping param/column definition packets after COM_STMT_PREPARE_OK.
    SkipPrepare,
}

#[derive(Clone, Default)]
struct PreparedStatement {
    query: String,
    num_params: usize,
}

struct ConnState {
    next_id: u64,
    tx: TxTracker,
    prepared: HashMap<u32, PreparedStatement>,
    last_command: u8,
    last_query: String,
    state: ResponseState,
    skip_packets: usize,
    pending: Option<Event>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            next_id: 0,
            tx: TxTracker::mysql(),
            prepared: HashMap::new(),
            last_command: 0,
            last_query: String::new(),
            state: ResponseState::Idle,
            skip_packets: 0,
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

// The handshake starts server-side: the greeting arrives before the client
// says anything.
async fn relay_startup(
    mut client: TcpStream,
    mut upstream: TcpStream,
    max_frame: usize,
) -> Result<(TcpStream, TcpStream)> {
    let mut greeting = wire::read_packet(&mut upstream, max_frame).await?;
    wire::clear_capability_bits(&mut greeting, wire::CLIENT_SSL | wire::CLIENT_DEPRECATE_EOF);
    client.write_all(&greeting).await?;

    let mut response = wire::read_packet(&mut client, max_frame).await?;
    wire::clear_client_capability_bits(&mut response, wire::CLIENT_DEPRECATE_EOF);
    upstream.write_all(&response).await?;

    loop {
        let packet = wire::read_packet(&mut upstream, max_frame).await?;
        client.write_all(&packet).await?;

        match wire::payload_byte(&packet) {
            wire::OK_HEADER => return Ok((client, upstream)),
            wire::ERR_HEADER => return Err(ProxyError::AuthFailed),
            wire::AUTH_MORE_DATA => {
                // caching_sha2_password fast path: [0x01, 0x03] is followed
                // by an OK with no client response in between.
                let payload = wire::payload(&packet);
                if payload.len() >= 2 && payload[1] == wire::FAST_AUTH_SUCCESS {
                    continue;
                }
            }
            _ => {}
        }

        // Auth switch or continuation: the client answers, forward it.
        let client_response = wire::read_packet(&mut client, max_frame).await?;
        upstream.write_all(&client_response).await?;
    }
}

async fn pump_requests(
    mut from_client: OwnedReadHalf,
    mut to_upstream: OwnedWriteHalf,
    state: Arc<Mutex<ConnState>>,
    max_frame: usize,
) -> Result<()> {
    loop {
        let packet = match wire::read_packet(&mut from_client, max_frame).await {
            Ok(packet) => packet,
            Err(err) if is_closed(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        capture_request(&state, &packet);

        if let Err(err) = to_upstream.write_all(&packet).await {
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
        let packet = match wire::read_packet(&mut from_upstream, max_frame).await {
            Ok(packet) => packet,
            Err(err) if is_closed(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        capture_response(&state, &sink, &packet);

        if let Err(err) = to_client.write_all(&packet).await {
            if is_closed_io(&err) {
                return Ok(());
            }
            return Err(err.into());
        }
    }
}

fn capture_request(state: &Mutex<ConnState>, packet: &[u8]) {
    if wire::payload_len(packet) < 1 {
        return;
    }
    let payload = wire::payload(packet);
    let mut st = lock(state);

    match wire::payload_byte(packet) {
        wire::COM_QUERY => {
            let query = String::from_utf8_lossy(&payload[1..]).into_owned();
            st.last_command = wire::COM_QUERY;
            st.last_query = query.clone();
            st.state = ResponseState::FirstResp;

            let decision = st.tx.observe(&query, Op::Query);
            let id = st.next_event_id();
            let mut event = Event::new(id, decision.op, query);
            event.tx_id = decision.tx_id;
            st.pending = Some(event);
        }
        wire::COM_STMT_PREPARE => {
            // No event yet: the statement id only exists once the server
            // answers with COM_STMT_PREPARE_OK.
            st.last_command = wire::COM_STMT_PREPARE;
            st.last_query = String::from_utf8_lossy(&payload[1..]).into_owned();
            st.state = ResponseState::FirstResp;
        }
        wire::COM_STMT_EXECUTE => {
            st.last_command = wire::COM_STMT_EXECUTE;
            st.state = ResponseState::FirstResp;

            if payload.len() >= 5 {
                let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                let stmt = st.prepared.get(&stmt_id).cloned().unwrap_or_default();
                st.last_query = stmt.query.clone();

                let args = wire::parse_stmt_execute_args(payload, stmt.num_params);
                let decision = st.tx.observe(&stmt.query, Op::Execute);
                let id = st.next_event_id();
                let mut event = Event::new(id, decision.op, stmt.query);
                event.args = args;
                event.tx_id = decision.tx_id;
                st.pending = Some(event);
            }
        }
        wire::COM_STMT_CLOSE => {
            if payload.len() >= 5 {
                let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                st.prepared.remove(&stmt_id);
            }
        }
        _ => {}
    }
}

fn capture_response(state: &Mutex<ConnState>, sink: &EventSink, packet: &[u8]) {
    let mut st = lock(state);
    match st.state {
        ResponseState::Idle => {}

        ResponseState::FirstResp => handle_first_response(&mut st, sink, packet),

        ResponseState::ColumnDefs => {
            if wire::is_eof_packet(packet) {
                st.state = ResponseState::RowData;
            }
        }

        ResponseState::RowData => {
            if wire::is_eof_packet(packet) {
                // Rows affected stays zero for result sets.
                finalize(&mut st, sink, |_| {});
                st.state = ResponseState::Idle;
            } else if wire::payload_byte(packet) == wire::ERR_HEADER {
                finalize_error(&mut st, sink, packet);
                st.state = ResponseState::Idle;
            }
        }

        ResponseState::SkipPrepare => {
            st.skip_packets = st.skip_packets.saturating_sub(1);
            if st.skip_packets == 0 {
                st.state = ResponseState::Idle;
            }
        }
    }
}

fn handle_first_response(st: &mut ConnState, sink: &EventSink, packet: &[u8]) {
    let first = wire::payload_byte(packet);

    if first == wire::OK_HEADER && st.last_command != wire::COM_STMT_PREPARE {
        let payload = wire::payload(packet);
        finalize(st, sink, |event| {
            if payload.len() > 1 {
                if let Some((rows, _)) = wire::read_lenenc_int(payload, 1) {
                    event.rows_affected = rows as i64;
                }
            }
        });
        st.state = ResponseState::Idle;
    } else if first == wire::ERR_HEADER {
        finalize_error(st, sink, packet);
        st.state = ResponseState::Idle;
    } else if first == wire::OK_HEADER {
        handle_stmt_prepare_ok(st, packet);
    } else {
        // Column-count header of a result set.
        st.state = ResponseState::ColumnDefs;
    }
}

// COM_STMT_PREPARE_OK: status(1) + stmt_id(4) + num_columns(2) +
// num_params(2) + reserved(1) + warning_count(2). With DEPRECATE_EOF forced
// off, each following definition block ends with an EOF packet.
fn handle_stmt_prepare_ok(st: &mut ConnState, packet: &[u8]) {
    let payload = wire::payload(packet);
    if payload.len() < 12 {
        st.state = ResponseState::Idle;
        return;
    }

    let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let num_columns = u16::from_le_bytes([payload[5], payload[6]]) as usize;
    let num_params = u16::from_le_bytes([payload[7], payload[8]]) as usize;

    st.prepared.insert(
        stmt_id,
        PreparedStatement {
            query: st.last_query.clone(),
            num_params,
        },
    );

    let mut skip = 0;
    if num_params > 0 {
        skip += num_params + 1; // param definitions + EOF
    }
    if num_columns > 0 {
        skip += num_columns + 1; // column definitions + EOF
    }
    st.skip_packets = skip;
    st.state = if skip > 0 {
        ResponseState::SkipPrepare
    } else {
        ResponseState::Idle
    };
}

fn finalize(st: &mut ConnState, sink: &EventSink, fill: impl FnOnce(&mut Event)) {
    if let Some(mut event) = st.pending.take() {
        event.duration = event.start_time.elapsed().unwrap_or_default();
        fill(&mut event);
        sink.emit(event);
    }
}

// ERR_Packet: 0xFF + errno(2) + '#' + sqlstate(5) + message.
fn finalize_error(st: &mut ConnState, sink: &EventSink, packet: &[u8]) {
    let payload = wire::payload(packet);
    let message = if payload.len() > 9 && payload[3] == b'#' {
        String::from_utf8_lossy(&payload[9..]).into_owned()
    } else if payload.len() > 3 {
        String::from_utf8_lossy(&payload[3..]).into_owned()
    } else {
        String::new()
    };
    finalize(st, sink, |event| {
        event.error = message;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn query_packet(sql: &str) -> Vec<u8> {
        let mut p = vec![wire::COM_QUERY];
        p.extend_from_slice(sql.as_bytes());
        packet(0, &p)
    }

    fn ok_packet(affected_rows: u8) -> Vec<u8> {
        packet(1, &[wire::OK_HEADER, affected_rows, 0, 0, 0, 0, 0])
    }

    fn eof() -> Vec<u8> {
        packet(1, &[wire::EOF_HEADER, 0, 0, 2, 0])
    }

    fn new_state() -> Mutex<ConnState> {
        Mutex::new(ConnState::new())
    }

    #[tokio::test]
    async fn insert_finalizes_from_the_ok_packet() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);

        capture_request(&state, &query_packet("INSERT INTO t (id) VALUES (1),(2),(3)"));
        capture_response(&state, &sink, &ok_packet(3));

        let event = rx.try_recv().expect("event");
        assert_eq!(event.op, Op::Query);
        assert_eq!(event.rows_affected, 3);
        assert!(event.error.is_empty());
        assert_eq!(lock(&state).state, ResponseState::Idle);
    }

    #[tokio::test]
    async fn select_finalizes_on_the_closing_eof() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);

        capture_request(&state, &query_packet("SELECT id FROM t"));
        // Result set: column count, one column def, EOF, two rows, EOF.
        capture_response(&state, &sink, &packet(1, &[0x01]));
        capture_response(&state, &sink, &packet(2, &[3, b'd', b'e', b'f']));
        assert!(rx.try_recv().is_err(), "no event before column EOF");
        capture_response(&state, &sink, &eof());
        capture_response(&state, &sink, &packet(4, &[2, b'4', b'2']));
        capture_response(&state, &sink, &packet(5, &[2, b'4', b'3']));
        assert!(rx.try_recv().is_err(), "no event before row EOF");
        capture_response(&state, &sink, &eof());

        let event = rx.try_recv().expect("event");
        assert_eq!(event.query, "SELECT id FROM t");
        assert_eq!(event.rows_affected, 0);
    }

    #[tokio::test]
    async fn error_packet_with_sqlstate_marker() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);

        capture_request(&state, &query_packet("SELECT id FROM _nonexistent"));
        let mut err_payload = vec![wire::ERR_HEADER, 0x7A, 0x04, b'#'];
        err_payload.extend_from_slice(b"42S02");
        err_payload.extend_from_slice(b"Table '_nonexistent' doesn't exist");
        capture_response(&state, &sink, &packet(1, &err_payload));

        let event = rx.try_recv().expect("event");
        assert_eq!(event.error, "Table '_nonexistent' doesn't exist");
    }

    #[tokio::test]
    async fn prepare_execute_resolves_query_and_args() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);

        // COM_STMT_PREPARE makes no event.
        let mut prepare = vec![wire::COM_STMT_PREPARE];
        prepare.extend_from_slice(b"SELECT ? + ?");
        capture_request(&state, &packet(0, &prepare));
        assert!(lock(&state).pending.is_none());

        // COM_STMT_PREPARE_OK: stmt_id=1, 1 column, 2 params.
        let mut prepare_ok = vec![wire::OK_HEADER];
        prepare_ok.extend_from_slice(&1u32.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // num_columns
        prepare_ok.extend_from_slice(&2u16.to_le_bytes()); // num_params
        prepare_ok.push(0);
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());
        capture_response(&state, &sink, &packet(1, &prepare_ok));

        // Param defs + EOF + column defs + EOF are skipped: 2+1+1+1 = 5.
        assert_eq!(lock(&state).state, ResponseState::SkipPrepare);
        for _ in 0..5 {
            capture_response(&state, &sink, &packet(2, &[3, b'd', b'e', b'f']));
        }
        assert_eq!(lock(&state).state, ResponseState::Idle);

        // COM_STMT_EXECUTE with integers 1 and 2.
        let mut execute = vec![wire::COM_STMT_EXECUTE];
        execute.extend_from_slice(&1u32.to_le_bytes());
        execute.push(0);
        execute.extend_from_slice(&1u32.to_le_bytes());
        execute.push(0); // null bitmap
        execute.push(1); // new params bound
        execute.extend_from_slice(&[wire::TYPE_LONG, 0, wire::TYPE_LONG, 0]);
        execute.extend_from_slice(&1i32.to_le_bytes());
        execute.extend_from_slice(&2i32.to_le_bytes());
        capture_request(&state, &packet(0, &execute));

        // Binary result set terminates like the text one.
        capture_response(&state, &sink, &packet(1, &[0x01]));
        capture_response(&state, &sink, &eof());
        capture_response(&state, &sink, &packet(3, &[2, b'0', b'3']));
        capture_response(&state, &sink, &eof());

        let event = rx.try_recv().expect("event");
        assert_eq!(event.op, Op::Execute);
        assert_eq!(event.query, "SELECT ? + ?");
        assert_eq!(event.args, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn stmt_close_forgets_the_statement() {
        let state = new_state();
        lock(&state).prepared.insert(
            9,
            PreparedStatement {
                query: "SELECT 1".into(),
                num_params: 0,
            },
        );

        let mut close = vec![wire::COM_STMT_CLOSE];
        close.extend_from_slice(&9u32.to_le_bytes());
        capture_request(&state, &packet(0, &close));
        assert!(lock(&state).prepared.is_empty());
    }

    #[tokio::test]
    async fn begin_commit_group_events() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);

        capture_request(&state, &query_packet("BEGIN"));
        capture_response(&state, &sink, &ok_packet(0));
        capture_request(&state, &query_packet("SELECT 1"));
        capture_response(&state, &sink, &ok_packet(0));
        capture_request(&state, &query_packet("COMMIT"));
        capture_response(&state, &sink, &ok_packet(0));

        let begin = rx.try_recv().expect("begin");
        let select = rx.try_recv().expect("select");
        let commit = rx.try_recv().expect("commit");
        assert_eq!(begin.op, Op::Begin);
        assert!(!begin.tx_id.is_empty());
        assert_eq!(select.tx_id, begin.tx_id);
        assert_eq!(commit.op, Op::Commit);
        assert_eq!(commit.tx_id, begin.tx_id);
    }

    #[tokio::test]
    async fn idle_responses_are_ignored() {
        let state = new_state();
        let (sink, mut rx) = EventSink::bounded(8);
        capture_response(&state, &sink, &ok_packet(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(lock(&state).state, ResponseState::Idle);
    }
}
