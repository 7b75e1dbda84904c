#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use pg_river::config::{
    CaptureConfig, Config, DispatchConfig, OutputConfig, PostgresConfig, ReplicationConfig,
    SinkKind, TableConfig,
};
use pg_river::dispatch::Batch;
use pg_river::postgres::{ChangeRecord, Lsn};
use pg_river::sink::Sink;
use std::collections::{HashSet, VecDeque};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_SYSTEM_ID: &str = "7291786540123456789";

/// One scripted server action during a START_REPLICATION stream.
#[derive(Debug, Clone)]
pub enum Frame {
    XLogData { start: u64, end: u64, data: String },
    Keepalive { end: u64, reply: bool },
    Pause(Duration),
    /// Drops the connection.
    Close,
}

impl Frame {
    pub fn wal(start: u64, data: impl Into<String>) -> Self {
        Frame::XLogData {
            start,
            end: start + 8,
            data: data.into(),
        }
    }
}

/// A standby status update received from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
}

#[derive(Default)]
pub struct ServerState {
    pub slots: Mutex<HashSet<String>>,
    pub queries: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<StatusUpdate>>,
    /// Start position of every START_REPLICATION, in order.
    pub start_positions: Mutex<Vec<Lsn>>,
    scripts: Mutex<VecDeque<Vec<Frame>>>,
}

impl ServerState {
    pub fn last_status(&self) -> Option<StatusUpdate> {
        self.statuses.lock().last().copied()
    }
}

/// An in-process server speaking enough of the replication protocol for the
/// engine: trust authentication, IDENTIFY_SYSTEM, slot management and a
/// scripted CopyBoth stream per START_REPLICATION.
pub struct FakeServer {
    addr: SocketAddr,
    pub state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state, task }
    }

    /// Queues the frames sent by the next START_REPLICATION.
    pub fn script(&self, frames: Vec<Frame>) {
        self.state.scripts.lock().push_back(frames);
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            database: "shop".to_string(),
            username: "replicator".to_string(),
            password: String::new(),
            connect_timeout_secs: 5,
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, state: Arc<ServerState>) {
    let _ = socket.set_nodelay(true);
    let (mut read, mut write) = socket.into_split();

    if read_startup(&mut read).await.is_none() {
        return;
    }
    let mut out = BytesMut::new();
    message(&mut out, b'R', |b| b.put_i32(0));
    message(&mut out, b'S', |b| {
        put_cstr(b, "server_version");
        put_cstr(b, "16.2");
    });
    ready_for_query(&mut out);
    if write.write_all(&out).await.is_err() {
        return;
    }

    while let Some((tag, mut body)) = read_message(&mut read).await {
        match tag {
            b'Q' => {
                let query = take_cstr(&mut body);
                state.queries.lock().push(query.clone());
                let mut out = BytesMut::new();

                if query.starts_with("START_REPLICATION") {
                    let start = query
                        .rsplit(' ')
                        .next()
                        .and_then(|lsn| lsn.parse::<Lsn>().ok())
                        .unwrap_or(Lsn::ZERO);
                    state.start_positions.lock().push(start);

                    message(&mut out, b'W', |b| {
                        b.put_i8(0);
                        b.put_i16(0);
                    });
                    if write.write_all(&out).await.is_err() {
                        return;
                    }
                    let frames = state.scripts.lock().pop_front().unwrap_or_default();
                    stream(read, write, frames, state).await;
                    return;
                }

                respond(&query, &state, &mut out);
                if write.write_all(&out).await.is_err() {
                    return;
                }
            }
            b'X' => return,
            _ => {}
        }
    }
}

fn respond(query: &str, state: &ServerState, out: &mut BytesMut) {
    let words: Vec<&str> = query.split_whitespace().collect();
    match words.as_slice() {
        ["IDENTIFY_SYSTEM"] => {
            row_description(out, &["systemid", "timeline", "xlogpos", "dbname"]);
            data_row(out, &[Some(TEST_SYSTEM_ID), Some("1"), Some("0/16B3748"), Some("shop")]);
            command_complete(out, "IDENTIFY_SYSTEM");
        }
        ["CREATE_REPLICATION_SLOT", slot, ..] => {
            if state.slots.lock().insert(slot.to_string()) {
                row_description(
                    out,
                    &["slot_name", "consistent_point", "snapshot_name", "output_plugin"],
                );
                data_row(
                    out,
                    &[Some(*slot), Some("0/16B3780"), Some("00000003-00000002-1"), Some("test_decoding")],
                );
                command_complete(out, "CREATE_REPLICATION_SLOT");
            } else {
                error_response(out, "42710", &format!("replication slot \"{}\" already exists", slot));
            }
        }
        ["DROP_REPLICATION_SLOT", slot, ..] => {
            if state.slots.lock().remove(*slot) {
                command_complete(out, "DROP_REPLICATION_SLOT");
            } else {
                error_response(out, "42704", &format!("replication slot \"{}\" does not exist", slot));
            }
        }
        _ => error_response(out, "42601", "syntax error"),
    }
    ready_for_query(out);
}

async fn stream(
    read: OwnedReadHalf,
    mut write: tokio::net::tcp::OwnedWriteHalf,
    frames: Vec<Frame>,
    state: Arc<ServerState>,
) {
    let reader = tokio::spawn(read_statuses(read, Arc::clone(&state)));

    for frame in frames {
        let mut out = BytesMut::new();
        match frame {
            Frame::XLogData { start, end, data } => message(&mut out, b'd', |b| {
                b.put_u8(b'w');
                b.put_u64(start);
                b.put_u64(end);
                b.put_i64(0);
                b.put_slice(data.as_bytes());
            }),
            Frame::Keepalive { end, reply } => message(&mut out, b'd', |b| {
                b.put_u8(b'k');
                b.put_u64(end);
                b.put_i64(0);
                b.put_u8(u8::from(reply));
            }),
            Frame::Pause(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            Frame::Close => {
                reader.abort();
                return;
            }
        }
        if write.write_all(&out).await.is_err() {
            reader.abort();
            return;
        }
    }

    let _ = reader.await;
}

async fn read_statuses(mut read: OwnedReadHalf, state: Arc<ServerState>) {
    while let Some((tag, mut body)) = read_message(&mut read).await {
        match tag {
            b'd' if body.first() == Some(&b'r') && body.len() >= 34 => {
                body.advance(1);
                let status = StatusUpdate {
                    received: Lsn(body.get_u64()),
                    flushed: Lsn(body.get_u64()),
                    applied: Lsn(body.get_u64()),
                };
                state.statuses.lock().push(status);
            }
            b'c' | b'X' => return,
            _ => {}
        }
    }
}

async fn read_startup<R: AsyncRead + Unpin>(read: &mut R) -> Option<BytesMut> {
    let len = read.read_i32().await.ok()?;
    let mut body = BytesMut::zeroed((len as usize).checked_sub(4)?);
    read.read_exact(&mut body).await.ok()?;
    Some(body)
}

async fn read_message<R: AsyncRead + Unpin>(read: &mut R) -> Option<(u8, BytesMut)> {
    let tag = read.read_u8().await.ok()?;
    let len = read.read_i32().await.ok()?;
    let mut body = BytesMut::zeroed((len as usize).checked_sub(4)?);
    read.read_exact(&mut body).await.ok()?;
    Some((tag, body))
}

fn message(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::new();
    body(&mut payload);
    out.put_u8(tag);
    out.put_i32(payload.len() as i32 + 4);
    out.put_slice(&payload);
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn take_cstr(body: &mut BytesMut) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn ready_for_query(out: &mut BytesMut) {
    message(out, b'Z', |b| b.put_u8(b'I'));
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    message(out, b'C', |b| put_cstr(b, tag));
}

fn row_description(out: &mut BytesMut, names: &[&str]) {
    message(out, b'T', |b| {
        b.put_i16(names.len() as i16);
        for name in names {
            put_cstr(b, name);
            b.put_i32(0);
            b.put_i16(0);
            b.put_i32(25);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    });
}

fn data_row(out: &mut BytesMut, values: &[Option<&str>]) {
    message(out, b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v.as_bytes());
                }
                None => b.put_i32(-1),
            }
        }
    });
}

fn error_response(out: &mut BytesMut, code: &str, text: &str) {
    message(out, b'E', |b| {
        b.put_u8(b'S');
        put_cstr(b, "ERROR");
        b.put_u8(b'C');
        put_cstr(b, code);
        b.put_u8(b'M');
        put_cstr(b, text);
        b.put_u8(0);
    });
}

/// Keeps a copy of every record it is handed.
#[derive(Clone, Default)]
pub struct CollectingSink {
    pub records: Arc<Mutex<Vec<ChangeRecord>>>,
}

impl CollectingSink {
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    fn name(&self) -> &str {
        "collect"
    }

    async fn write(&self, batch: &Batch) -> pg_river::Result<()> {
        self.records.lock().extend(batch.records().iter().cloned());
        Ok(())
    }
}

/// Rejects every batch, counting the attempts.
#[derive(Clone, Default)]
pub struct FailingSink {
    pub attempts: Arc<Mutex<usize>>,
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn write(&self, _batch: &Batch) -> pg_river::Result<()> {
        *self.attempts.lock() += 1;
        Err(pg_river::Error::Sink {
            sink: "failing".to_string(),
            message: "unavailable".to_string(),
        })
    }
}

/// Polls `condition` every 10ms, giving up after `timeout`.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn table_config(name: &str, slot: &str) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        slot_name: slot.to_string(),
        primary_key: "id".to_string(),
        columns: Vec::new(),
        sinks: vec![SinkKind::Stdout],
        index: None,
        topic: None,
        id_fields: Vec::new(),
    }
}

/// Configuration for a single table with fast timers.
pub fn test_config(postgres: PostgresConfig, table: TableConfig) -> Config {
    Config {
        postgres,
        capture: CaptureConfig {
            dump_path: None,
            historical: false,
            tables: vec![table],
        },
        replication: ReplicationConfig {
            heartbeat_interval_secs: 1,
            reconnect_delay_secs: 0,
            ..Default::default()
        },
        dispatch: DispatchConfig {
            flush_interval_ms: 10,
            ..Default::default()
        },
        output: OutputConfig::default(),
    }
}

/// Connection parameters of a live server, from `TEST_PG_*` variables.
pub fn live_postgres_config() -> PostgresConfig {
    PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    }
}
