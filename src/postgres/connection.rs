use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::message::{backend, frontend};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::replication::ReplicationStream;
use super::types::Lsn;
use crate::config::PostgresConfig;
use crate::{Error, Result};

/// Frame header: one tag byte and a length that counts itself.
const HEADER_LEN: usize = 5;

/// A PostgreSQL connection opened in logical replication mode
/// (`replication=database`), speaking the simple query protocol.
pub struct PgConnection {
    stream: TcpStream,
    buffer: BytesMut,
    database: String,
}

/// Outcome of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotCreation {
    Created {
        /// Name of the exported snapshot, valid until the next command on this connection.
        snapshot: String,
        consistent_point: Lsn,
    },
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// One row of a simple query result, every value in text form.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)?.as_deref()
    }
}

impl PgConnection {
    pub async fn connect(params: &PostgresConfig) -> Result<Self> {
        let addr = format!("{}:{}", params.host, params.port);
        debug!(addr = %addr, user = %params.username, "connecting to PostgreSQL");

        let stream = timeout(params.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {}", addr),
            })?
            .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
            database: params.database.clone(),
        };

        timeout(params.connect_timeout(), conn.startup(params))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("authenticating with {}", addr),
            })??;

        info!(addr = %addr, database = %params.database, "connected in replication mode");
        Ok(conn)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn startup(&mut self, params: &PostgresConfig) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", params.username.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", "pg-river"),
            ],
            &mut buf,
        )?;
        self.send(&buf).await?;

        self.authenticate(&params.username, &params.password).await?;

        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'Z' => return Ok(()),
                b'E' => return Err(server_error(&frame[HEADER_LEN..])),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => continue,
            }
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let mut frame = self.read_frame().await?;
            if frame[0] == b'E' {
                return Err(match server_error(&frame[HEADER_LEN..]) {
                    Error::Server { code, message } => {
                        Error::Authentication(format!("{} ({})", message, code))
                    }
                    other => other,
                });
            }

            let message = backend::Message::parse(&mut frame)?
                .ok_or_else(|| Error::Protocol("truncated authentication message".to_string()))?;

            let mut buf = BytesMut::new();
            match message {
                backend::Message::AuthenticationOk => {
                    debug!("authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let supported = body.mechanisms().any(|m| Ok(m == SCRAM_SHA_256))?;
                    if !supported {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".to_string(),
                        ));
                    }
                    let state = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, state.message(), &mut buf)?;
                    scram = Some(state);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL continue without initial response".to_string())
                    })?;
                    state
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(state.message(), &mut buf)?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL final without initial response".to_string())
                    })?;
                    state
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    continue;
                }
                _ => {
                    return Err(Error::Authentication(
                        "unsupported authentication method requested".to_string(),
                    ))
                }
            }
            self.send(&buf).await?;
        }
    }

    /// Runs a command through the simple query protocol and collects its rows.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        debug!(query = %query, "simple query");
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.send(&buf).await?;

        let mut columns = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let mut frame = self.read_frame().await?;
            match frame[0] {
                b'Z' => break,
                b'E' => failure = Some(server_error(&frame[HEADER_LEN..])),
                b'T' => {
                    if let Some(backend::Message::RowDescription(body)) =
                        backend::Message::parse(&mut frame)?
                    {
                        let names: Vec<String> =
                            body.fields().map(|f| Ok(f.name().to_string())).collect()?;
                        columns = Arc::new(names);
                    }
                }
                b'D' => {
                    if let Some(backend::Message::DataRow(body)) =
                        backend::Message::parse(&mut frame)?
                    {
                        let data = body.buffer();
                        let values: Vec<Option<String>> = body
                            .ranges()
                            .map(|r| Ok(r.map(|r| String::from_utf8_lossy(&data[r]).into_owned())))
                            .collect()?;
                        rows.push(SimpleRow {
                            columns: Arc::clone(&columns),
                            values,
                        });
                    }
                }
                b'W' => {
                    return Err(Error::Protocol(format!(
                        "'{}' unexpectedly entered copy mode",
                        query
                    )))
                }
                // CommandComplete, EmptyQueryResponse, NoticeResponse
                _ => continue,
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string()))?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or_default().to_string(),
            timeline: row
                .get("timeline")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1),
            xlogpos: row.get("xlogpos").unwrap_or("0/0").parse()?,
            dbname: row.get("dbname").map(str::to_string),
        };
        debug!(?info, "system identified");
        Ok(info)
    }

    /// Creates a `test_decoding` slot, exporting a snapshot of the slot's
    /// consistent point. An existing slot is not an error.
    pub async fn create_replication_slot(&mut self, slot: &str) -> Result<SlotCreation> {
        let query = format!("CREATE_REPLICATION_SLOT {} LOGICAL test_decoding", slot);
        let rows = match self.simple_query(&query).await {
            Ok(rows) => rows,
            Err(e) if e.is_duplicate_object() => {
                info!(slot = %slot, "replication slot already exists");
                return Ok(SlotCreation::AlreadyExists);
            }
            Err(e) => return Err(e),
        };

        let row = rows.first().ok_or_else(|| {
            Error::Protocol("CREATE_REPLICATION_SLOT returned no rows".to_string())
        })?;
        let snapshot = row.get("snapshot_name").unwrap_or_default().to_string();
        let consistent_point = row.get("consistent_point").unwrap_or("0/0").parse()?;

        info!(
            slot = %slot,
            consistent_point = %consistent_point,
            snapshot = %snapshot,
            "created replication slot"
        );
        Ok(SlotCreation::Created {
            snapshot,
            consistent_point,
        })
    }

    /// Drops a slot. A missing slot is not an error.
    pub async fn drop_replication_slot(&mut self, slot: &str) -> Result<()> {
        let query = format!("DROP_REPLICATION_SLOT {}", slot);
        match self.simple_query(&query).await {
            Ok(_) => {
                info!(slot = %slot, "dropped replication slot");
                Ok(())
            }
            Err(e) if e.is_undefined_object() => {
                warn!(slot = %slot, "replication slot does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Issues `START_REPLICATION` and hands the socket over to the copy stream.
    pub async fn start_replication(mut self, slot: &str, lsn: Lsn) -> Result<ReplicationStream> {
        let query = format!("START_REPLICATION SLOT {} LOGICAL {}", slot, lsn);
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.send(&buf).await?;

        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'W' => break,
                b'E' => return Err(server_error(&frame[HEADER_LEN..])),
                b'N' => continue,
                tag => {
                    return Err(Error::Protocol(format!(
                        "unexpected message '{}' after START_REPLICATION",
                        tag as char
                    )))
                }
            }
        }

        info!(slot = %slot, lsn = %lsn, "replication streaming started");
        Ok(ReplicationStream::new(self.stream, self.buffer))
    }

    /// Sends Terminate and shuts the socket down.
    pub async fn close(mut self) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.send(&buf).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<BytesMut> {
        read_frame(&mut self.stream, &mut self.buffer).await
    }
}

/// Reads one complete backend frame (tag, length and body) from `reader`.
///
/// Bytes past the frame stay in `buffer` for the next call.
pub(crate) async fn read_frame<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    loop {
        if buffer.len() >= HEADER_LEN {
            let len = i32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
            if len < 4 {
                return Err(Error::invalid_message(format!(
                    "frame length {} is too small",
                    len
                )));
            }
            let total = 1 + len as usize;
            if buffer.len() >= total {
                return Ok(buffer.split_to(total));
            }
            buffer.reserve(total - buffer.len());
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return Err(Error::Connection(
                "connection closed by server".to_string(),
            ));
        }
    }
}

/// Builds [`Error::Server`] from the fields of an ErrorResponse body.
pub(crate) fn server_error(body: &[u8]) -> Error {
    let mut code = String::new();
    let mut message = String::new();

    let mut rest = body;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]);
        match field {
            b'C' => code = value.into_owned(),
            b'M' => message = value.into_owned(),
            _ => {}
        }
        rest = tail.get(end + 1..).unwrap_or_default();
    }

    Error::Server { code, message }
}
