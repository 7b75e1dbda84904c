use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::message::frontend;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::connection::{read_frame, server_error};
use super::types::Lsn;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01 UTC).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A CopyData payload sent by the server while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time: i64,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_message("empty copy data"));
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::invalid_message(format!(
                        "XLogData header needs 24 bytes, got {}",
                        data.remaining()
                    )));
                }
                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let server_time = data.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::invalid_message("Invalid keepalive message size"));
                }
                Ok(ReplicationMessage::Keepalive {
                    wal_end: Lsn(data.get_u64()),
                    server_time: data.get_i64(),
                    reply_requested: data.get_u8() != 0,
                })
            }
            _ => Err(Error::invalid_message(format!(
                "Unknown message tag: {}",
                tag
            ))),
        }
    }
}

/// Standby status update reporting how far the client has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// Status claiming `received` as written and `acknowledged` as flushed and applied.
    pub fn new(received: Lsn, acknowledged: Lsn) -> Self {
        Self {
            received,
            flushed: acknowledged,
            applied: acknowledged,
            reply_requested: false,
        }
    }

    /// Appends the status as a CopyData frame, timestamped now.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS;
        self.encode_at(now, buf)
    }

    pub fn encode_at(&self, pg_micros: i64, buf: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(self.received.as_u64());
        payload.put_u64(self.flushed.as_u64());
        payload.put_u64(self.applied.as_u64());
        payload.put_i64(pg_micros);
        payload.put_u8(u8::from(self.reply_requested));

        frontend::CopyData::new(payload.freeze())?.write(buf);
        Ok(())
    }
}

/// The socket of a connection that entered CopyBoth mode.
pub struct ReplicationStream {
    stream: TcpStream,
    buffer: BytesMut,
}

impl ReplicationStream {
    pub(crate) fn new(stream: TcpStream, buffer: BytesMut) -> Self {
        Self { stream, buffer }
    }

    /// Splits into an inbound half and an outbound half so status updates can
    /// be sent while a receive is pending.
    pub fn split(self) -> (ReplicationReader, StatusWriter) {
        let (read, write) = self.stream.into_split();
        (
            ReplicationReader {
                read,
                buffer: self.buffer,
            },
            StatusWriter {
                write,
                buf: BytesMut::with_capacity(64),
            },
        )
    }
}

pub struct ReplicationReader {
    read: OwnedReadHalf,
    buffer: BytesMut,
}

impl ReplicationReader {
    /// Next message from the server. The end of the copy stream is reported
    /// as a connection error.
    pub async fn recv(&mut self) -> Result<ReplicationMessage> {
        loop {
            let mut frame = read_frame(&mut self.read, &mut self.buffer).await?;
            let tag = frame[0];
            frame.advance(5);

            match tag {
                b'd' => {
                    let message = ReplicationMessage::parse(frame.freeze())?;
                    trace!(?message, "replication message");
                    return Ok(message);
                }
                b'c' => {
                    return Err(Error::Connection(
                        "server ended the replication stream".to_string(),
                    ))
                }
                b'E' => return Err(server_error(&frame)),
                b'N' => continue,
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message '{}' during replication",
                        tag as char
                    )))
                }
            }
        }
    }
}

pub struct StatusWriter {
    write: OwnedWriteHalf,
    buf: BytesMut,
}

impl StatusWriter {
    pub async fn send_status(&mut self, status: &StandbyStatus) -> Result<()> {
        self.buf.clear();
        status.encode(&mut self.buf)?;
        self.write.write_all(&self.buf).await?;
        self.write.flush().await?;
        debug!(
            received = %status.received,
            flushed = %status.flushed,
            "sent standby status"
        );
        Ok(())
    }

    /// Ends the copy stream and the session.
    pub async fn close(mut self) -> Result<()> {
        self.buf.clear();
        frontend::copy_done(&mut self.buf);
        frontend::terminate(&mut self.buf);
        self.write.write_all(&self.buf).await?;
        self.write.shutdown().await?;
        Ok(())
    }
}
