use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{PgConnection, SlotCreation};
use super::replication::{ReplicationMessage, ReplicationReader, StandbyStatus, StatusWriter};
use super::types::Lsn;
use crate::config::{PostgresConfig, ReplicationConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    SlotEnsuring,
    Streaming,
    /// Waiting out the reconnect delay after a transport failure.
    Reconnecting,
    Stopped,
}

/// Received and acknowledged WAL positions of one stream.
///
/// Both only move forward. The acknowledged position is advanced by the
/// dispatcher once every sink has accepted a batch.
#[derive(Debug, Default)]
pub struct ReplicationPosition {
    received: AtomicU64,
    acknowledged: AtomicU64,
}

impl ReplicationPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Lsn {
        Lsn(self.received.load(Ordering::Acquire))
    }

    pub fn acknowledged(&self) -> Lsn {
        Lsn(self.acknowledged.load(Ordering::Acquire))
    }

    pub fn advance_received(&self, lsn: Lsn) {
        self.received.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    pub fn acknowledge(&self, lsn: Lsn) {
        self.acknowledged.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    pub fn standby_status(&self) -> StandbyStatus {
        StandbyStatus::new(self.received(), self.acknowledged())
    }
}

/// A change message together with the position it is attributed to.
#[derive(Debug, Clone)]
pub struct WalMessage {
    pub position: Lsn,
    pub data: Bytes,
}

#[derive(Debug)]
pub enum SessionEvent {
    Wal(WalMessage),
    /// The stream was re-established. The server resends every transaction
    /// not yet acknowledged, so partially received ones must be discarded.
    Reconnected,
}

type SharedWriter = Arc<Mutex<Option<StatusWriter>>>;

/// Owns the replication connection of one slot through its whole lifecycle.
pub struct ReplicationSession {
    params: PostgresConfig,
    slot: String,
    config: ReplicationConfig,
    state: SessionState,
    connection: Option<PgConnection>,
    reader: Option<ReplicationReader>,
    writer: SharedWriter,
    position: Arc<ReplicationPosition>,
    high_water: Lsn,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl ReplicationSession {
    pub fn new(
        params: PostgresConfig,
        slot: impl Into<String>,
        config: ReplicationConfig,
        position: Arc<ReplicationPosition>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            params,
            slot: slot.into(),
            config,
            state: SessionState::Disconnected,
            connection: None,
            reader: None,
            writer: Arc::new(Mutex::new(None)),
            position,
            high_water: Lsn::ZERO,
            heartbeat: None,
            shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn position(&self) -> &Arc<ReplicationPosition> {
        &self.position
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        match PgConnection::connect(&self.params).await {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Creates the slot if missing. Returns the exported snapshot name when
    /// the slot was created by this call.
    pub async fn ensure_slot(&mut self) -> Result<Option<String>> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Protocol("ensure_slot requires a connection".to_string()))?;
        self.state = SessionState::SlotEnsuring;

        match connection.create_replication_slot(&self.slot).await? {
            SlotCreation::Created { snapshot, .. } => Ok(Some(snapshot)),
            SlotCreation::AlreadyExists => Ok(None),
        }
    }

    /// Enters streaming mode from the last acknowledged position.
    pub async fn start_streaming(&mut self) -> Result<()> {
        let connection = self
            .connection
            .take()
            .ok_or_else(|| Error::Protocol("start_streaming requires a connection".to_string()))?;

        let start = self.position.acknowledged();
        let stream = match connection.start_replication(&self.slot, start).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
        };

        let (reader, writer) = stream.split();
        self.reader = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Starts the periodic standby status task. Ticks while the session is
    /// not streaming are skipped.
    pub fn spawn_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }

        let period = self.config.heartbeat_interval();
        let writer = Arc::clone(&self.writer);
        let position = Arc::clone(&self.position);
        let slot = self.slot.clone();
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let send = async {
                    let mut guard = writer.lock().await;
                    match guard.as_mut() {
                        Some(w) => w.send_status(&position.standby_status()).await,
                        None => Ok(()),
                    }
                };
                tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = send => {
                        if let Err(e) = sent {
                            // The receive loop notices the broken socket and reconnects.
                            warn!(slot = %slot, error = %e, "failed to send heartbeat status");
                        }
                    }
                }
            }
            debug!(slot = %slot, "heartbeat stopped");
        });

        self.heartbeat = Some((token, handle));
    }

    /// Sends a standby status with the current positions.
    pub async fn send_status(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send_status(&self.position.standby_status()).await,
            None => Err(Error::Protocol("session is not streaming".to_string())),
        }
    }

    /// Waits for the next change message, answering keepalives and
    /// reconnecting on transport failures along the way.
    ///
    /// Fails only with [`Error::Shutdown`] once the session is cancelled.
    pub async fn next_wal_message(&mut self) -> Result<SessionEvent> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                self.reconnect().await?;
                return Ok(SessionEvent::Reconnected);
            };

            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
                received = reader.recv() => received,
            };

            match received {
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    data,
                    ..
                }) => {
                    self.position.advance_received(wal_end);
                    // Interleaved transactions are streamed in commit order, so
                    // raw start positions can go backwards.
                    self.high_water = self.high_water.max(wal_start);
                    return Ok(SessionEvent::Wal(WalMessage {
                        position: self.high_water,
                        data,
                    }));
                }
                Ok(ReplicationMessage::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                }) => {
                    self.position.advance_received(wal_end);
                    if reply_requested {
                        if let Err(e) = self.send_status().await {
                            warn!(slot = %self.slot, error = %e, "failed to answer keepalive");
                            self.drop_stream().await;
                        }
                    }
                }
                Err(e) => {
                    warn!(slot = %self.slot, error = %e, "replication stream lost");
                    self.drop_stream().await;
                }
            }
        }
    }

    /// Reconnects after the configured delay until streaming resumes.
    pub async fn reconnect(&mut self) -> Result<()> {
        let delay = self.config.reconnect_delay();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.state = SessionState::Reconnecting;
            self.wait(delay).await?;

            match self.resume().await {
                Ok(()) => {
                    info!(
                        slot = %self.slot,
                        attempt,
                        lsn = %self.position.acknowledged(),
                        "replication stream resumed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(slot = %self.slot, attempt, error = %e, "reconnect failed");
                    self.connection = None;
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<()> {
        self.connect().await?;
        if self.ensure_slot().await?.is_some() {
            warn!(slot = %self.slot, "replication slot was recreated, its snapshot is not exported");
        }
        self.start_streaming().await
    }

    async fn wait(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn drop_stream(&mut self) {
        self.reader = None;
        self.writer.lock().await.take();
        self.state = SessionState::Disconnected;
    }

    pub async fn stop_heartbeat(&mut self) {
        if let Some((token, handle)) = self.heartbeat.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(slot = %self.slot, error = %e, "heartbeat task failed");
            }
        }
    }

    /// Stops the heartbeat, then closes the stream and the connection.
    /// Idempotent.
    pub async fn stop(&mut self) {
        self.stop_heartbeat().await;

        self.reader = None;
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!(slot = %self.slot, error = %e, "error closing replication stream");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(slot = %self.slot, error = %e, "error closing connection");
            }
        }

        self.state = SessionState::Stopped;
        info!(slot = %self.slot, "replication session stopped");
    }
}
