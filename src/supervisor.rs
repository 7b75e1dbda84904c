//! One capture unit: a replication slot feeding its own buffer, scheduler
//! and sinks.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DispatchConfig, OutputConfig, PostgresConfig, ReplicationConfig, TableConfig};
use crate::dispatch::DispatchScheduler;
use crate::pool::RecordPool;
use crate::postgres::{ReplicationPosition, ReplicationSession, SessionEvent, WalDecoder};
use crate::rules::{CaptureRule, RuleMatcher};
use crate::sink::{build_sinks, Sink};
use crate::snapshot::SnapshotBootstrapper;
use crate::transaction::TransactionBuffer;
use crate::{Error, Result};

pub struct StreamSupervisor {
    table: TableConfig,
    postgres: PostgresConfig,
    replication: ReplicationConfig,
    dispatch: DispatchConfig,
    output: OutputConfig,
    /// Set when existing rows are exported after a fresh slot creation.
    dump_path: Option<PathBuf>,
    sinks: Option<Vec<Box<dyn Sink>>>,
    shutdown: CancellationToken,
}

impl StreamSupervisor {
    pub fn new(
        config: &Config,
        table: TableConfig,
        dump_path: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            postgres: config.postgres.clone(),
            replication: config.replication.clone(),
            dispatch: config.dispatch.clone(),
            output: config.output.clone(),
            dump_path,
            sinks: None,
            shutdown,
        }
    }

    /// Delivers to `sinks` instead of the ones named by the table's routing list.
    pub fn with_sinks(mut self, sinks: Vec<Box<dyn Sink>>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn slot(&self) -> &str {
        &self.table.slot_name
    }

    /// Runs until the shutdown token is cancelled.
    ///
    /// Only setup failures are returned: the initial connection, slot
    /// creation, the historical export and the first START_REPLICATION.
    /// Later transport errors are retried by the session.
    pub async fn run(mut self) -> Result<()> {
        let rule = CaptureRule::from_table(&self.table);
        let sinks = match self.sinks.take() {
            Some(sinks) => sinks,
            None => build_sinks(&self.table.sinks, &self.output, &rule)?,
        };
        if sinks.is_empty() {
            warn!(table = %self.table.name, slot = %self.table.slot_name, "no sinks configured, skipping table");
            return Ok(());
        }

        info!(
            table = %self.table.name,
            slot = %self.table.slot_name,
            sinks = ?sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "starting stream"
        );

        let pool = Arc::new(RecordPool::new(self.dispatch.pool_capacity));
        let position = Arc::new(ReplicationPosition::new());
        let acknowledged = Arc::clone(&position);
        let scheduler = DispatchScheduler::start(
            sinks,
            &self.dispatch,
            Arc::clone(&pool),
            Box::new(move |lsn| acknowledged.acknowledge(lsn)),
        );

        let mut buffer = TransactionBuffer::new(
            RuleMatcher::new(vec![rule]),
            scheduler.handle(),
            Arc::clone(&pool),
            self.replication.max_transaction_records,
        );
        let decoder = WalDecoder::new(Arc::clone(&pool));
        let mut session = ReplicationSession::new(
            self.postgres.clone(),
            self.table.slot_name.clone(),
            self.replication.clone(),
            position,
            self.shutdown.clone(),
        );

        let result = match self.open(&mut session, &mut buffer, &pool).await {
            Ok(()) => self.receive(&mut session, &mut buffer, &decoder).await,
            Err(e) => Err(e),
        };

        // Uncommitted records never reach a sink.
        let discarded = buffer.discard();
        if discarded > 0 {
            debug!(slot = %self.table.slot_name, records = discarded, "discarded uncommitted records");
        }

        session.stop_heartbeat().await;
        if let Err(e) = scheduler.stop().await {
            error!(slot = %self.table.slot_name, error = %e, "dispatch scheduler did not stop cleanly");
        }
        if let Err(e) = session.send_status().await {
            debug!(slot = %self.table.slot_name, error = %e, "final standby status not sent");
        }
        session.stop().await;

        match result {
            Ok(()) | Err(Error::Shutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn open(
        &self,
        session: &mut ReplicationSession,
        buffer: &mut TransactionBuffer,
        pool: &Arc<RecordPool>,
    ) -> Result<()> {
        session.connect().await?;
        let snapshot = session.ensure_slot().await?;

        match (snapshot, &self.dump_path) {
            (Some(snapshot), Some(dump_path)) => {
                let bootstrapper = SnapshotBootstrapper::new(
                    dump_path.clone(),
                    self.postgres.clone(),
                    vec![self.table.name.clone()],
                    Arc::clone(pool),
                );
                let rows = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
                    rows = bootstrapper.run(&snapshot, buffer) => rows?,
                };
                info!(slot = %self.table.slot_name, rows, "historical rows exported");
            }
            (Some(_), None) => {
                debug!(slot = %self.table.slot_name, "slot created, historical export disabled");
            }
            (None, _) => {
                debug!(slot = %self.table.slot_name, "slot already exists, resuming");
            }
        }

        session.start_streaming().await?;
        session.spawn_heartbeat();
        info!(slot = %self.table.slot_name, "streaming started");
        Ok(())
    }

    async fn receive(
        &self,
        session: &mut ReplicationSession,
        buffer: &mut TransactionBuffer,
        decoder: &WalDecoder,
    ) -> Result<()> {
        loop {
            match session.next_wal_message().await? {
                SessionEvent::Wal(message) => {
                    let record = match decoder.decode(&message.data, message.position) {
                        Ok(Some(record)) => record,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(
                                slot = %self.table.slot_name,
                                lsn = %message.position,
                                error = %e,
                                "skipping undecodable change"
                            );
                            continue;
                        }
                    };
                    // The intake blocks while a failing sink holds it full.
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
                        pushed = buffer.push(record) => {
                            pushed?;
                        }
                    }
                }
                SessionEvent::Reconnected => {
                    let discarded = buffer.discard();
                    if discarded > 0 {
                        info!(
                            slot = %self.table.slot_name,
                            records = discarded,
                            "discarded partial transaction after reconnect"
                        );
                    }
                }
            }
        }
    }
}
