//! Batches committed records and delivers them to the sinks of a stream.
//!
//! Records arrive through a bounded intake as whole transactions (or
//! overflow chunks of one). The scheduler accumulates them and flushes when
//! the queue reaches the batch size or the flush interval elapses. A batch
//! is delivered to every sink in order; only when all of them succeed is
//! its highest position acknowledged and its records returned to the pool.
//! A failed batch is kept and retried, unchanged, ahead of anything newer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::pool::RecordPool;
use crate::postgres::{ChangeRecord, Lsn};
use crate::sink::Sink;
use crate::{Error, Result};

/// Called with the highest position of every fully delivered batch.
pub type AckCallback = Box<dyn Fn(Lsn) + Send + Sync>;

/// An ordered unit of delivery.
#[derive(Debug)]
pub struct Batch {
    records: Vec<ChangeRecord>,
    max_position: Lsn,
}

impl Batch {
    pub fn new(records: Vec<ChangeRecord>) -> Self {
        let max_position = records
            .iter()
            .map(|r| r.position)
            .max()
            .unwrap_or(Lsn::ZERO);
        Self {
            records,
            max_position,
        }
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_position(&self) -> Lsn {
        self.max_position
    }

    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records
    }
}

/// Producer side of the scheduler intake.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Vec<ChangeRecord>>,
}

impl DispatchHandle {
    /// Hands a committed group of records to the scheduler, waiting while
    /// the intake is full.
    pub async fn commit(&self, records: Vec<ChangeRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.tx
            .send(records)
            .await
            .map_err(|_| Error::Dispatch("scheduler is not running".to_string()))
    }
}

pub struct DispatchScheduler {
    handle: DispatchHandle,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DispatchScheduler {
    /// Spawns the scheduler task.
    pub fn start(
        sinks: Vec<Box<dyn Sink>>,
        config: &DispatchConfig,
        pool: Arc<RecordPool>,
        on_ack: AckCallback,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            sinks,
            pool,
            on_ack,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_retries: config.max_retries,
            queue: Vec::new(),
            pending: None,
        };
        let task = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        Self {
            handle: DispatchHandle { tx },
            shutdown,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Drains the intake, makes a final delivery attempt and closes every sink.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Dispatch(format!("scheduler task failed: {}", e)))?;
        }
        Ok(())
    }
}

struct PendingBatch {
    batch: Batch,
    attempts: u32,
}

struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
    pool: Arc<RecordPool>,
    on_ack: AckCallback,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: Option<u32>,
    queue: Vec<ChangeRecord>,
    pending: Option<PendingBatch>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<ChangeRecord>>, shutdown: CancellationToken) {
        info!(
            sinks = self.sinks.len(),
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "dispatch scheduler started"
        );

        let timer = sleep(self.flush_interval);
        tokio::pin!(timer);

        loop {
            // While a failed batch waits for its retry, stop taking records
            // once a full batch is queued so the intake applies backpressure.
            let accepting = self.pending.is_none() || self.queue.len() < self.batch_size;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = &mut timer => {
                    self.flush().await;
                    timer.as_mut().reset(Instant::now() + self.flush_interval);
                }
                received = rx.recv(), if accepting => match received {
                    Some(records) => {
                        self.queue.extend(records);
                        if self.queue.len() >= self.batch_size && self.pending.is_none() {
                            self.flush().await;
                            timer.as_mut().reset(Instant::now() + self.flush_interval);
                        }
                    }
                    None => break,
                },
            }
        }

        rx.close();
        while let Ok(records) = rx.try_recv() {
            self.queue.extend(records);
        }
        self.drain().await;

        for sink in &self.sinks {
            sink.close().await;
        }
        info!("dispatch scheduler stopped");
    }

    /// Retries the pending batch, then delivers the queue.
    async fn flush(&mut self) {
        loop {
            let mut pending = match self.pending.take() {
                Some(pending) => pending,
                None if self.queue.is_empty() => return,
                None => PendingBatch {
                    batch: Batch::new(std::mem::take(&mut self.queue)),
                    attempts: 0,
                },
            };

            pending.attempts += 1;
            match self.deliver(&pending.batch).await {
                Ok(()) => self.complete(pending.batch),
                Err(e) => {
                    if self.max_retries.is_some_and(|max| pending.attempts > max) {
                        error!(
                            error = %e,
                            records = pending.batch.len(),
                            attempts = pending.attempts,
                            lsn = %pending.batch.max_position(),
                            "abandoning batch after exhausting retries"
                        );
                        self.complete(pending.batch);
                    } else {
                        warn!(
                            error = %e,
                            records = pending.batch.len(),
                            attempts = pending.attempts,
                            "batch delivery failed, will retry"
                        );
                        self.pending = Some(pending);
                        return;
                    }
                }
            }
        }
    }

    /// One last attempt for everything still held. Nothing is retried.
    async fn drain(&mut self) {
        let mut batches = Vec::new();
        if let Some(pending) = self.pending.take() {
            batches.push(pending.batch);
        }
        if !self.queue.is_empty() {
            batches.push(Batch::new(std::mem::take(&mut self.queue)));
        }

        for batch in batches {
            match self.deliver(&batch).await {
                Ok(()) => self.complete(batch),
                Err(e) => {
                    error!(
                        error = %e,
                        records = batch.len(),
                        "dropping undelivered batch at shutdown"
                    );
                    self.pool.release(batch.into_records());
                }
            }
        }
    }

    async fn deliver(&self, batch: &Batch) -> Result<()> {
        for sink in &self.sinks {
            sink.write(batch).await?;
        }
        debug!(
            records = batch.len(),
            lsn = %batch.max_position(),
            "batch delivered"
        );
        Ok(())
    }

    fn complete(&self, batch: Batch) {
        (self.on_ack)(batch.max_position());
        self.pool.release(batch.into_records());
    }
}
