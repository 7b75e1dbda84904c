//! Groups decoded records into transactions before dispatch.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::dispatch::DispatchHandle;
use crate::pool::RecordPool;
use crate::postgres::{ChangeRecord, Operation};
use crate::rules::RuleMatcher;
use crate::Result;

/// Holds the row changes of the in-flight transaction of one stream.
///
/// Records of tables no rule matches are returned to the pool on arrival.
/// The buffer is handed to the dispatcher on COMMIT, or early once it grows
/// past the threshold.
pub struct TransactionBuffer {
    matcher: RuleMatcher,
    dispatch: DispatchHandle,
    pool: Arc<RecordPool>,
    records: Vec<ChangeRecord>,
    threshold: usize,
}

impl TransactionBuffer {
    pub fn new(
        matcher: RuleMatcher,
        dispatch: DispatchHandle,
        pool: Arc<RecordPool>,
        threshold: usize,
    ) -> Self {
        Self {
            matcher,
            dispatch,
            pool,
            records: Vec::with_capacity(threshold.min(1024)),
            threshold,
        }
    }

    /// Buffers one record. Returns whether the buffer was flushed.
    pub async fn push(&mut self, mut record: ChangeRecord) -> Result<bool> {
        match record.operation {
            Operation::Begin | Operation::Unknown => {
                self.pool.release_one(record);
                Ok(false)
            }
            Operation::Commit => {
                self.pool.release_one(record);
                let flushed = !self.records.is_empty();
                self.flush().await?;
                Ok(flushed)
            }
            Operation::Insert | Operation::Update | Operation::Delete => {
                let Some(rule) = self.matcher.matches(&record.table) else {
                    trace!(table = %record.table, "skipping unmatched table");
                    self.pool.release_one(record);
                    return Ok(false);
                };

                rule.project(&mut record);
                record.matched_rule = Some(rule);
                self.records.push(record);

                if self.records.len() > self.threshold {
                    debug!(records = self.records.len(), "transaction exceeds threshold, flushing early");
                    self.flush().await?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    /// Hands everything buffered to the dispatcher.
    pub async fn flush(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let records = std::mem::replace(
            &mut self.records,
            Vec::with_capacity(self.threshold.min(1024)),
        );
        self.dispatch.commit(records).await
    }

    /// Drops the uncommitted records, returning how many there were.
    pub fn discard(&mut self) -> usize {
        let count = self.records.len();
        self.pool.release(self.records.drain(..));
        count
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
