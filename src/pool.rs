//! Free list of reusable [`ChangeRecord`]s.
//!
//! Decoding allocates a record per WAL message. At high volume the decoder
//! and the dispatcher hand records back and forth through this pool, so the
//! column vectors and strings keep their capacity instead of being freed and
//! reallocated per row.

use parking_lot::Mutex;

use crate::postgres::ChangeRecord;

pub struct RecordPool {
    free: Mutex<Vec<ChangeRecord>>,
    capacity: usize,
}

impl RecordPool {
    /// A pool retaining at most `capacity` idle records.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes a cleared record from the pool, or allocates one.
    pub fn acquire(&self) -> ChangeRecord {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Returns records once every sink is done with them.
    pub fn release<I>(&self, records: I)
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        let mut free = self.free.lock();
        for mut record in records {
            if free.len() >= self.capacity {
                break;
            }
            record.reset();
            free.push(record);
        }
    }

    pub fn release_one(&self, record: ChangeRecord) {
        self.release(std::iter::once(record));
    }

    /// Number of idle records.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for RecordPool {
    fn default() -> Self {
        Self::new(20_000)
    }
}
