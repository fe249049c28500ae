use std::{mem, num::NonZeroUsize};

use super::record::Record;

/// Groups accepted records into batches of exactly `batch_size`,
/// in arrival order. Only the final batch may be shorter.
pub struct BatchAccumulator {
    batch_size: usize,
    buffer: Vec<Record>,
    batches_emitted: u64,
    records_emitted: u64,
}

impl BatchAccumulator {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        let batch_size = batch_size.get();
        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            batches_emitted: 0,
            records_emitted: 0,
        }
    }

    /// Buffer `record`; returns a full batch once the threshold is reached.
    pub fn push(&mut self, record: Record) -> Option<Vec<Record>> {
        self.buffer.push(record);
        if self.buffer.len() < self.batch_size {
            return None;
        }
        // Records arrive one at a time, so a full buffer is exactly one batch.
        debug_assert_eq!(self.buffer.len(), self.batch_size);
        let batch = mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        Some(self.emit(batch))
    }

    /// Take whatever is left at end of stream. `None` when nothing is buffered.
    pub fn finish(&mut self) -> Option<Vec<Record>> {
        if self.buffer.is_empty() {
            return None;
        }
        let batch = mem::take(&mut self.buffer);
        Some(self.emit(batch))
    }

    /// Records buffered but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn batches_emitted(&self) -> u64 {
        self.batches_emitted
    }

    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    fn emit(&mut self, batch: Vec<Record>) -> Vec<Record> {
        self.batches_emitted += 1;
        self.records_emitted += batch.len() as u64;
        batch
    }
}
