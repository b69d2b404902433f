//! Pre-allocated buffer that accumulates one batch

use crate::frame::RECORD_SEPARATOR;
use crate::types::Bet;

/// Rough size of one serialized bet, used to pre-size the buffer.
const BET_SIZE_HINT: usize = 64;

/// Upper bound of the pre-allocation (1MB); larger batches grow on demand.
const MAX_PREALLOC: usize = 1024 * 1024;

/// A batch being built.
///
/// Records are serialized straight into the batch bytes as they arrive, so
/// no bet outlives its own `push`. The batch is full once `capacity` valid
/// records were pushed; the caller then flushes it before pushing more.
pub struct BatchBuffer {
    buffer: Vec<u8>,
    count: usize,
    capacity: usize,
}

/// A finished batch: the joined records, still without their terminator,
/// and how many records it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub payload: Vec<u8>,
    pub count: usize,
}

impl BatchBuffer {
    /// Creates an empty batch that is full after `capacity` records.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(prealloc(capacity)),
            count: 0,
            capacity,
        }
    }

    /// Appends a bet; returns `true` when the batch is now full.
    pub fn push(&mut self, bet: &Bet) -> bool {
        if self.count > 0 {
            self.buffer.push(RECORD_SEPARATOR as u8);
        }
        self.buffer.extend_from_slice(bet.to_string().as_bytes());
        self.count += 1;
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Takes the accumulated records and resets the buffer. `None` if
    /// nothing was pushed.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.is_empty() {
            return None;
        }
        let payload = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(prealloc(self.capacity)),
        );
        let count = std::mem::take(&mut self.count);
        Some(Batch { payload, count })
    }
}

fn prealloc(capacity: usize) -> usize {
    capacity.saturating_mul(BET_SIZE_HINT).min(MAX_PREALLOC)
}
