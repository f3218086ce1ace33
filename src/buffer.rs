//! Memory-bounded chunk buffers.

use rayon;

use crate::record::{Record, ESTIMATED_BYTES_PER_RECORD};

/// Default chunk memory budget in bytes (100 MiB).
pub const DEFAULT_CHUNK_BUDGET: u64 = 100 * 1024 * 1024;

/// Buffer builder.
pub trait ChunkBufferBuilder: Default {
    type Buffer: ChunkBuffer;

    /// Creates a new buffer.
    fn build(&self) -> Self::Buffer;
}

/// Base limited buffer interface.
pub trait ChunkBuffer: rayon::slice::ParallelSliceMut<Record> + Send {
    /// Adds a new record to the buffer.
    fn push(&mut self, record: Record);

    /// Returns buffer length.
    fn len(&self) -> usize;

    /// Checks if the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if the buffer reached the limit.
    fn is_full(&self) -> bool;

    /// Returns buffered records.
    fn as_slice(&self) -> &[Record];

    /// Drops buffered records keeping the allocation.
    fn clear(&mut self);

    /// Sorts buffered records in ascending order.
    /// Runs in parallel when called inside a rayon thread pool.
    fn sort(&mut self) {
        self.par_sort_unstable();
    }
}

/// Builds [`LimitedBuffer`]s holding at most `buffer_limit` records.
#[derive(Debug, Clone)]
pub struct LimitedBufferBuilder {
    buffer_limit: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    /// Creates a builder of buffers limited by records count.
    /// A zero limit is raised to one record.
    pub fn new(buffer_limit: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            buffer_limit: buffer_limit.max(1),
            preallocate,
        }
    }

    /// Creates a builder of buffers limited by a memory budget in bytes.
    /// The records limit is `budget / ESTIMATED_BYTES_PER_RECORD`.
    pub fn with_memory_budget(budget: u64) -> Self {
        let limit = usize::try_from(budget / ESTIMATED_BYTES_PER_RECORD as u64).unwrap_or(usize::MAX);
        Self::new(limit, false)
    }

    /// Maximum number of records a buffer holds.
    pub fn limit(&self) -> usize {
        self.buffer_limit
    }
}

impl ChunkBufferBuilder for LimitedBufferBuilder {
    type Buffer = LimitedBuffer;

    fn build(&self) -> Self::Buffer {
        if self.preallocate {
            LimitedBuffer::with_capacity(self.buffer_limit)
        } else {
            LimitedBuffer::new(self.buffer_limit)
        }
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        Self::with_memory_budget(DEFAULT_CHUNK_BUDGET)
    }
}

/// Buffer limited by records count.
pub struct LimitedBuffer {
    limit: usize,
    inner: Vec<Record>,
}

impl LimitedBuffer {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }
}

impl ChunkBuffer for LimitedBuffer {
    fn push(&mut self, record: Record) {
        self.inner.push(record);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    fn as_slice(&self) -> &[Record] {
        self.inner.as_slice()
    }

    fn clear(&mut self) {
        self.inner.clear();
    }
}

impl rayon::slice::ParallelSliceMut<Record> for LimitedBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder, DEFAULT_CHUNK_BUDGET};

    #[test]
    fn test_limited_buffer() {
        let builder = LimitedBufferBuilder::new(2, true);
        let mut buffer = builder.build();

        buffer.push(1);
        assert_eq!(buffer.is_full(), false);
        buffer.push(0);
        assert_eq!(buffer.is_full(), true);

        buffer.sort();
        assert_eq!(buffer.as_slice(), &[0, 1]);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.is_full(), false);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(7, 1)]
    #[case(8, 1)]
    #[case(80, 10)]
    #[case(100 * 1024 * 1024, 13_107_200)]
    fn test_memory_budget(#[case] budget: u64, #[case] expected_limit: usize) {
        assert_eq!(LimitedBufferBuilder::with_memory_budget(budget).limit(), expected_limit);
    }

    #[test]
    fn test_default_buffer_is_bounded() {
        let builder = LimitedBufferBuilder::default();
        assert_eq!(builder.limit(), 13_107_200);
        assert_eq!(
            builder.limit(),
            LimitedBufferBuilder::with_memory_budget(DEFAULT_CHUNK_BUDGET).limit()
        );
    }
}
