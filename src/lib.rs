//! `numsort` is an external sort for newline-delimited non-negative integers.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts chunks of data that each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Memory limit:**
//!   the chunk buffer is bounded by a records count or by a memory budget in bytes, the only thing that
//!   changes with the budget is the number of chunks.
//! * **Run isolation:**
//!   every run stores its chunks in its own temporary directory which is deleted when the run ends, successfully
//!   or not.
//! * **Bounded merge fan-in:**
//!   when there are more chunks than the merge fan-in, chunks are merged in several passes so the number of open
//!   files stays bounded.
//! * **Multithreading support:**
//!   chunk buffers are sorted in parallel in a dedicated thread pool.
//! * **Pluggable chunk format:**
//!   chunks are stored as decimal lines by default or as `MessagePack`.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use numsort::{ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_buffer(LimitedBufferBuilder::with_memory_budget(100 * 1024 * 1024))
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter
//!         .sort_file(path::Path::new("input.txt"), path::Path::new("output.txt"))
//!         .unwrap();
//!
//!     println!("{} records sorted", stats.records_written);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod merger;
pub mod producer;
pub mod record;
pub mod sort;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBuffer, LimitedBufferBuilder, DEFAULT_CHUNK_BUDGET};
pub use chunk::{Chunk, ChunkCursor, ChunkFormat, ChunkId, ExternalChunkError, RmpFormat, RunDir, TextFormat};
pub use merger::BinaryHeapMerger;
pub use producer::{ChunkProducer, ProducedChunks};
pub use record::{ParseError, ParseErrorKind, ReadError, Record, RecordReader};
pub use sort::{ExternalSorter, ExternalSorterBuilder, MalformedPolicy, SortError, SortStats, SortedRecords};
