//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::chunk::{Chunk, ChunkCursor, ChunkFormat, ChunkId, ExternalChunkError, RunDir, TextFormat};
use crate::merger::BinaryHeapMerger;
use crate::producer::ChunkProducer;
use crate::record::{write_record, ParseError, ReadError, Record, RecordReader};
use crate::{ChunkBufferBuilder, LimitedBufferBuilder};

/// Default maximum number of chunks merged at once.
pub const DEFAULT_MERGE_FAN_IN: usize = 256;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Chunk encoding or decoding error.
    ChunkError(ExternalChunkError),
    /// Malformed input line.
    ParseError(ParseError),
    /// Input data stream error.
    InputError(Box<dyn Error + Send + Sync>),
    /// Output writing error.
    OutputError(io::Error),
}

impl SortError {
    /// Wraps an arbitrary input stream error.
    pub fn input(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        SortError::InputError(err.into())
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SortError::TempDir(err) => err,
            SortError::ThreadPoolBuildError(err) => err,
            SortError::IO(err) => err,
            SortError::ChunkError(err) => err,
            SortError::ParseError(err) => err,
            SortError::InputError(err) => err.as_ref(),
            SortError::OutputError(err) => err,
        })
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::ChunkError(err) => write!(f, "{}", err),
            SortError::ParseError(err) => write!(f, "malformed input: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
            SortError::OutputError(err) => write!(f, "output writing failed: {}", err),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}

impl From<ParseError> for SortError {
    fn from(err: ParseError) -> Self {
        SortError::ParseError(err)
    }
}

impl From<ReadError> for SortError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::IO(err) => SortError::IO(err),
            ReadError::Parse(err) => SortError::ParseError(err),
        }
    }
}

impl From<ExternalChunkError> for SortError {
    fn from(err: ExternalChunkError) -> Self {
        match err {
            ExternalChunkError::IO(err) => SortError::IO(err),
            err => SortError::ChunkError(err),
        }
    }
}

/// What to do with input lines that are not valid non-negative integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Abort the run.
    Fail,
    /// Log the line and leave it out of the output.
    Skip,
}

impl Default for MalformedPolicy {
    fn default() -> Self {
        MalformedPolicy::Fail
    }
}

/// Sort run statistics.
#[derive(Debug, Default, Clone)]
pub struct SortStats {
    /// Records consumed by the chunking phase.
    pub records_read: u64,
    /// Malformed lines left out (see [`MalformedPolicy::Skip`]).
    pub records_skipped: u64,
    /// Records yielded by the final merge.
    pub records_written: u64,
    /// Chunks written by the chunking phase.
    pub chunks_created: usize,
    /// Merge passes including the final one.
    pub merge_passes: usize,
    /// Time spent reading, sorting and saving chunks.
    pub chunking_time: Duration,
    /// Time spent merging.
    pub merge_time: Duration,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<B = LimitedBufferBuilder, F = TextFormat>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Maximum number of chunks merged at once.
    merge_fan_in: Option<usize>,
    /// Malformed input lines handling.
    malformed_policy: MalformedPolicy,
    /// Chunk buffer builder.
    buffer_builder: B,

    /// Chunk format.
    chunk_format: PhantomData<F>,
}

impl<B, F> ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B, F>, SortError> {
        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.rw_buf_size,
            self.merge_fan_in,
            self.malformed_policy,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<B, F> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<B, F> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalSorterBuilder<B, F> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<B, F> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets maximum number of chunks merged (and kept open) at once.
    pub fn with_merge_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder<B, F> {
        self.merge_fan_in = Some(fan_in);
        return self;
    }

    /// Sets malformed input lines handling.
    pub fn with_malformed_policy(mut self, policy: MalformedPolicy) -> ExternalSorterBuilder<B, F> {
        self.malformed_policy = policy;
        return self;
    }

    /// Switches chunk files encoding.
    pub fn with_chunk_format<G: ChunkFormat>(self) -> ExternalSorterBuilder<B, G> {
        ExternalSorterBuilder {
            threads_number: self.threads_number,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            merge_fan_in: self.merge_fan_in,
            malformed_policy: self.malformed_policy,
            buffer_builder: self.buffer_builder,
            chunk_format: PhantomData,
        }
    }
}

impl<B, F> Default for ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            merge_fan_in: None,
            malformed_policy: MalformedPolicy::default(),
            buffer_builder: B::default(),
            chunk_format: PhantomData,
        }
    }
}

/// External sorter.
///
/// Every sort call is a separate run with its own temporary directory, so a sorter can be reused.
pub struct ExternalSorter<B = LimitedBufferBuilder, F = TextFormat>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory run directories are created in.
    tmp_dir: Option<Box<Path>>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Maximum number of chunks merged at once.
    merge_fan_in: usize,
    /// Malformed input lines handling.
    malformed_policy: MalformedPolicy,

    /// Chunk format.
    chunk_format: PhantomData<F>,
}

impl<B, F> ExternalSorter<B, F>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `buffer_builder` - An instance of a buffer builder that will be used for chunk buffer creation.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    /// * `merge_fan_in` - Maximum number of chunks merged at once, at least 2. If the parameter is [`None`]
    ///   [`DEFAULT_MERGE_FAN_IN`] is used.
    /// * `malformed_policy` - Malformed input lines handling.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        buffer_builder: B,
        rw_buf_size: Option<usize>,
        merge_fan_in: Option<usize>,
        malformed_policy: MalformedPolicy,
    ) -> Result<Self, SortError> {
        return Ok(ExternalSorter {
            rw_buf_size,
            buffer_builder,
            malformed_policy,
            merge_fan_in: merge_fan_in.unwrap_or(DEFAULT_MERGE_FAN_IN).max(2),
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
            chunk_format: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Sorts records from the input.
    /// Returns an iterator that can be used to get sorted data stream. The iterator owns the run's chunks
    /// and deletes them once dropped or closed.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort<I, E>(&self, input: I) -> Result<SortedRecords<F>, SortError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: Into<SortError>,
    {
        let mut run = RunDir::create(self.tmp_dir.as_deref()).map_err(SortError::TempDir)?;

        let chunking_started = Instant::now();
        let produced = ChunkProducer::<B, F>::new(&mut run, &self.buffer_builder, &self.thread_pool, self.rw_buf_size)
            .produce(input)?;

        let mut stats = SortStats {
            records_read: produced.records_read,
            chunks_created: produced.chunks.len(),
            chunking_time: chunking_started.elapsed(),
            ..SortStats::default()
        };
        log::info!(
            "split {} records into {} chunks in {:.2?}",
            stats.records_read,
            stats.chunks_created,
            stats.chunking_time
        );

        let merge_started = Instant::now();
        let (chunks, intermediate_passes) = self.reduce_chunks(&mut run, produced.chunks)?;
        stats.merge_passes = intermediate_passes + if chunks.is_empty() { 0 } else { 1 };

        if chunks.len() == 1 {
            log::debug!("single chunk, merge is a pass-through");
        }

        let cursors = open_cursors(&chunks)?;

        return Ok(SortedRecords {
            merger: BinaryHeapMerger::new(cursors),
            chunks,
            run,
            stats,
            merge_started,
            finished: false,
        });
    }

    /// Sorts newline-delimited decimal records.
    /// Malformed lines are handled according to the configured [`MalformedPolicy`].
    pub fn sort_lines<R: BufRead>(&self, reader: R) -> Result<SortedRecords<F>, SortError> {
        let policy = self.malformed_policy;
        let mut skipped = 0;

        let records = RecordReader::new(reader).filter_map(|item| match item {
            Err(ReadError::Parse(err)) if policy == MalformedPolicy::Skip => {
                log::warn!("skipping malformed record at {}", err);
                skipped += 1;
                None
            }
            item => Some(item),
        });

        let mut sorted = self.sort(records)?;
        sorted.stats.records_skipped = skipped;

        return Ok(sorted);
    }

    /// Sorts newline-delimited decimal records from `reader` into `writer`.
    pub fn sort_to_writer<R, W>(&self, reader: R, mut writer: W) -> Result<SortStats, SortError>
    where
        R: BufRead,
        W: Write,
    {
        let mut sorted = self.sort_lines(reader)?;

        for record in &mut sorted {
            write_record(&mut writer, record?).map_err(SortError::OutputError)?;
        }
        writer.flush().map_err(SortError::OutputError)?;

        let stats = sorted.close()?;
        log::info!(
            "merged {} records in {:.2?} ({} passes), total time {:.2?}",
            stats.records_written,
            stats.merge_time,
            stats.merge_passes,
            stats.chunking_time + stats.merge_time
        );

        return Ok(stats);
    }

    /// Sorts the `input` file into the `output` file.
    /// The output is written to a temporary file next to `output` and moved into place only if the whole run
    /// succeeds.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        let input_file = fs::File::open(input)?;

        let output_dir = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp_output = tempfile::Builder::new()
            .prefix(".numsort-output-")
            .tempfile_in(output_dir)
            .map_err(SortError::OutputError)?;

        let stats = self.sort_to_writer(
            io::BufReader::new(input_file),
            io::BufWriter::new(tmp_output.as_file()),
        )?;

        tmp_output
            .persist(output)
            .map_err(|err| SortError::OutputError(err.error))?;
        log::info!("sorted data saved to {}", output.display());

        return Ok(stats);
    }

    /// Merges chunks in groups of at most `merge_fan_in` until no more than `merge_fan_in` chunks are left.
    /// Returns the remaining chunks and the number of passes made.
    fn reduce_chunks(
        &self,
        run: &mut RunDir,
        mut chunks: Vec<Chunk<F>>,
    ) -> Result<(Vec<Chunk<F>>, usize), SortError> {
        let mut passes = 0;

        while chunks.len() > self.merge_fan_in {
            passes += 1;
            log::warn!(
                "{} chunks exceed merge fan-in {}, running intermediate merge pass {}",
                chunks.len(),
                self.merge_fan_in,
                passes
            );

            let mut merged = Vec::with_capacity((chunks.len() + self.merge_fan_in - 1) / self.merge_fan_in);
            let mut pending = chunks.into_iter();
            loop {
                let group: Vec<Chunk<F>> = pending.by_ref().take(self.merge_fan_in).collect();
                match group.len() {
                    0 => break,
                    1 => merged.extend(group),
                    _ => merged.push(self.merge_group(run, group)?),
                }
            }
            chunks = merged;
        }

        return Ok((chunks, passes));
    }

    fn merge_group(&self, run: &mut RunDir, group: Vec<Chunk<F>>) -> Result<Chunk<F>, SortError> {
        let merger = BinaryHeapMerger::new(open_cursors(&group)?);
        let chunk = Chunk::try_create(run, merger.map(|item| item.map_err(SortError::from)), self.rw_buf_size)?;

        log::debug!("chunks {:?} merged into chunk {}", chunk_ids(&group), chunk.id());
        for consumed in group {
            consumed.remove()?;
        }

        return Ok(chunk);
    }
}

fn open_cursors<F: ChunkFormat>(chunks: &[Chunk<F>]) -> Result<Vec<(ChunkId, ChunkCursor<F>)>, ExternalChunkError> {
    chunks.iter().map(|chunk| Ok((chunk.id(), chunk.open()?))).collect()
}

fn chunk_ids<F>(chunks: &[Chunk<F>]) -> Vec<ChunkId> {
    chunks.iter().map(|chunk| chunk.id()).collect()
}

/// Sorted records stream.
///
/// Owns the run directory and every chunk of the run. Dropping the stream, whether exhausted or not, deletes
/// all of them; [`SortedRecords::close`] does the same and reports deletion failures.
pub struct SortedRecords<F: ChunkFormat = TextFormat> {
    // fields are dropped in declaration order: cursors are closed before chunks are deleted
    merger: BinaryHeapMerger<Record, ExternalChunkError, ChunkCursor<F>>,
    chunks: Vec<Chunk<F>>,
    run: RunDir,
    stats: SortStats,
    merge_started: Instant,
    finished: bool,
}

impl<F: ChunkFormat> SortedRecords<F> {
    /// Run statistics. Merge fields are final once the stream is exhausted.
    pub fn stats(&self) -> &SortStats {
        &self.stats
    }

    /// Identifiers of the chunks being merged.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        chunk_ids(&self.chunks)
    }

    /// Run directory the chunks are stored in.
    pub fn run_dir(&self) -> &Path {
        self.run.path()
    }

    /// Deletes the run's chunks and directory.
    pub fn close(self) -> Result<SortStats, SortError> {
        let SortedRecords {
            merger, chunks, run, stats, ..
        } = self;

        drop(merger);
        for chunk in chunks {
            chunk.remove()?;
        }
        run.close()?;

        return Ok(stats);
    }
}

impl<F: ChunkFormat> Iterator for SortedRecords<F> {
    type Item = Result<Record, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.merger.next() {
            Some(Ok(record)) => {
                self.stats.records_written += 1;
                Some(Ok(record))
            }
            Some(Err(err)) => Some(Err(err.into())),
            None => {
                if !self.finished {
                    self.finished = true;
                    self.stats.merge_time = self.merge_started.elapsed();
                    log::debug!("external sort merge done");
                }
                None
            }
        }
    }
}

impl<F: ChunkFormat> Debug for SortedRecords<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedRecords")
            .field("run_dir", &self.run.path())
            .field("chunks", &self.chunk_ids())
            .field("stats", &self.stats)
            .finish()
    }
}
