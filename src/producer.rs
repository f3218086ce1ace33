//! Splits the input stream into sorted chunks.

use std::marker::PhantomData;

use log;
use rayon;

use crate::chunk::{Chunk, ChunkFormat, RunDir};
use crate::record::Record;
use crate::sort::SortError;
use crate::{ChunkBuffer, ChunkBufferBuilder};

/// Result of the chunking phase.
pub struct ProducedChunks<F> {
    /// Chunks in creation order.
    pub chunks: Vec<Chunk<F>>,
    /// Number of records consumed from the input.
    pub records_read: u64,
}

/// Chunk producer. Accumulates input records in a limited buffer, sorts every full buffer and spills it
/// to a new chunk.
pub struct ChunkProducer<'a, B, F>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    run: &'a mut RunDir,
    buffer_builder: &'a B,
    thread_pool: &'a rayon::ThreadPool,
    rw_buf_size: Option<usize>,

    format: PhantomData<F>,
}

impl<'a, B, F> ChunkProducer<'a, B, F>
where
    B: ChunkBufferBuilder,
    F: ChunkFormat,
{
    pub fn new(
        run: &'a mut RunDir,
        buffer_builder: &'a B,
        thread_pool: &'a rayon::ThreadPool,
        rw_buf_size: Option<usize>,
    ) -> Self {
        ChunkProducer {
            run,
            buffer_builder,
            thread_pool,
            rw_buf_size,
            format: PhantomData,
        }
    }

    /// Consumes the whole input. On error every chunk created so far is deleted.
    pub fn produce<I, E>(mut self, input: I) -> Result<ProducedChunks<F>, SortError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: Into<SortError>,
    {
        let mut chunk_buf = self.buffer_builder.build();
        let mut chunks = Vec::new();
        let mut records_read = 0;

        for item in input.into_iter() {
            match item {
                Ok(record) => chunk_buf.push(record),
                Err(err) => return Err(err.into()),
            }
            records_read += 1;

            if chunk_buf.is_full() {
                chunks.push(self.spill(&mut chunk_buf)?);
            }
        }

        if !chunk_buf.is_empty() {
            chunks.push(self.spill(&mut chunk_buf)?);
        }

        log::debug!("chunking done ({} records, {} chunks)", records_read, chunks.len());

        return Ok(ProducedChunks { chunks, records_read });
    }

    fn spill(&mut self, buffer: &mut B::Buffer) -> Result<Chunk<F>, SortError> {
        log::debug!("sorting chunk data ({} records) ...", buffer.len());
        self.thread_pool.install(|| buffer.sort());

        log::debug!("saving chunk data");
        let chunk = Chunk::create(self.run, buffer.as_slice().iter().copied(), self.rw_buf_size)?;
        buffer.clear();

        return Ok(chunk);
    }
}
