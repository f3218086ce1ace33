//! Disk-resident sorted chunks.
//!
//! Every sort run owns a [`RunDir`], a fresh temporary directory that hands out monotonically increasing
//! [`ChunkId`]s. A [`Chunk`] is written once into that directory and then only read through [`ChunkCursor`]s.
//! Chunk files are deleted when the chunk is removed or dropped and the run directory itself is deleted when
//! the [`RunDir`] is dropped, so no artifact outlives a run whichever way it ends.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::Path;
use std::str;

use log;
use tempfile;

use crate::record::{self, parse_record, Record};

/// Chunk creation or reading error.
#[derive(Debug)]
pub enum ExternalChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Record serialization error.
    SerializationError(Box<dyn Error + Send + Sync>),
    /// Record deserialization error.
    DeserializationError(Box<dyn Error + Send + Sync>),
}

impl Error for ExternalChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ExternalChunkError::IO(err) => err,
            ExternalChunkError::SerializationError(err) => err.as_ref(),
            ExternalChunkError::DeserializationError(err) => err.as_ref(),
        })
    }
}

impl Display for ExternalChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ExternalChunkError::IO(err) => write!(f, "chunk I/O operation failed: {}", err),
            ExternalChunkError::SerializationError(err) => write!(f, "chunk serialization error: {}", err),
            ExternalChunkError::DeserializationError(err) => write!(f, "chunk deserialization error: {}", err),
        }
    }
}

impl From<io::Error> for ExternalChunkError {
    fn from(err: io::Error) -> Self {
        ExternalChunkError::IO(err)
    }
}

/// Run-scoped chunk identifier. Identifiers are assigned by a [`RunDir`] in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u64);

impl From<u64> for ChunkId {
    fn from(id: u64) -> Self {
        ChunkId(id)
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Temporary directory owned by a single sort run.
pub struct RunDir {
    dir: tempfile::TempDir,
    next_id: u64,
}

impl RunDir {
    /// Creates a fresh run directory inside `base` or inside the OS temporary directory.
    pub fn create(base: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("numsort-run-");

        let dir = match base {
            Some(base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        }?;

        log::info!("using {} as a temporary directory", dir.path().display());

        return Ok(RunDir { dir, next_id: 1 });
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Allocates the next chunk identifier.
    pub fn next_chunk_id(&mut self) -> ChunkId {
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Deletes the directory with everything left in it, reporting failures.
    pub fn close(self) -> io::Result<()> {
        log::debug!("removing temporary directory {}", self.dir.path().display());
        self.dir.close()
    }
}

/// Chunk file encoding.
pub trait ChunkFormat {
    /// Chunk file extension.
    const EXTENSION: &'static str;

    /// Writes a single record.
    fn write_record(writer: &mut io::BufWriter<fs::File>, record: Record) -> Result<(), ExternalChunkError>;

    /// Reads a single record. `scratch` is a reusable buffer owned by the cursor.
    fn read_record(
        reader: &mut io::Take<io::BufReader<fs::File>>,
        scratch: &mut Vec<u8>,
    ) -> Result<Record, ExternalChunkError>;
}

/// Newline-delimited decimal encoding, the same one used for input and output.
#[derive(Debug, Clone, Copy)]
pub struct TextFormat;

impl ChunkFormat for TextFormat {
    const EXTENSION: &'static str = ".txt";

    fn write_record(writer: &mut io::BufWriter<fs::File>, record: Record) -> Result<(), ExternalChunkError> {
        record::write_record(writer, record)?;
        return Ok(());
    }

    fn read_record(
        reader: &mut io::Take<io::BufReader<fs::File>>,
        scratch: &mut Vec<u8>,
    ) -> Result<Record, ExternalChunkError> {
        scratch.clear();
        reader.read_until(b'\n', scratch)?;

        let line = str::from_utf8(scratch).map_err(|err| ExternalChunkError::DeserializationError(Box::new(err)))?;
        return parse_record(line).map_err(|err| ExternalChunkError::DeserializationError(Box::new(err)));
    }
}

/// RMP (Rust MessagePack) encoding. Integers take 1 to 9 bytes.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy)]
pub struct RmpFormat;

impl ChunkFormat for RmpFormat {
    const EXTENSION: &'static str = ".rmp";

    fn write_record(writer: &mut io::BufWriter<fs::File>, record: Record) -> Result<(), ExternalChunkError> {
        rmp_serde::encode::write(writer, &record).map_err(|err| ExternalChunkError::SerializationError(Box::new(err)))
    }

    fn read_record(
        reader: &mut io::Take<io::BufReader<fs::File>>,
        _scratch: &mut Vec<u8>,
    ) -> Result<Record, ExternalChunkError> {
        rmp_serde::decode::from_read(reader).map_err(|err| ExternalChunkError::DeserializationError(Box::new(err)))
    }
}

/// Immutable sorted sequence of records stored in a run directory.
pub struct Chunk<F = TextFormat> {
    id: ChunkId,
    path: tempfile::TempPath,
    records: u64,
    file_len: u64,
    buf_size: Option<usize>,

    format: PhantomData<F>,
}

impl<F: ChunkFormat> Chunk<F> {
    /// Persists already sorted records as a new chunk.
    pub fn create(
        run: &mut RunDir,
        items: impl IntoIterator<Item = Record>,
        buf_size: Option<usize>,
    ) -> Result<Self, ExternalChunkError> {
        Self::try_create(run, items.into_iter().map(Ok), buf_size)
    }

    /// Persists already sorted records as a new chunk stopping at the first item error.
    /// The partially written file is deleted on error.
    pub fn try_create<I, E>(run: &mut RunDir, items: I, buf_size: Option<usize>) -> Result<Self, E>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: From<ExternalChunkError>,
    {
        let id = run.next_chunk_id();
        let tmp_file = tempfile::Builder::new()
            .prefix(&format!("chunk-{}", id))
            .suffix(F::EXTENSION)
            .rand_bytes(0)
            .tempfile_in(run.path())
            .map_err(ExternalChunkError::IO)?;
        let (file, path) = tmp_file.into_parts();

        let mut chunk_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        let mut records = 0;
        for item in items {
            F::write_record(&mut chunk_writer, item?)?;
            records += 1;
        }
        chunk_writer.flush().map_err(ExternalChunkError::IO)?;
        let file_len = chunk_writer.get_ref().metadata().map_err(ExternalChunkError::IO)?.len();

        log::debug!("chunk {} saved ({} records, {} bytes)", id, records, file_len);

        return Ok(Chunk {
            id,
            path,
            records,
            file_len,
            buf_size,
            format: PhantomData,
        });
    }

    /// Opens a forward-only cursor over the chunk records.
    pub fn open(&self) -> Result<ChunkCursor<F>, ExternalChunkError> {
        let file = fs::File::open(&self.path)?;
        let reader = match self.buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        log::trace!("chunk {} opened", self.id);

        return Ok(ChunkCursor {
            id: self.id,
            reader: Some(reader.take(self.file_len)),
            scratch: Vec::new(),
            format: PhantomData,
        });
    }
}

impl<F> Chunk<F> {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Number of records stored in the chunk.
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the chunk file, reporting failures.
    pub fn remove(self) -> io::Result<()> {
        log::trace!("chunk {} removed", self.id);
        self.path.close()
    }
}

/// Forward-only reader over a chunk. The file handle is released as soon as the cursor is exhausted
/// or fails.
pub struct ChunkCursor<F> {
    id: ChunkId,
    reader: Option<io::Take<io::BufReader<fs::File>>>,
    scratch: Vec<u8>,

    format: PhantomData<F>,
}

impl<F> ChunkCursor<F> {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Checks if the cursor is spent.
    pub fn is_exhausted(&self) -> bool {
        self.reader.is_none()
    }
}

impl<F: ChunkFormat> Iterator for ChunkCursor<F> {
    type Item = Result<Record, ExternalChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;

        if reader.limit() == 0 {
            log::trace!("chunk {} exhausted", self.id);
            self.reader = None;
            return None;
        }

        match F::read_record(reader, &mut self.scratch) {
            Ok(record) => Some(Ok(record)),
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;

    use rstest::*;

    use super::{Chunk, ChunkFormat, ChunkId, ExternalChunkError, RmpFormat, RunDir, TextFormat};

    #[fixture]
    fn base_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn dir_entries(path: &std::path::Path) -> usize {
        fs::read_dir(path).unwrap().count()
    }

    fn check_chunk<F: ChunkFormat>(base_dir: &tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let saved = vec![0, 1, 1, 127, 128, 65_535, 1 << 40, u64::MAX];

        let chunk: Chunk<F> = Chunk::create(&mut run, saved.clone(), None).unwrap();
        assert_eq!(chunk.len(), saved.len() as u64);

        let restored: Result<Vec<u64>, ExternalChunkError> = chunk.open().unwrap().collect();
        assert_eq!(restored.unwrap(), saved);

        // chunks can be read more than once
        let restored: Result<Vec<u64>, ExternalChunkError> = chunk.open().unwrap().collect();
        assert_eq!(restored.unwrap(), saved);
    }

    #[rstest]
    fn test_text_chunk(base_dir: tempfile::TempDir) {
        check_chunk::<TextFormat>(&base_dir);
    }

    #[rstest]
    fn test_rmp_chunk(base_dir: tempfile::TempDir) {
        check_chunk::<RmpFormat>(&base_dir);
    }

    #[rstest]
    fn test_text_chunk_file_encoding(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let chunk: Chunk<TextFormat> = Chunk::create(&mut run, vec![1, 2, 40], Some(16)).unwrap();

        assert_eq!(fs::read_to_string(chunk.path()).unwrap(), "1\n2\n40\n");
        assert!(chunk.path().file_name().unwrap().to_str().unwrap().starts_with("chunk-000001"));
    }

    #[rstest]
    fn test_empty_chunk(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let chunk: Chunk<TextFormat> = Chunk::create(&mut run, Vec::new(), None).unwrap();

        assert!(chunk.is_empty());
        assert_eq!(chunk.open().unwrap().count(), 0);
    }

    #[rstest]
    fn test_chunk_ids_are_monotonic(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();

        let first: Chunk<TextFormat> = Chunk::create(&mut run, vec![3], None).unwrap();
        let second: Chunk<TextFormat> = Chunk::create(&mut run, vec![1], None).unwrap();

        assert_eq!(first.id(), ChunkId::from(1));
        assert_eq!(second.id(), ChunkId::from(2));
        assert!(first.id() < second.id());
    }

    #[rstest]
    #[case(1, "000001")]
    #[case(42, "000042")]
    #[case(1234567, "1234567")]
    fn test_chunk_id_display(#[case] id: u64, #[case] expected: &str) {
        assert_eq!(ChunkId::from(id).to_string(), expected);
    }

    #[rstest]
    fn test_cursor_released_on_exhaustion(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let chunk: Chunk<RmpFormat> = Chunk::create(&mut run, vec![5, 6], None).unwrap();

        let mut cursor = chunk.open().unwrap();
        assert_eq!(cursor.next().unwrap().unwrap(), 5);
        assert_eq!(cursor.next().unwrap().unwrap(), 6);
        assert!(!cursor.is_exhausted());
        assert!(cursor.next().is_none());
        assert!(cursor.is_exhausted());
        assert!(cursor.next().is_none());
    }

    #[rstest]
    fn test_corrupted_text_chunk(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let chunk: Chunk<TextFormat> = Chunk::create(&mut run, vec![1, 2], None).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(chunk.path())
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let mut cursor = chunk.open().unwrap();
        assert!(matches!(cursor.next(), Some(Err(ExternalChunkError::DeserializationError(_)))));
        assert!(cursor.next().is_none());
    }

    #[rstest]
    fn test_chunk_cleanup(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let run_path = run.path().to_path_buf();

        let removed: Chunk<TextFormat> = Chunk::create(&mut run, vec![1], None).unwrap();
        let dropped: Chunk<TextFormat> = Chunk::create(&mut run, vec![2], None).unwrap();
        let kept: Chunk<TextFormat> = Chunk::create(&mut run, vec![3], None).unwrap();
        assert_eq!(dir_entries(&run_path), 3);

        removed.remove().unwrap();
        assert_eq!(dir_entries(&run_path), 2);

        drop(dropped);
        assert_eq!(dir_entries(&run_path), 1);

        drop(kept);
        run.close().unwrap();
        assert!(!run_path.exists());
        assert_eq!(dir_entries(base_dir.path()), 0);
    }

    #[rstest]
    fn test_failed_chunk_is_deleted(base_dir: tempfile::TempDir) {
        let mut run = RunDir::create(Some(base_dir.path())).unwrap();
        let items = vec![
            Ok(1),
            Err(ExternalChunkError::IO(std::io::Error::new(std::io::ErrorKind::Other, "test error"))),
        ];

        let result: Result<Chunk<TextFormat>, ExternalChunkError> = Chunk::try_create(&mut run, items, None);

        assert!(result.is_err());
        assert_eq!(dir_entries(run.path()), 0);
    }
}
