//! Record type and its decimal line encoding.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::mem;
use std::num::ParseIntError;
use std::str;
use std::str::Utf8Error;

/// A single sortable value.
pub type Record = u64;

/// Number of bytes a record occupies in a chunk buffer.
pub const ESTIMATED_BYTES_PER_RECORD: usize = mem::size_of::<Record>();

/// Parses a record from its decimal text encoding.
/// Surrounding whitespace (including a trailing `\r`) is ignored.
pub fn parse_record(line: &str) -> Result<Record, ParseIntError> {
    line.trim().parse::<Record>()
}

/// Decodes a record from a raw input line without its line terminator.
pub fn decode_record(line: &[u8]) -> Result<Record, ParseErrorKind> {
    let line = str::from_utf8(line)?;
    Ok(parse_record(line)?)
}

/// Writes a record as a newline-terminated decimal line.
pub fn write_record<W: Write + ?Sized>(writer: &mut W, record: Record) -> io::Result<()> {
    writeln!(writer, "{}", record)
}

/// Reason a line could not be decoded.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Line is not valid UTF-8.
    Encoding(Utf8Error),
    /// Line is not a non-negative integer.
    Number(ParseIntError),
}

impl From<Utf8Error> for ParseErrorKind {
    fn from(err: Utf8Error) -> Self {
        ParseErrorKind::Encoding(err)
    }
}

impl From<ParseIntError> for ParseErrorKind {
    fn from(err: ParseIntError) -> Self {
        ParseErrorKind::Number(err)
    }
}

impl Error for ParseErrorKind {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ParseErrorKind::Encoding(err) => err,
            ParseErrorKind::Number(err) => err,
        })
    }
}

impl Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ParseErrorKind::Encoding(err) => write!(f, "invalid encoding: {}", err),
            ParseErrorKind::Number(err) => write!(f, "{}", err),
        }
    }
}

/// Input line that is not a valid non-negative integer.
#[derive(Debug)]
pub struct ParseError {
    line_number: u64,
    line: String,
    kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(line_number: u64, line: impl Into<String>, kind: impl Into<ParseErrorKind>) -> Self {
        ParseError {
            line_number,
            line: line.into(),
            kind: kind.into(),
        }
    }

    /// One-based number of the offending line.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Offending line content, invalid UTF-8 sequences replaced with `U+FFFD`.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.kind)
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: {:?} is not a non-negative integer: {}",
            self.line_number, self.line, self.kind
        )
    }
}

/// Record reading error.
#[derive(Debug)]
pub enum ReadError {
    /// Underlying stream error.
    IO(io::Error),
    /// Malformed line.
    Parse(ParseError),
}

impl Error for ReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ReadError::IO(err) => err,
            ReadError::Parse(err) => err,
        })
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ReadError::IO(err) => write!(f, "input read failed: {}", err),
            ReadError::Parse(err) => write!(f, "input parse failed: {}", err),
        }
    }
}

/// Reads newline-delimited records from a buffered reader, keeping track of line numbers.
/// Lines that are not valid UTF-8 are reported as [`ReadError::Parse`].
pub struct RecordReader<R> {
    reader: R,
    buf: Vec<u8>,
    line_number: u64,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            buf: Vec::new(),
            line_number: 0,
        }
    }

    /// Number of lines consumed so far.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(err) => return Some(Err(ReadError::IO(err))),
        }
        self.line_number += 1;
        let line_number = self.line_number;

        let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        return Some(decode_record(line).map_err(|kind| {
            ReadError::Parse(ParseError::new(line_number, String::from_utf8_lossy(line), kind))
        }));
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use rstest::*;

    use super::{decode_record, parse_record, write_record, ParseErrorKind, ReadError, RecordReader};

    #[rstest]
    #[case("0", Some(0))]
    #[case("42", Some(42))]
    #[case("  7\r", Some(7))]
    #[case("+5", Some(5))]
    #[case("18446744073709551615", Some(u64::MAX))]
    #[case("18446744073709551616", None)]
    #[case("", None)]
    #[case("-3", None)]
    #[case("12a", None)]
    #[case("1 2", None)]
    fn test_parse_record(#[case] line: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_record(line).ok(), expected);
    }

    #[rstest]
    #[case(b"17", Some(17))]
    #[case(b" 17\r", Some(17))]
    #[case(b"\xff\xfe", None)]
    #[case(b"1\xc3", None)]
    fn test_decode_record(#[case] line: &[u8], #[case] expected: Option<u64>) {
        assert_eq!(decode_record(line).ok(), expected);
    }

    #[test]
    fn test_write_record() {
        let mut buf = Vec::new();
        write_record(&mut buf, 10).unwrap();
        write_record(&mut buf, 0).unwrap();
        assert_eq!(buf, b"10\n0\n");
    }

    #[test]
    fn test_record_reader_reports_line_number() {
        let input = io::Cursor::new("5\n3\nfoo\n1\n");
        let mut reader = RecordReader::new(input);

        assert_eq!(reader.next().unwrap().unwrap(), 5);
        assert_eq!(reader.next().unwrap().unwrap(), 3);
        match reader.next().unwrap() {
            Err(ReadError::Parse(err)) => {
                assert_eq!(err.line_number(), 3);
                assert_eq!(err.line(), "foo");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(reader.line_number(), 3);
    }

    #[test]
    fn test_record_reader_without_trailing_newline() {
        let reader = RecordReader::new(io::Cursor::new("1\n2"));
        let records: Result<Vec<u64>, _> = reader.collect();
        assert_eq!(records.unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_record_reader_invalid_utf8_is_parse_error() {
        let input = io::Cursor::new(&b"3\n\xff\xfe\r\n1\nx\n"[..]);
        let mut reader = RecordReader::new(input);

        assert_eq!(reader.next().unwrap().unwrap(), 3);
        match reader.next().unwrap() {
            Err(ReadError::Parse(err)) => {
                assert_eq!(err.line_number(), 2);
                assert_eq!(err.line(), "\u{fffd}\u{fffd}");
                assert!(matches!(err.kind(), ParseErrorKind::Encoding(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        match reader.next().unwrap() {
            Err(ReadError::Parse(err)) => {
                assert_eq!(err.line_number(), 4);
                assert!(matches!(err.kind(), ParseErrorKind::Number(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(reader.next().is_none());
        assert_eq!(reader.line_number(), 4);
    }
}
