//! Reading and writing of execution traces.
//!
//! A trace is an append-only concatenation of records. Every record is a fixed size
//! [`record::Header`] immediately followed by `size` bytes of payload whose layout is selected by
//! the header's kind. There is no index, checksum or compression, so consumers scan the trace
//! sequentially. A trailing partial record (for example from a tracer that was killed) ends the
//! trace and is not treated as an error.

use std::path::Path;
use std::{fs, io};

pub mod record;

use record::{Header, ParseError, Record, RecordKind, UnknownRecordKind, HEADER_SIZE};

/// Returns the payload size declared by the header at the start of `record`.
#[inline]
pub fn payload_size(record: &[u8]) -> Option<usize> {
    if record.len() < HEADER_SIZE {
        return None;
    }
    record.get(8).map(|size| *size as usize)
}

fn one_record(buffer: &[u8]) -> Result<RawRecord, usize> {
    let size = payload_size(buffer).ok_or(HEADER_SIZE)?;
    let tlen = HEADER_SIZE + size;
    buffer.get(..tlen).ok_or(tlen).map(RawRecord)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TraceBuffer<'b>(&'b [u8]);

impl<'b> TraceBuffer<'b> {
    pub fn new(bytes: &'b [u8]) -> Self {
        Self(bytes)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawRecord<'b>> + 'b {
        TraceBufferIter {
            buffer: self.0,
            pos: 0,
        }
    }
}

impl TraceBuffer<'static> {
    /// Maps a trace file into memory for the rest of the program's lifetime.
    ///
    /// # Safety
    ///
    /// The file must not be truncated or modified while the returned buffer is in use.
    pub unsafe fn map<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        // Empty files cannot be mapped.
        if file.metadata()?.len() == 0 {
            return Ok(Self(&[]));
        }
        let mmap = std::mem::ManuallyDrop::new(memmap::Mmap::map(&file)?);
        Ok(Self(std::slice::from_raw_parts(mmap.as_ptr(), mmap.len())))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TraceBufferIter<'b> {
    buffer: &'b [u8],
    pos: usize,
}

impl<'b> Iterator for TraceBufferIter<'b> {
    type Item = RawRecord<'b>;

    fn next(&mut self) -> Option<Self::Item> {
        let buffer = self.buffer.get(self.pos..)?;
        let record = match one_record(buffer) {
            Ok(record) => record,
            Err(needed) => {
                if !buffer.is_empty() {
                    tracing::debug!(
                        offset = self.pos,
                        available = buffer.len(),
                        needed = needed,
                        "ignoring truncated record at end of trace"
                    );
                }
                return None;
            }
        };
        self.pos += record.len();
        Some(record)
    }
}

/// The bytes of a single framed record: header followed by payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawRecord<'a>(&'a [u8]);

impl<'a> RawRecord<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        RawRecord(bytes)
    }

    pub fn header(&self) -> Result<Header, ParseError> {
        Header::parse(self.0)
    }

    pub fn kind(&self) -> Result<RecordKind, UnknownRecordKind> {
        // A record too short to hold a kind byte reports the reserved 0xff tag.
        RecordKind::try_from(self.0.get(9).copied().unwrap_or(u8::MAX))
    }

    /// Returns the bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        self.0.get(HEADER_SIZE..).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(&self) -> Result<Record<'a>, ParseError> {
        Record::parse(*self)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.0
    }
}

pub mod reader {
    use super::{payload_size, RawRecord, HEADER_SIZE};
    use std::io::{BufReader, Read};
    use std::ops::ControlFlow;

    pub use macros::{__cont as cont, __try_break as try_break, __try_cont as try_cont};

    /// Frames records out of a byte stream one at a time.
    ///
    /// The reader reuses a single internal buffer, so each [`RawRecord`] borrows the reader until
    /// the next call to [`TraceReader::next`].
    #[derive(Debug)]
    pub struct TraceReader<R> {
        reader: BufReader<R>,
        buffer: Vec<u8>,
    }

    impl<R: Read> TraceReader<R> {
        /// Creates a new TraceReader with an internal buffer large enough for any record.
        pub fn new(reader: R) -> Self {
            Self {
                reader: BufReader::new(reader),
                buffer: Vec::with_capacity(HEADER_SIZE + u8::MAX as usize),
            }
        }

        /// Returns the next record, or `None` at the end of the stream.
        ///
        /// A record that is cut short by the end of the stream is treated as the end of the
        /// stream.
        pub fn next<'a>(&'a mut self) -> Option<RawRecord<'a>> {
            self.buffer.resize(HEADER_SIZE, 0);
            self.reader.read_exact(self.buffer.as_mut_slice()).ok()?;
            let size = payload_size(self.buffer.as_slice())?;
            let tlen = HEADER_SIZE + size;
            self.buffer.resize(tlen, 0);
            if let Err(err) = self.reader.read_exact(&mut self.buffer[HEADER_SIZE..tlen]) {
                tracing::debug!(error = %err, size = size, "trace ended inside a record");
                return None;
            }
            Some(RawRecord(self.buffer.as_slice()))
        }

        pub fn for_each<F, T>(&mut self, mut func: F) -> Option<T>
        where
            F: FnMut(RawRecord) -> ControlFlow<T>,
        {
            while let Some(item) = self.next() {
                if let ControlFlow::Break(value) = func(item) {
                    return Some(value);
                }
            }
            None
        }
    }

    mod macros {
        #[macro_export]
        macro_rules! __try_break {
            ($expr:expr $(,)?) => {
                match $expr {
                    ::core::result::Result::Ok(val) => val,
                    ::core::result::Result::Err(err) => {
                        return ::core::ops::ControlFlow::Break(::core::convert::From::from(err));
                    }
                }
            };
        }

        #[macro_export]
        macro_rules! __try_cont {
            ($expr:expr $(,)?) => {
                match $expr {
                    ::core::result::Result::Ok(val) => val,
                    ::core::result::Result::Err(_) => {
                        return ::core::ops::ControlFlow::Continue(());
                    }
                }
            };
        }

        #[macro_export]
        macro_rules! __cont {
            () => {{
                return ::core::ops::ControlFlow::Continue(());
            }};
        }

        pub use __cont;
        pub use __try_break;
        pub use __try_cont;
    }
}
