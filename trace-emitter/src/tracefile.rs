use std::io::{self, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use exectrace::record::{EmitError, Origin, Record};
use function_monitor::{AddressSpace, ContextId};

use crate::EmitterError;

/// Microseconds since the Unix epoch.
pub fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

/// Buffered sink for trace records.
///
/// I/O failures do not interrupt the caller. The first one is logged and kept, every later
/// record is dropped, and the error is returned from [`TraceFile::finish`].
pub struct TraceFile<W: Write> {
    writer: BufWriter<W>,
    record: Vec<u8>,
    clock: fn() -> u64,
    error: Option<io::Error>,
    written: u64,
}

impl<W: Write> TraceFile<W> {
    pub fn new(writer: W) -> Self {
        Self::with_clock(writer, wall_clock)
    }

    /// Creates a trace file that timestamps records with `clock`.
    pub fn with_clock(writer: W, clock: fn() -> u64) -> Self {
        Self {
            writer: BufWriter::new(writer),
            record: Vec::new(),
            clock,
            error: None,
            written: 0,
        }
    }

    /// Encodes and appends a record observed in `context` and `space`.
    ///
    /// Returns an error only if the record cannot be encoded, in which case nothing is written.
    pub fn write<'r, R>(
        &mut self,
        context: ContextId,
        space: AddressSpace,
        record: R,
    ) -> Result<(), EmitError>
    where
        R: Into<Record<'r>>,
    {
        let record = record.into();
        if self.error.is_some() {
            tracing::trace!(kind = %record.kind(), "dropping record after write failure");
            return Ok(());
        }

        let origin = Origin::new((self.clock)(), context.0, space.0);
        self.record.clear();
        record.emit(origin, &mut self.record)?;

        if let Err(err) = self.writer.write_all(self.record.as_slice()) {
            tracing::error!(error = %err, kind = %record.kind(), "failed to write record to trace file");
            self.error = Some(err);
            return Ok(());
        }
        self.written += 1;
        Ok(())
    }

    /// Returns the number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes buffered records, returning the first I/O error seen since the last call.
    pub fn finish(&mut self) -> Result<(), EmitterError> {
        if let Some(err) = self.error.take() {
            return Err(err.into());
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(mut self) -> Result<W, EmitterError> {
        self.finish()?;
        self.writer
            .into_inner()
            .map_err(|err| EmitterError::Io(err.into_error()))
    }
}

impl<W: Write> std::fmt::Debug for TraceFile<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceFile")
            .field("written", &self.written)
            .field("failed", &self.error.is_some())
            .finish()
    }
}
