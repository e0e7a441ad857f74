//! Turns the events seen by a [`FunctionMonitor`](function_monitor::FunctionMonitor) into an
//! execution trace.
//!
//! [`TraceEmitter`] owns the [`TraceFile`] that records are written to. Its call recorder is a
//! regular call observer, so it sees exactly the calls the monitor dispatches and writes a
//! `Call` record for each of them and a `Return` record once the call returns. Events the monitor
//! does not know about (module loads, forks, test cases and cache simulation) are written
//! directly through the emitter.

pub mod config;
pub mod emitter;
pub mod log;
pub mod replay;
pub mod tracefile;

pub use config::{ConfigError, EmitterConfig};
pub use emitter::{CallRecorder, TraceEmitter};
pub use tracefile::TraceFile;

#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error("failed to write trace")]
    Io(#[from] std::io::Error),

    #[error("trace file is still referenced by {0} observers")]
    StillShared(usize),
}
