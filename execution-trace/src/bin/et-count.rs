use anyhow::{Context, Result};
use clap::Parser;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};

use exectrace::reader::{cont, try_break, TraceReader};
use exectrace::record::RecordKind;
use exectrace::{RawRecord, TraceBuffer};
use tracing_subscriber::filter::EnvFilter;

/// Summarizes a trace by record kind and by execution context.
///
/// Trace files are mapped into memory, stdin is streamed. In both cases the trace bytes are
/// passed through to the output unchanged.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Output file or '-' to use stdout.
    #[arg(short, long, default_value_t = String::from("-"))]
    output: String,
}

#[derive(Debug, Default)]
struct Tally {
    records: u64,
    payload_bytes: u64,
}

#[derive(Debug, Default)]
struct Summary {
    kinds: BTreeMap<RecordKind, Tally>,
    /// Records per (context, pid) pair.
    contexts: BTreeMap<(u32, u64), u64>,
    unknown: u64,
}

impl Summary {
    fn add(&mut self, raw: RawRecord) {
        if let Ok(header) = raw.header() {
            *self
                .contexts
                .entry((header.context(), header.pid()))
                .or_default() += 1;
        }

        match raw.kind() {
            Ok(kind) => {
                let tally = self.kinds.entry(kind).or_default();
                tally.records += 1;
                tally.payload_bytes += raw.payload().len() as u64;
            }
            Err(err) => {
                tracing::debug!(error = %err, "unknown record");
                self.unknown += 1;
            }
        }
    }

    fn report(&self) {
        for (kind, tally) in &self.kinds {
            eprintln!(
                "{kind} => {} ({} payload bytes)",
                tally.records, tally.payload_bytes
            );
        }
        if self.unknown > 0 {
            eprintln!("unknown => {}", self.unknown);
        }
        for ((context, pid), records) in &self.contexts {
            eprintln!("ctx={context:<4} pid={pid:#x} => {records}");
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("ET_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut output = open_output(args.output.as_str())?;
    let mut summary = Summary::default();

    if args.input == "-" {
        TraceReader::new(io::stdin().lock())
            .for_each(|raw| {
                summary.add(raw);
                try_break!(output.write_all(raw.bytes()));
                cont!()
            })
            .map_or(Ok(()), |err: io::Error| Err(err))?;
    } else {
        // SAFETY: the trace is not expected to change while it is being counted.
        let trace = unsafe { TraceBuffer::map(args.input.as_str()) }
            .with_context(|| format!("failed to map {}", args.input))?;
        for raw in trace.iter() {
            summary.add(raw);
            output.write_all(raw.bytes())?;
        }
    }
    output.flush()?;

    summary.report();
    Ok(())
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    Ok(Box::new(fs::File::create(output)?))
}
