use anyhow::{Context, Result};
use clap::Parser;

use std::fs;
use std::io::{self, BufRead, BufReader};

use function_monitor::{CallLogger, FunctionMonitor};
use trace_emitter::{log, replay, EmitterConfig, TraceEmitter, TraceFile};

/// Replays a script of call, return and destroy events through a function monitor and writes
/// the resulting execution trace.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Event script or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Emitter settings as key=value pairs (output, trace-calls, log-calls, space).
    options: Vec<String>,
}

fn main() -> Result<()> {
    log::initialize_logging();

    let args = Args::parse();
    let config = EmitterConfig::from_args(args.options.iter().map(String::as_str));
    tracing::debug!(config = ?config, "emitter configuration");

    let script = open_input(args.input.as_str())?;
    let output = fs::File::create(&config.output)
        .with_context(|| format!("failed to create {}", config.output.display()))?;

    let emitter = TraceEmitter::new(TraceFile::new(output));
    let mut monitor = FunctionMonitor::new();
    if config.trace_calls {
        emitter.attach(&mut monitor, config.space);
    }
    if config.log_calls {
        CallLogger::attach(&mut monitor);
    }

    let events = replay::replay(script, &mut monitor)?;
    let pending = monitor.pending_returns();
    drop(monitor);

    let records = emitter.written();
    emitter.into_inner()?;

    eprintln!("{events} events, {records} records, {pending} calls without return");
    Ok(())
}

fn open_input(input: &str) -> io::Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    Ok(Box::new(BufReader::new(fs::File::open(input)?)))
}
