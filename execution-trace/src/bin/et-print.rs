use anyhow::Result;
use clap::Parser;
use std::fs;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;

use exectrace::reader::{try_break, try_cont, TraceReader};
use exectrace::record::{CacheSim, Record};
use tracing_subscriber::filter::EnvFilter;

/// Prints human readable version of the trace to stderr while continuing
/// to pipe the trace to stdout (or an output file).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,

    /// Output file or '-' to use stdout.
    #[arg(short, long, default_value_t = String::from("-"))]
    output: String,

    /// Stop at the first record that fails to parse instead of skipping it.
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("ET_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let input = open_input(args.input.as_str())?;
    let mut output = open_output(args.output.as_str())?;
    let mut stderr = io::stderr();

    let failure: Option<anyhow::Error> = TraceReader::new(input).for_each(|raw| {
        // Pass trace bytes through to output
        try_break!(output.write_all(raw.bytes()));

        let header = try_cont!(raw.header());
        try_cont!(write!(
            stderr,
            "[{:>12}] ctx={:<4} pid={:#x} ",
            header.timestamp(),
            header.context(),
            header.pid()
        ));

        let record = match raw.parse() {
            Ok(record) => record,
            Err(err) if args.strict => return ControlFlow::Break(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed record");
                try_cont!(writeln!(stderr, "MALFORMED {err}"));
                return ControlFlow::Continue(());
            }
        };

        try_break!(print_record(&mut stderr, &record));
        ControlFlow::Continue(())
    });

    if let Some(err) = failure {
        return Err(err);
    }
    output.flush()?;
    Ok(())
}

fn print_record(out: &mut impl Write, record: &Record) -> io::Result<()> {
    match record {
        Record::ModuleLoad(module) => writeln!(
            out,
            "MODLOAD \"{}\" base={:#x} native={:#x} size={:#x}",
            module.name(),
            module.load_base(),
            module.native_base(),
            module.size()
        ),
        Record::ModuleUnload(module) => {
            writeln!(out, "MODUNLOAD base={:#x}", module.load_base())
        }
        Record::ProcessUnload => writeln!(out, "PROCUNLOAD"),
        Record::Call(call) => {
            writeln!(out, "CALL {:#x} -> {:#x}", call.source(), call.target())
        }
        Record::Return(ret) => {
            writeln!(out, "RET {:#x} -> {:#x}", ret.source(), ret.target())
        }
        Record::Fork(fork) => {
            writeln!(out, "FORK pc={:#x} children={:?}", fork.pc(), fork.children())
        }
        Record::CacheSim(CacheSim::Params(params)) => writeln!(
            out,
            "CACHE PARAMS id={} size={} line={} assoc={} upper={}",
            params.cache_id(),
            params.size(),
            params.line_size(),
            params.associativity(),
            params.upper_cache_id()
        ),
        Record::CacheSim(CacheSim::Name(name)) => {
            writeln!(out, "CACHE NAME id={} \"{}\"", name.id(), name.name())
        }
        Record::CacheSim(CacheSim::Entry(entry)) => writeln!(
            out,
            "CACHE ENTRY id={} pc={:#x} addr={:#x} size={} {}{} misses={}",
            entry.cache_id(),
            entry.pc(),
            entry.address(),
            entry.size(),
            if entry.is_write() { "W" } else { "R" },
            if entry.is_code() { "X" } else { "" },
            entry.miss_count()
        ),
        Record::TestCase(case) => {
            writeln!(out, "TESTCASE {} inputs", case.len())?;
            for (name, data) in case.iter() {
                writeln!(
                    out,
                    "    {} = {:02x?}",
                    String::from_utf8_lossy(name),
                    data
                )?;
            }
            Ok(())
        }
        Record::Opaque(opaque) => writeln!(
            out,
            "{} ({} bytes)",
            opaque.kind(),
            opaque.contents().len()
        ),
    }
}

fn open_input(input: &str) -> io::Result<Box<dyn Read>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    Ok(Box::new(fs::File::open(input)?))
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    Ok(Box::new(fs::File::create(output)?))
}
