//! qtrace driver binary
//!
//! Thin shell over the trace machine: resolve the guest program, run it
//! under the emulator with logging hooks, and print a summary of what was
//! traced.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use qtrace::{resolve_program, EventKind, LogHooks, TraceMachine};

#[derive(Parser, Debug)]
/// Trace a program under QEMU with the qtrace plugin
struct Args {
    /// Log level
    #[clap(short = 'L', long, default_value = "error")]
    log_level: LevelFilter,
    /// The program to trace
    #[clap()]
    program: String,
    /// The arguments to the program
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    SimpleLogger::new().with_level(args.log_level).init()?;

    let Some(program) = resolve_program(&args.program) else {
        bail!("no such file: {}", args.program);
    };

    let start = Instant::now();

    let mut argv = vec![program.to_string_lossy().to_string()];
    argv.extend(args.args);
    let mut machine = TraceMachine::new(argv);
    machine.run(&mut LogHooks)?;

    println!("\n");
    for (kind, description) in [
        (EventKind::BasicBlock, "basic blocks"),
        (EventKind::SyscallStart, "syscalls"),
        (EventKind::Output, "outputs"),
    ] {
        let total = machine.filtered_trace(kind).count();
        let unique = machine
            .filtered_trace(kind)
            .filter_map(|event| serde_json::to_string(event).ok())
            .collect::<HashSet<_>>()
            .len();
        println!("Traced {} {} ({} unique)", total, description, unique);
    }
    println!("Took {:.4}s", start.elapsed().as_secs_f64());

    Ok(())
}
