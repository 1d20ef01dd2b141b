//! qtrace is a dynamic execution tracer for unmodified guest binaries
//! running under QEMU with the qtrace plugin loaded. It drives the emulator
//! from the host side: it spawns QEMU, speaks the plugin's binary trace
//! protocol on one socket and the gdb remote protocol on another, captures
//! the guest's stdout/stderr, and folds everything into a single ordered
//! event log.
//!
//! The usual entry point is [`TraceMachine`]:
//!
//! ```no_run
//! use qtrace::{DefaultHooks, TraceMachine};
//!
//! let mut machine = TraceMachine::new(vec!["/bin/false".into()]);
//! machine.run(&mut DefaultHooks)?;
//! for event in machine.trace() {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), qtrace::TraceError>(())
//! ```
//!
//! Breakpoints are registered before the run and observe guest state
//! through the gdb client:
//!
//! ```no_run
//! use qtrace::{DefaultHooks, Event, TraceMachine};
//!
//! let mut machine = TraceMachine::new(vec!["./factorial".into(), "7".into()]);
//! machine.breakpoint_symbol("factorial", |m| {
//!     let rdi = m.register("rdi")?;
//!     m.record(Event::Test(serde_json::json!({ "rdi": rdi })));
//!     Ok(())
//! });
//! machine.run(&mut DefaultHooks)?;
//! # Ok::<(), qtrace::TraceError>(())
//! ```

pub mod connect;
pub mod error;
pub mod event;
pub mod gdb;
pub mod machine;
pub mod maps;
pub mod qemu;
pub mod symbols;
pub mod syscalls;
pub mod wire;

pub use connect::connect;
pub use error::{Result, TraceError};
pub use event::{Event, EventKind, OutputFd};
pub use gdb::{Arch, GdbClient, GdbStatus, AMD64};
pub use machine::{DefaultHooks, Hooks, LogHooks, TraceConfig, TraceMachine};
pub use maps::MapEntry;
pub use qemu::{resolve_program, EmulatorPaths};
pub use wire::{ControlCommand, TraceHeader, TraceInfo, TraceReason};

/// Default port the trace plugin listens on.
pub const TRACE_PORT: u16 = 4242;
/// Default port QEMU's gdb stub listens on.
pub const GDB_PORT: u16 = 1234;
