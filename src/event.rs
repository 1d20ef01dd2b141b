//! The event log
//!
//! Every observation the machine makes lands in one ordered, append-only
//! log. Order is host arrival order at the multiplexer: within a channel
//! it equals production order, across channels it is whatever the
//! readiness loop saw first.

use serde::Serialize;

/// Which output stream of the guest a byte chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutputFd {
    Stdout = 1,
    Stderr = 2,
}

/// One entry in the trace event log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    /// A basic block was entered at this guest virtual address
    BasicBlock { addr: u64 },
    /// Syscall entry, arguments truncated to the decoder table's arity
    SyscallStart { nr: i64, args: Vec<u64> },
    /// Syscall return with its signed return value
    SyscallEnd { nr: i64, ret: i64 },
    /// Raw bytes the guest wrote to stdout or stderr
    Output { fd: OutputFd, data: Vec<u8> },
    /// User-defined payload appended by a breakpoint callback
    Test(serde_json::Value),
    /// The guest process exited. Recorded once every channel has
    /// drained, so for a run that completes normally this is the last
    /// event in the log.
    Exited { code: i32 },
}

/// Discriminant used to filter the log by variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BasicBlock,
    SyscallStart,
    SyscallEnd,
    Output,
    Test,
    Exited,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BasicBlock { .. } => EventKind::BasicBlock,
            Event::SyscallStart { .. } => EventKind::SyscallStart,
            Event::SyscallEnd { .. } => EventKind::SyscallEnd,
            Event::Output { .. } => EventKind::Output,
            Event::Test(_) => EventKind::Test,
            Event::Exited { .. } => EventKind::Exited,
        }
    }
}
