//! Error types for the tracer driver
//!
//! Failures fall into the classes the run loop cares about: transient
//! connectivity (retried by the connector, surfaced once the budget is
//! exhausted), protocol violations on either socket (always fatal), and
//! plain I/O errors from the child's pipes.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the trace machine and its components
#[derive(Debug, Error)]
pub enum TraceError {
    /// The connector ran out of attempts without the listener coming up
    #[error("failed to connect to {addr} after {attempts} attempts")]
    Connect {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The plugin sent a trace header with a reason outside the known set
    #[error("unknown trace reason {0:#x}")]
    UnknownTraceReason(u32),

    /// A gdb packet arrived whose checksum does not match its payload
    #[error("gdb checksum mismatch: computed {computed:02x}, received {received:02x}")]
    Checksum { computed: u8, received: u8 },

    /// The gdb stub answered something the protocol does not allow here
    #[error("unexpected gdb reply to {context}: {reply:?}")]
    UnexpectedReply {
        context: &'static str,
        reply: String,
    },

    /// The guest stopped at an address nobody registered a breakpoint for
    #[error("breakpoint hit at {pc:#x} with no registered callback")]
    NoCallback { pc: u64 },

    #[error("unknown register {0:?}")]
    UnknownRegister(String),

    /// An operation needed the debug client after it was closed
    #[error("no debug client attached")]
    NoDebugClient,

    /// An operation needed the trace socket before start or after close
    #[error("trace socket not connected")]
    NotConnected,

    #[error("malformed memory map line {0:?}")]
    MapLine(String),

    #[error("failed to parse object file {}", path.display())]
    Object {
        path: PathBuf,
        #[source]
        source: object::read::Error,
    },

    #[error("symbol {symbol:?} not found in {}", path.display())]
    SymbolNotFound { symbol: String, path: PathBuf },

    /// The emulator child could not be spawned
    #[error("failed to launch emulator {}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A flush request was answered by a frame that is not an async frame
    #[error("flush answered by {0:?} frame")]
    BadFlushReply(crate::wire::TraceReason),
}

pub type Result<T> = std::result::Result<T, TraceError>;
