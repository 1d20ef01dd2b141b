//! Retry-loop TCP connection setup
//!
//! The plugin and the gdb stub bring their listeners up at some point
//! after the emulator process is spawned, so the first connection attempts
//! race against them. The connector retries refused connections with a
//! short fixed delay until a bounded attempt budget runs out.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::thread::sleep;
use std::time::Duration;

use log::trace;

use crate::error::{Result, TraceError};

/// Default number of connection attempts
pub const DEFAULT_ATTEMPTS: u32 = 64;
/// Default delay between attempts
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1);

/// Connect to `addr`, retrying while the listener is not up yet.
///
/// Only connection-refused / transport-unavailable errors are retried;
/// anything else propagates immediately. Exhausting the budget returns
/// [`TraceError::Connect`] carrying the last refusal.
pub fn connect(addr: SocketAddr, attempts: u32, delay: Duration) -> Result<TcpStream> {
    let mut last = None;
    for attempt in 0..attempts {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                trace!("connected to {} on attempt {}", addr, attempt + 1);
                return Ok(stream);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::AddrNotAvailable
                ) =>
            {
                last = Some(e);
                sleep(delay);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TraceError::Connect {
        addr,
        attempts,
        source: last.unwrap_or_else(|| ErrorKind::ConnectionRefused.into()),
    })
}
