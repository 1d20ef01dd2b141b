//! Trace socket wire protocol
//!
//! This module is the sole authority over the framing exchanged with the
//! in-emulator trace plugin. Frames flow plugin-to-host: a fixed-size
//! header followed by a variable-length array of basic-block entry
//! addresses. Control commands flow host-to-plugin as single
//! little-endian `u64` values.
//!
//! The header mirrors the plugin's C struct, so the layout is fixed:
//!
//! ```text
//! offset  0  u32  reason            (4 bytes padding follow)
//! offset  8  u64  num_addrs
//! offset 16  i64  syscall_nr
//! offset 24  u64[8] syscall args | i64 syscall return   (64-byte union)
//! ```
//!
//! The union is only meaningful for the syscall reasons and is decoded by
//! dispatching on `reason`, never both ways at once.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TraceError};

/// Number of syscall arguments QEMU exposes to the plugin
pub const NUM_SYSCALL_ARGS: usize = 8;
/// Most basic-block addresses the plugin buffers before forcing a flush
pub const TRACE_MAX_BB_ADDRS: usize = 0x1000;
/// Encoded size of [`TraceHeader`]
pub const TRACE_HEADER_SIZE: usize = 88;
/// Offset of the syscall data union inside the header
pub const TRACE_UNION_OFFSET: usize = 24;

/// Trait that defines serialization of a structure to go over the wire
pub trait ToBytes {
    fn to_bytes(&self, bytes: &mut BytesMut);
}

/// Trait that defines deserialization of a structure from the wire
pub trait FromBytes: Sized {
    fn from_bytes(bytes: &mut BytesMut) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why the plugin emitted a trace frame
pub enum TraceReason {
    /// The basic-block buffer filled up
    Full = 0,
    /// The guest is entering a syscall
    SyscallStart = 1,
    /// The guest returned from a syscall
    SyscallEnd = 2,
    /// The host requested a flush of the buffered addresses
    Async = 3,
}

impl TryFrom<u32> for TraceReason {
    type Error = TraceError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(TraceReason::Full),
            1 => Ok(TraceReason::SyscallStart),
            2 => Ok(TraceReason::SyscallEnd),
            3 => Ok(TraceReason::Async),
            other => Err(TraceError::UnknownTraceReason(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The syscall data union, parsed according to the frame's reason
pub enum TraceInfo {
    /// No syscall payload (`Full` and `Async` frames)
    None,
    /// Entry arguments, register-sized, in ABI order
    SyscallStart {
        nr: i64,
        args: [u64; NUM_SYSCALL_ARGS],
    },
    /// Signed return value
    SyscallEnd { nr: i64, ret: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Fixed-size frame header preceding the basic-block address array
pub struct TraceHeader {
    pub reason: TraceReason,
    pub num_addrs: u64,
    pub info: TraceInfo,
}

impl ToBytes for TraceHeader {
    fn to_bytes(&self, bytes: &mut BytesMut) {
        bytes.put_u32_le(self.reason as u32);
        bytes.put_bytes(0, 4);
        bytes.put_u64_le(self.num_addrs);
        match self.info {
            TraceInfo::None => {
                bytes.put_i64_le(0);
                bytes.put_bytes(0, 64);
            }
            TraceInfo::SyscallStart { nr, args } => {
                bytes.put_i64_le(nr);
                for arg in args {
                    bytes.put_u64_le(arg);
                }
            }
            TraceInfo::SyscallEnd { nr, ret } => {
                bytes.put_i64_le(nr);
                bytes.put_i64_le(ret);
                bytes.put_bytes(0, 56);
            }
        }
    }
}

impl FromBytes for TraceHeader {
    fn from_bytes(bytes: &mut BytesMut) -> Result<Self> {
        let reason = TraceReason::try_from(bytes.get_u32_le())?;
        bytes.advance(4);
        let num_addrs = bytes.get_u64_le();
        let nr = bytes.get_i64_le();
        let info = match reason {
            TraceReason::Full | TraceReason::Async => {
                bytes.advance(64);
                TraceInfo::None
            }
            TraceReason::SyscallStart => {
                let mut args = [0u64; NUM_SYSCALL_ARGS];
                for arg in args.iter_mut() {
                    *arg = bytes.get_u64_le();
                }
                TraceInfo::SyscallStart { nr, args }
            }
            TraceReason::SyscallEnd => {
                let ret = bytes.get_i64_le();
                bytes.advance(56);
                TraceInfo::SyscallEnd { nr, ret }
            }
        };
        Ok(TraceHeader {
            reason,
            num_addrs,
            info,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Control commands written to the plugin, one little-endian `u64` each
pub enum ControlCommand {
    /// Release the halted guest
    Ack = 0,
    /// Surface the buffered basic-block addresses as an `Async` frame
    RequestFlush = 1,
    /// Stream the guest memory map, terminated by a blank line
    RequestMaps = 2,
}

impl ToBytes for ControlCommand {
    fn to_bytes(&self, bytes: &mut BytesMut) {
        bytes.put_u64_le(*self as u64);
    }
}

/// Write one control command to the plugin socket.
pub fn write_command(w: &mut impl Write, cmd: ControlCommand) -> Result<()> {
    w.write_all(&(cmd as u64).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes, resuming short reads.
///
/// Returns `false` if the stream hit EOF before the first byte, which is
/// how a cleanly closed trace socket looks between frames. EOF anywhere
/// else is an error.
fn read_all(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "trace socket closed mid-frame",
                )
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read one frame header, or `None` on EOF at a frame boundary.
pub fn read_header(r: &mut impl Read) -> Result<Option<TraceHeader>> {
    let mut buf = [0u8; TRACE_HEADER_SIZE];
    if !read_all(r, &mut buf)? {
        return Ok(None);
    }
    let mut bytes = BytesMut::from(&buf[..]);
    TraceHeader::from_bytes(&mut bytes).map(Some)
}

/// Read a single basic-block address.
pub fn read_addr(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read `num_addrs` basic-block addresses.
pub fn read_addrs(r: &mut impl Read, num_addrs: u64) -> Result<Vec<u64>> {
    let mut addrs = Vec::with_capacity(num_addrs.min(TRACE_MAX_BB_ADDRS as u64) as usize);
    for _ in 0..num_addrs {
        addrs.push(read_addr(r)?);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(header: TraceHeader) -> TraceHeader {
        let mut bytes = BytesMut::new();
        header.to_bytes(&mut bytes);
        assert_eq!(bytes.len(), TRACE_HEADER_SIZE);
        TraceHeader::from_bytes(&mut bytes).unwrap()
    }

    #[test]
    fn header_roundtrip_full() {
        let header = TraceHeader {
            reason: TraceReason::Full,
            num_addrs: 0x1000,
            info: TraceInfo::None,
        };
        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn header_roundtrip_syscall_start() {
        let header = TraceHeader {
            reason: TraceReason::SyscallStart,
            num_addrs: 3,
            info: TraceInfo::SyscallStart {
                nr: 0,
                args: [3, 0x7fff_dead_0000, 32, 0, 0, 0, 0, 0],
            },
        };
        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn header_roundtrip_syscall_end() {
        let header = TraceHeader {
            reason: TraceReason::SyscallEnd,
            num_addrs: 0,
            info: TraceInfo::SyscallEnd { nr: 231, ret: -2 },
        };
        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn header_roundtrip_async() {
        let header = TraceHeader {
            reason: TraceReason::Async,
            num_addrs: 1,
            info: TraceInfo::None,
        };
        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn unknown_reason_is_fatal() {
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(7);
        bytes.put_bytes(0, TRACE_HEADER_SIZE - 4);
        match TraceHeader::from_bytes(&mut bytes) {
            Err(TraceError::UnknownTraceReason(7)) => {}
            other => panic!("expected unknown reason, got {:?}", other),
        }
    }

    #[test]
    fn union_sits_at_fixed_offset() {
        let header = TraceHeader {
            reason: TraceReason::SyscallEnd,
            num_addrs: 0,
            info: TraceInfo::SyscallEnd { nr: 60, ret: 1 },
        };
        let mut bytes = BytesMut::new();
        header.to_bytes(&mut bytes);
        let ret = i64::from_le_bytes(
            bytes[TRACE_UNION_OFFSET..TRACE_UNION_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(ret, 1);
    }

    #[test]
    fn read_header_eof_at_boundary() {
        let mut empty = Cursor::new(Vec::new());
        assert!(read_header(&mut empty).unwrap().is_none());
    }

    #[test]
    fn read_header_eof_mid_frame() {
        let mut short = Cursor::new(vec![0u8; 10]);
        assert!(read_header(&mut short).is_err());
    }

    #[test]
    fn read_header_from_stream() {
        let header = TraceHeader {
            reason: TraceReason::Full,
            num_addrs: 2,
            info: TraceInfo::None,
        };
        let mut bytes = BytesMut::new();
        header.to_bytes(&mut bytes);
        bytes.put_u64_le(0x4000_0000_0000);
        bytes.put_u64_le(0x4000_0000_1000);

        let mut stream = Cursor::new(bytes.to_vec());
        let decoded = read_header(&mut stream).unwrap().unwrap();
        assert_eq!(decoded, header);
        let addrs = read_addrs(&mut stream, decoded.num_addrs).unwrap();
        assert_eq!(addrs, vec![0x4000_0000_0000, 0x4000_0000_1000]);
    }

    #[test]
    fn command_encoding() {
        let mut bytes = BytesMut::new();
        ControlCommand::Ack.to_bytes(&mut bytes);
        ControlCommand::RequestFlush.to_bytes(&mut bytes);
        ControlCommand::RequestMaps.to_bytes(&mut bytes);
        assert_eq!(&bytes[..8], &[0; 8]);
        assert_eq!(&bytes[8..16], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[16..24], &[2, 0, 0, 0, 0, 0, 0, 0]);

        let mut out = Vec::new();
        write_command(&mut out, ControlCommand::Ack).unwrap();
        assert_eq!(out, vec![0; 8]);
    }
}
