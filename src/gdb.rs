//! Minimal gdb remote protocol client
//!
//! Just enough of the protocol to drive QEMU's gdb stub: packet framing
//! with checksums, the `g`/`m` reads, software breakpoints, single-step,
//! and asynchronous continue. Packets look like `$payload#cc` where `cc`
//! is the byte sum of the payload mod 256, and every packet is answered
//! with a `+` transport ack by the receiving side.
//!
//! The client owns its socket and the set of installed breakpoint
//! addresses. Which callbacks run at a stop is the trace machine's
//! business; the client only reports stops and exits through
//! [`GdbClient::async_recv`].

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::ops::Range;
use std::os::fd::{AsFd, BorrowedFd};

use log::{debug, trace};

use crate::connect::{connect, DEFAULT_ATTEMPTS, DEFAULT_DELAY};
use crate::error::{Result, TraceError};

/// Breakpoint kind field of `Z0`/`z0` packets, fixed by the stub
const SW_BREAKPOINT_KIND: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Register bank description for one target architecture
#[derive(Debug, Clone, Copy)]
pub struct Arch {
    pub name: &'static str,
    /// Register names in the order the `g` packet concatenates them
    pub regs: &'static [&'static str],
    /// Declared register width in bits
    pub bits: u32,
    pub endian: Endian,
    /// Name of the program counter register
    pub pc: &'static str,
}

#[rustfmt::skip]
pub static AMD64: Arch = Arch {
    name: "x86_64",
    regs: &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
        "rip", "eflags", "cs", "ss", "ds", "es", "fs", "gs",
        "st0", "st1", "st2", "st3", "st4", "st5", "st6", "st7",
        "fctrl", "fstat", "ftag", "fiseg", "fioff", "foseg", "fooff", "fop",
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7",
        "xmm8", "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
        "mxcsr",
    ],
    bits: 64,
    endian: Endian::Little,
    pc: "rip",
};

/// What the stub reported from an asynchronous receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GdbStatus {
    /// SIGTRAP stop; the register bank has been refreshed and `pc` is
    /// the current program counter
    Stopped { pc: u64 },
    /// The guest process exited with this status; the stub is gone
    Exited { code: i32 },
}

/// Sum of the payload bytes mod 256, the packet checksum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn hex_to_bytes(hex: &[u8]) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

/// Minimal gdb remote client over one TCP connection
pub struct GdbClient {
    stream: TcpStream,
    arch: &'static Arch,
    registers: HashMap<&'static str, u64>,
    breakpoints: BTreeSet<u64>,
}

impl GdbClient {
    /// Connect to the stub and fetch the initial register bank.
    pub fn connect(addr: SocketAddr, arch: &'static Arch) -> Result<Self> {
        let stream = connect(addr, DEFAULT_ATTEMPTS, DEFAULT_DELAY)?;
        let mut client = GdbClient {
            stream,
            arch,
            registers: HashMap::new(),
            breakpoints: BTreeSet::new(),
        };
        client.fetch_registers()?;
        Ok(client)
    }

    pub fn arch(&self) -> &'static Arch {
        self.arch
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Send one command packet and consume the transport ack.
    fn send(&mut self, cmd: &str) -> Result<()> {
        trace!("gdb -> {}", cmd);
        let packet = format!("${}#{:02x}", cmd, checksum(cmd.as_bytes()));
        self.stream.write_all(packet.as_bytes())?;
        let ack = self.read_byte()?;
        if ack != b'+' {
            return Err(TraceError::UnexpectedReply {
                context: "transport ack",
                reply: (ack as char).to_string(),
            });
        }
        Ok(())
    }

    /// Receive one reply packet, verify its checksum, and ack it.
    fn recv(&mut self) -> Result<Vec<u8>> {
        let start = self.read_byte()?;
        if start != b'$' {
            return Err(TraceError::UnexpectedReply {
                context: "packet start",
                reply: (start as char).to_string(),
            });
        }
        let mut payload = Vec::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'#' {
                break;
            }
            payload.push(byte);
        }
        let mut cs = [0u8; 2];
        self.stream.read_exact(&mut cs)?;
        let received = u8::from_str_radix(
            std::str::from_utf8(&cs).unwrap_or_default(),
            16,
        )
        .map_err(|_| TraceError::UnexpectedReply {
            context: "checksum field",
            reply: String::from_utf8_lossy(&cs).to_string(),
        })?;
        let computed = checksum(&payload);
        if computed != received {
            return Err(TraceError::Checksum { computed, received });
        }
        self.stream.write_all(b"+")?;
        trace!("gdb <- {}", String::from_utf8_lossy(&payload));
        Ok(payload)
    }

    fn recv_ok(&mut self, context: &'static str) -> Result<()> {
        let reply = self.recv()?;
        if reply != b"OK" {
            return Err(TraceError::UnexpectedReply {
                context,
                reply: String::from_utf8_lossy(&reply).to_string(),
            });
        }
        Ok(())
    }

    /// Fetch the whole register bank with `g` and refresh the cache.
    ///
    /// The reply is a concatenation of fixed-width hex values in the
    /// architecture's declared register order, width, and endianness.
    pub fn fetch_registers(&mut self) -> Result<&HashMap<&'static str, u64>> {
        self.send("g")?;
        let reply = self.recv()?;
        let width = (self.arch.bits / 4) as usize;
        let mut registers = HashMap::new();
        for (i, name) in self.arch.regs.iter().enumerate() {
            let field = reply
                .get(i * width..(i + 1) * width)
                .and_then(hex_to_bytes)
                .ok_or_else(|| TraceError::UnexpectedReply {
                    context: "g",
                    reply: String::from_utf8_lossy(&reply).to_string(),
                })?;
            let value = match self.arch.endian {
                Endian::Little => field.iter().rev().fold(0u64, |acc, b| acc << 8 | *b as u64),
                Endian::Big => field.iter().fold(0u64, |acc, b| acc << 8 | *b as u64),
            };
            registers.insert(*name, value);
        }
        self.registers = registers;
        Ok(&self.registers)
    }

    /// Read one register from the cached bank.
    pub fn register(&self, name: &str) -> Result<u64> {
        self.registers
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::UnknownRegister(name.to_string()))
    }

    /// Current program counter from the cached bank.
    pub fn pc(&self) -> Result<u64> {
        self.register(self.arch.pc)
    }

    /// Read `len` bytes of guest memory at `addr`.
    pub fn fetch_memory(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.send(&format!("m{:x},{}", addr, len))?;
        let reply = self.recv()?;
        hex_to_bytes(&reply).ok_or_else(|| TraceError::UnexpectedReply {
            context: "m",
            reply: String::from_utf8_lossy(&reply).to_string(),
        })
    }

    /// Read a half-open range of guest memory.
    pub fn memory(&mut self, range: Range<u64>) -> Result<Vec<u8>> {
        self.fetch_memory(range.start, range.end.saturating_sub(range.start))
    }

    /// Install a software breakpoint. Installing the same address twice
    /// is a no-op; one `Z0` goes out per distinct address.
    pub fn add_breakpoint(&mut self, addr: u64) -> Result<()> {
        if self.breakpoints.contains(&addr) {
            return Ok(());
        }
        self.send(&format!("Z0,{:x},{}", addr, SW_BREAKPOINT_KIND))?;
        self.recv_ok("Z0")?;
        self.breakpoints.insert(addr);
        debug!("installed breakpoint at {:#x}", addr);
        Ok(())
    }

    /// Addresses currently installed.
    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.breakpoints.iter().copied()
    }

    /// Step one instruction; the stub must stop with SIGTRAP.
    pub fn step(&mut self) -> Result<()> {
        self.send("s")?;
        let reply = self.recv()?;
        if reply != b"S05" {
            return Err(TraceError::UnexpectedReply {
                context: "s",
                reply: String::from_utf8_lossy(&reply).to_string(),
            });
        }
        Ok(())
    }

    /// Resume the guest without waiting for the stop reply; the reply is
    /// observed later through [`GdbClient::async_recv`].
    pub fn async_continue(&mut self) -> Result<()> {
        self.send("c")
    }

    /// Read one stop reply once the socket is readable.
    ///
    /// `S05` refreshes the register bank and reports the stop; `W<xx>`
    /// reports guest exit. Anything else is a protocol error.
    pub fn async_recv(&mut self) -> Result<GdbStatus> {
        let reply = self.recv()?;
        match reply.first().copied() {
            Some(b'W') if reply.len() == 3 => {
                let code = i32::from_str_radix(
                    std::str::from_utf8(&reply[1..]).unwrap_or_default(),
                    16,
                )
                .map_err(|_| TraceError::UnexpectedReply {
                    context: "stop reply",
                    reply: String::from_utf8_lossy(&reply).to_string(),
                })?;
                debug!("guest exited with status {}", code);
                Ok(GdbStatus::Exited { code })
            }
            Some(b'S') if reply == b"S05" => {
                self.fetch_registers()?;
                let pc = self.pc()?;
                debug!("SIGTRAP at {:#x}", pc);
                Ok(GdbStatus::Stopped { pc })
            }
            _ => Err(TraceError::UnexpectedReply {
                context: "stop reply",
                reply: String::from_utf8_lossy(&reply).to_string(),
            }),
        }
    }

    /// Uninstall every breakpoint, detach from the stub, and close.
    pub fn detach(mut self) -> Result<()> {
        let addrs: Vec<u64> = self.breakpoints.iter().copied().collect();
        for addr in addrs {
            self.send(&format!("z0,{:x},{}", addr, SW_BREAKPOINT_KIND))?;
            self.recv_ok("z0")?;
            self.breakpoints.remove(&addr);
        }
        self.send("D")?;
        self.recv_ok("D")?;
        Ok(())
    }
}

impl AsFd for GdbClient {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Scripted counterpart playing the stub side of the protocol.
    struct Stub {
        stream: TcpStream,
    }

    impl Stub {
        fn accept(listener: TcpListener) -> Self {
            let (stream, _) = listener.accept().unwrap();
            Stub { stream }
        }

        fn read_byte(&mut self) -> u8 {
            let mut byte = [0u8; 1];
            self.stream.read_exact(&mut byte).unwrap();
            byte[0]
        }

        /// Receive one command packet, verifying its checksum.
        fn recv_packet(&mut self) -> String {
            let mut byte = self.read_byte();
            while byte == b'+' {
                byte = self.read_byte();
            }
            assert_eq!(byte, b'$');
            let mut payload = Vec::new();
            loop {
                let byte = self.read_byte();
                if byte == b'#' {
                    break;
                }
                payload.push(byte);
            }
            let mut cs = [0u8; 2];
            self.stream.read_exact(&mut cs).unwrap();
            let received =
                u8::from_str_radix(std::str::from_utf8(&cs).unwrap(), 16).unwrap();
            assert_eq!(received, checksum(&payload), "client sent a bad checksum");
            self.stream.write_all(b"+").unwrap();
            String::from_utf8(payload).unwrap()
        }

        fn send_packet(&mut self, payload: &str) {
            let packet = format!("${}#{:02x}", payload, checksum(payload.as_bytes()));
            self.stream.write_all(packet.as_bytes()).unwrap();
        }

        /// Send a packet with a deliberately wrong checksum.
        fn send_corrupt_packet(&mut self, payload: &str) {
            let bad = checksum(payload.as_bytes()).wrapping_add(1);
            let packet = format!("${}#{:02x}", payload, bad);
            self.stream.write_all(packet.as_bytes()).unwrap();
        }
    }

    /// Hex register bank with the named registers set and the rest zero.
    fn bank(values: &[(&str, u64)]) -> String {
        let mut out = String::new();
        for reg in AMD64.regs {
            let value = values
                .iter()
                .find(|(name, _)| name == reg)
                .map(|(_, v)| *v)
                .unwrap_or(0);
            for byte in value.to_le_bytes() {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        out
    }

    fn listen() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn with_stub(
        script: impl FnOnce(&mut Stub) + Send + 'static,
    ) -> (SocketAddr, JoinHandle<()>) {
        let (listener, addr) = listen();
        let handle = thread::spawn(move || {
            let mut stub = Stub::accept(listener);
            script(&mut stub);
        });
        (addr, handle)
    }

    #[test]
    fn checksum_matches_protocol() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"g"), b'g');
    }

    #[test]
    fn connect_fetches_initial_bank() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[("rip", 0x40_0000_1000), ("rax", 1)]));
        });

        let client = GdbClient::connect(addr, &AMD64).unwrap();
        assert_eq!(client.register("rip").unwrap(), 0x40_0000_1000);
        assert_eq!(client.register("rax").unwrap(), 1);
        assert_eq!(client.register("rbx").unwrap(), 0);
        assert_eq!(client.pc().unwrap(), 0x40_0000_1000);
        stub.join().unwrap();
    }

    #[test]
    fn unknown_register_errors() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
        });

        let client = GdbClient::connect(addr, &AMD64).unwrap();
        assert!(matches!(
            client.register("cr3"),
            Err(TraceError::UnknownRegister(_))
        ));
        stub.join().unwrap();
    }

    #[test]
    fn fetch_memory_decodes_hex() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
            assert_eq!(stub.recv_packet(), "m401000,4");
            stub.send_packet("deadbeef");
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        let bytes = client.memory(0x401000..0x401004).unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        stub.join().unwrap();
    }

    #[test]
    fn breakpoint_installed_once_and_removed_once() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
            assert_eq!(stub.recv_packet(), "Z0,401000,2");
            stub.send_packet("OK");
            // Second add at the same address must not reach the stub.
            assert_eq!(stub.recv_packet(), "z0,401000,2");
            stub.send_packet("OK");
            assert_eq!(stub.recv_packet(), "D");
            stub.send_packet("OK");
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        client.add_breakpoint(0x401000).unwrap();
        client.add_breakpoint(0x401000).unwrap();
        assert_eq!(client.breakpoints().collect::<Vec<_>>(), vec![0x401000]);
        client.detach().unwrap();
        stub.join().unwrap();
    }

    #[test]
    fn step_requires_sigtrap() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
            assert_eq!(stub.recv_packet(), "s");
            stub.send_packet("S05");
            assert_eq!(stub.recv_packet(), "s");
            stub.send_packet("S0b");
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        client.step().unwrap();
        assert!(matches!(
            client.step(),
            Err(TraceError::UnexpectedReply { context: "s", .. })
        ));
        stub.join().unwrap();
    }

    #[test]
    fn async_recv_reports_exit() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
            assert_eq!(stub.recv_packet(), "c");
            stub.send_packet("W2a");
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        client.async_continue().unwrap();
        assert_eq!(
            client.async_recv().unwrap(),
            GdbStatus::Exited { code: 0x2a }
        );
        stub.join().unwrap();
    }

    #[test]
    fn async_recv_refreshes_bank_on_sigtrap() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[("rip", 0x1000)]));
            assert_eq!(stub.recv_packet(), "c");
            stub.send_packet("S05");
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[("rip", 0x2000), ("rdi", 7)]));
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        client.async_continue().unwrap();
        assert_eq!(
            client.async_recv().unwrap(),
            GdbStatus::Stopped { pc: 0x2000 }
        );
        assert_eq!(client.register("rdi").unwrap(), 7);
        stub.join().unwrap();
    }

    #[test]
    fn async_recv_rejects_unknown_stop_reply() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_packet(&bank(&[]));
            stub.send_packet("T05thread:1;");
        });

        let mut client = GdbClient::connect(addr, &AMD64).unwrap();
        assert!(matches!(
            client.async_recv(),
            Err(TraceError::UnexpectedReply { .. })
        ));
        stub.join().unwrap();
    }

    #[test]
    fn corrupt_checksum_is_fatal() {
        let (addr, stub) = with_stub(|stub| {
            assert_eq!(stub.recv_packet(), "g");
            stub.send_corrupt_packet(&bank(&[]));
        });

        assert!(matches!(
            GdbClient::connect(addr, &AMD64),
            Err(TraceError::Checksum { .. })
        ));
        stub.join().unwrap();
    }
}
