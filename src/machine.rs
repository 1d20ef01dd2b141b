//! The trace machine
//!
//! Owns everything a run needs: the emulator child, the trace socket, the
//! gdb client, the guest's output pipes, the registered breakpoints, and
//! the event log. One run is one pass through
//! spawn → connect → map snapshot → install breakpoints → continue →
//! multiplex until every byte source is gone.
//!
//! The whole host side is a single thread. The poll loop is the only
//! place that blocks on readiness; frame reads are read-exactly and the
//! gdb client's synchronous calls block on their acks. The ACK handshake
//! with the plugin means the guest is halted whenever a hook or a
//! breakpoint callback runs, so callbacks observe a stable guest.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::ops::Range;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::process::Child;
use std::time::Duration;

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::connect::{connect, DEFAULT_ATTEMPTS, DEFAULT_DELAY};
use crate::error::{Result, TraceError};
use crate::event::{Event, EventKind, OutputFd};
use crate::gdb::{Arch, GdbClient, GdbStatus, AMD64};
use crate::maps::{self, MapEntry};
use crate::qemu::{self, EmulatorPaths};
use crate::symbols;
use crate::syscalls;
use crate::wire::{self, ControlCommand, TraceInfo, TraceReason, NUM_SYSCALL_ARGS};

nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// Upper bound on one output pipe read
const OUTPUT_CHUNK: usize = 0x10000;

/// Anything the multiplexer can drain: the guest's output pipes in a real
/// run, or whatever stream a test wires in through [`TraceMachine::attach`].
pub trait ByteSource: Read + AsFd {}
impl<T: Read + AsFd> ByteSource for T {}

/// A breakpoint callback; runs with the guest halted at the breakpoint.
pub type BreakpointCallback = Box<dyn FnMut(&mut TraceMachine) -> Result<()>>;

enum BreakpointLocation {
    Address(u64),
    Symbol(String),
}

/// Connection endpoints and emulator layout for a run
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub trace_addr: std::net::SocketAddr,
    pub gdb_addr: std::net::SocketAddr,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub paths: EmulatorPaths,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            trace_addr: ([127, 0, 0, 1], crate::TRACE_PORT).into(),
            gdb_addr: ([127, 0, 0, 1], crate::GDB_PORT).into(),
            connect_attempts: DEFAULT_ATTEMPTS,
            connect_delay: DEFAULT_DELAY,
            paths: EmulatorPaths::default(),
        }
    }
}

/// Customization points of a run.
///
/// The defaults append to the event log and ACK where the protocol
/// requires it; override to observe or reshape events as they arrive.
/// Hooks run with the guest halted awaiting the ACK.
pub trait Hooks {
    fn on_basic_blocks(&mut self, machine: &mut TraceMachine, addrs: &[u64]) -> Result<()> {
        for &addr in addrs {
            machine.record(Event::BasicBlock { addr });
        }
        Ok(())
    }

    fn on_syscall_start(
        &mut self,
        machine: &mut TraceMachine,
        nr: i64,
        args: &[u64],
    ) -> Result<()> {
        machine.record(Event::SyscallStart {
            nr,
            args: args.to_vec(),
        });
        machine.ack()
    }

    fn on_syscall_end(&mut self, machine: &mut TraceMachine, nr: i64, ret: i64) -> Result<()> {
        machine.record(Event::SyscallEnd { nr, ret });
        machine.ack()
    }

    fn on_output(&mut self, machine: &mut TraceMachine, fd: OutputFd, data: &[u8]) -> Result<()> {
        machine.record(Event::Output {
            fd,
            data: data.to_vec(),
        });
        Ok(())
    }
}

/// Record-only hooks, the defaults
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// Recording hooks that also narrate the run: syscall descriptions go to
/// host stderr, guest output is mirrored to host stdout/stderr.
pub struct LogHooks;

impl Hooks for LogHooks {
    fn on_syscall_start(
        &mut self,
        machine: &mut TraceMachine,
        nr: i64,
        args: &[u64],
    ) -> Result<()> {
        machine.record(Event::SyscallStart {
            nr,
            args: args.to_vec(),
        });
        machine.ack()?;
        eprint!("{} ", syscalls::describe(machine.arch().name, nr, args));
        Ok(())
    }

    fn on_syscall_end(&mut self, machine: &mut TraceMachine, nr: i64, ret: i64) -> Result<()> {
        machine.record(Event::SyscallEnd { nr, ret });
        machine.ack()?;
        eprintln!("= {}", syscalls::describe_ret(ret));
        Ok(())
    }

    fn on_output(&mut self, machine: &mut TraceMachine, fd: OutputFd, data: &[u8]) -> Result<()> {
        machine.record(Event::Output {
            fd,
            data: data.to_vec(),
        });
        match fd {
            OutputFd::Stdout => {
                let mut out = std::io::stdout();
                out.write_all(data)?;
                out.flush()?;
            }
            OutputFd::Stderr => {
                let mut err = std::io::stderr();
                err.write_all(data)?;
                err.flush()?;
            }
        }
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
struct Ready {
    trace: bool,
    debug: bool,
    stdout: bool,
    stderr: bool,
}

/// Host-side driver for one traced guest run
pub struct TraceMachine {
    argv: Vec<String>,
    config: TraceConfig,
    arch: &'static Arch,
    trace: Vec<Event>,
    maps: Vec<MapEntry>,
    skip_bb_after_breakpoint: bool,
    exit_code: Option<i32>,
    child: Option<Child>,
    trace_socket: Option<TcpStream>,
    gdb: Option<GdbClient>,
    stdout: Option<Box<dyn ByteSource>>,
    stderr: Option<Box<dyn ByteSource>>,
    pending_breakpoints: Vec<(BreakpointLocation, BreakpointCallback)>,
    callbacks: HashMap<u64, Vec<BreakpointCallback>>,
}

impl TraceMachine {
    pub fn new(argv: Vec<String>) -> Self {
        Self::with_config(argv, TraceConfig::default())
    }

    pub fn with_config(argv: Vec<String>, config: TraceConfig) -> Self {
        TraceMachine {
            argv,
            config,
            arch: &AMD64,
            trace: Vec::new(),
            maps: Vec::new(),
            skip_bb_after_breakpoint: false,
            exit_code: None,
            child: None,
            trace_socket: None,
            gdb: None,
            stdout: None,
            stderr: None,
            pending_breakpoints: Vec::new(),
            callbacks: HashMap::new(),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn arch(&self) -> &'static Arch {
        self.arch
    }

    /// The event log so far, in host arrival order.
    pub fn trace(&self) -> &[Event] {
        &self.trace
    }

    /// The retained memory-map snapshot from the last `update_maps`.
    pub fn maps(&self) -> &[MapEntry] {
        &self.maps
    }

    /// Append one event to the log.
    pub fn record(&mut self, event: Event) {
        trace!("event: {:?}", event);
        self.trace.push(event);
    }

    /// Events of one kind, lazily.
    pub fn filtered_trace(&self, kind: EventKind) -> impl Iterator<Item = &Event> {
        self.trace.iter().filter(move |event| event.kind() == kind)
    }

    /// Events matching an arbitrary predicate, lazily.
    pub fn filtered_by<'a, F>(&'a self, predicate: F) -> impl Iterator<Item = &'a Event>
    where
        F: Fn(&Event) -> bool + 'a,
    {
        self.trace.iter().filter(move |event| predicate(event))
    }

    /// The debug client, while one is attached.
    pub fn gdb(&mut self) -> Result<&mut GdbClient> {
        self.gdb.as_mut().ok_or(TraceError::NoDebugClient)
    }

    /// Cached guest register, by name.
    pub fn register(&self, name: &str) -> Result<u64> {
        self.gdb
            .as_ref()
            .ok_or(TraceError::NoDebugClient)?
            .register(name)
    }

    /// Guest memory over a half-open range.
    pub fn memory(&mut self, range: Range<u64>) -> Result<Vec<u8>> {
        self.gdb()?.memory(range)
    }

    /// Register a breakpoint at an absolute guest address.
    pub fn breakpoint<F>(&mut self, addr: u64, callback: F)
    where
        F: FnMut(&mut TraceMachine) -> Result<()> + 'static,
    {
        self.pending_breakpoints
            .push((BreakpointLocation::Address(addr), Box::new(callback)));
    }

    /// Register a breakpoint at a symbol of the guest binary; the name is
    /// resolved when the run starts.
    pub fn breakpoint_symbol<F>(&mut self, symbol: &str, callback: F)
    where
        F: FnMut(&mut TraceMachine) -> Result<()> + 'static,
    {
        self.pending_breakpoints
            .push((BreakpointLocation::Symbol(symbol.to_string()), Box::new(callback)));
    }

    /// Wire in pre-connected streams instead of spawning the emulator.
    pub fn attach(
        &mut self,
        trace_socket: TcpStream,
        gdb: Option<GdbClient>,
        stdout: Option<Box<dyn ByteSource>>,
        stderr: Option<Box<dyn ByteSource>>,
    ) {
        self.trace_socket = Some(trace_socket);
        self.gdb = gdb;
        self.stdout = stdout;
        self.stderr = stderr;
    }

    /// Spawn the emulator and connect both sockets.
    pub fn start(&mut self) -> Result<()> {
        let mut child = qemu::spawn(&self.config.paths, self.config.gdb_addr.port(), &self.argv)?;
        self.stdout = child
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn ByteSource>);
        self.stderr = child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn ByteSource>);
        self.child = Some(child);
        self.trace_socket = Some(connect(
            self.config.trace_addr,
            self.config.connect_attempts,
            self.config.connect_delay,
        )?);
        self.gdb = Some(GdbClient::connect(self.config.gdb_addr, self.arch)?);
        debug!("started {:?}", self.argv);
        Ok(())
    }

    /// Run the guest to completion, folding everything into the event log.
    pub fn run(&mut self, hooks: &mut dyn Hooks) -> Result<()> {
        let result = self.run_inner(hooks);
        if result.is_err() {
            self.shutdown();
        }
        result
    }

    fn run_inner(&mut self, hooks: &mut dyn Hooks) -> Result<()> {
        if self.trace_socket.is_none() {
            self.start()?;
        }
        self.update_maps()?;
        self.install_breakpoints()?;
        if let Some(gdb) = self.gdb.as_mut() {
            gdb.async_continue()?;
        }
        self.multiplex(hooks)?;
        self.finish()
    }

    fn install_breakpoints(&mut self) -> Result<()> {
        if self.pending_breakpoints.is_empty() {
            return Ok(());
        }
        let program = self.argv.first().cloned().unwrap_or_default();
        for (spec, callback) in self.pending_breakpoints.drain(..) {
            let addr = match spec {
                BreakpointLocation::Address(addr) => addr,
                BreakpointLocation::Symbol(name) => symbols::resolve(Path::new(&program), &name)?,
            };
            self.gdb
                .as_mut()
                .ok_or(TraceError::NoDebugClient)?
                .add_breakpoint(addr)?;
            self.callbacks.entry(addr).or_default().push(callback);
        }
        Ok(())
    }

    /// Write one control command to the plugin.
    fn send_command(&mut self, cmd: ControlCommand) -> Result<()> {
        let socket = self.trace_socket.as_mut().ok_or(TraceError::NotConnected)?;
        wire::write_command(socket, cmd)
    }

    /// Release the guest halted inside the plugin.
    pub fn ack(&mut self) -> Result<()> {
        self.send_command(ControlCommand::Ack)
    }

    /// Refresh the memory-map snapshot from the plugin.
    pub fn update_maps(&mut self) -> Result<()> {
        self.send_command(ControlCommand::RequestMaps)?;
        let text = {
            let socket = self.trace_socket.as_mut().ok_or(TraceError::NotConnected)?;
            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk)?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "trace socket closed during maps dump",
                    )
                    .into());
                }
                raw.extend_from_slice(&chunk[..n]);
                if raw.ends_with(b"\n\n") {
                    break;
                }
            }
            String::from_utf8_lossy(&raw).into_owned()
        };
        let argv0 = self.argv.first().map(String::as_str).unwrap_or("");
        self.maps = maps::parse_maps(&text, argv0)?;
        debug!("memory map: {} entries retained", self.maps.len());
        self.ack()
    }

    /// Ask the plugin to surface its buffered basic blocks now and
    /// consume the resulting async frame.
    pub fn request_flush(&mut self, hooks: &mut dyn Hooks) -> Result<()> {
        self.send_command(ControlCommand::RequestFlush)?;
        match self.handle_trace(hooks)? {
            Some(TraceReason::Async) => Ok(()),
            Some(other) => Err(TraceError::BadFlushReply(other)),
            None => Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "trace socket closed during flush",
            )
            .into()),
        }
    }

    /// Consume one trace frame and dispatch it.
    ///
    /// Returns the frame's reason, or `None` once the trace socket is
    /// gone. If a breakpoint just fired, the frame's first address is the
    /// stale block the plugin re-reports for the breakpoint site; it is
    /// discarded before dispatch.
    pub fn handle_trace(&mut self, hooks: &mut dyn Hooks) -> Result<Option<TraceReason>> {
        let header = {
            let Some(socket) = self.trace_socket.as_mut() else {
                return Ok(None);
            };
            wire::read_header(socket)?
        };
        let Some(header) = header else {
            debug!("trace socket closed");
            self.trace_socket = None;
            return Ok(None);
        };

        let mut num_addrs = header.num_addrs;
        let skip = std::mem::take(&mut self.skip_bb_after_breakpoint);
        let addrs = {
            let Some(socket) = self.trace_socket.as_mut() else {
                return Ok(None);
            };
            if skip && num_addrs > 0 {
                let stale = wire::read_addr(socket)?;
                trace!("discarding stale post-breakpoint block {:#x}", stale);
                num_addrs -= 1;
            } else if skip {
                warn!("post-breakpoint frame carried no stale block to discard");
            }
            wire::read_addrs(socket, num_addrs)?
        };

        hooks.on_basic_blocks(self, &addrs)?;

        match header.info {
            TraceInfo::None => self.ack()?,
            TraceInfo::SyscallStart { nr, args } => {
                let arity = syscalls::arity(self.arch.name, nr).unwrap_or(NUM_SYSCALL_ARGS);
                hooks.on_syscall_start(self, nr, &args[..arity])?;
            }
            TraceInfo::SyscallEnd { nr, ret } => {
                hooks.on_syscall_end(self, nr, ret)?;
            }
        }
        Ok(Some(header.reason))
    }

    /// Consume one gdb stop reply.
    fn handle_debug(&mut self, hooks: &mut dyn Hooks) -> Result<()> {
        let status = {
            let Some(gdb) = self.gdb.as_mut() else {
                return Ok(());
            };
            gdb.async_recv()?
        };
        match status {
            GdbStatus::Exited { code } => {
                // Held until the multiplexer drains: other channels may
                // still carry buffered frames, and the exit event must
                // land last in the log.
                self.exit_code = Some(code);
                self.gdb = None;
            }
            GdbStatus::Stopped { pc } => self.dispatch_breakpoint(pc, hooks)?,
        }
        Ok(())
    }

    fn dispatch_breakpoint(&mut self, pc: u64, hooks: &mut dyn Hooks) -> Result<()> {
        let mut callbacks = self
            .callbacks
            .remove(&pc)
            .ok_or(TraceError::NoCallback { pc })?;
        let result = self.run_breakpoint(&mut callbacks, hooks);
        self.callbacks.insert(pc, callbacks);
        result
    }

    fn run_breakpoint(
        &mut self,
        callbacks: &mut [BreakpointCallback],
        hooks: &mut dyn Hooks,
    ) -> Result<()> {
        // Surface the plugin's buffered blocks before any callback looks
        // at the log, then remember to drop the stale block the plugin
        // re-reports for the breakpoint site.
        self.request_flush(hooks)?;
        for callback in callbacks.iter_mut() {
            callback(self)?;
        }
        self.skip_bb_after_breakpoint = true;
        let gdb = self.gdb.as_mut().ok_or(TraceError::NoDebugClient)?;
        gdb.step()?;
        gdb.async_continue()
    }

    /// Drain one guest output pipe.
    fn handle_output(&mut self, fd: OutputFd, hooks: &mut dyn Hooks) -> Result<()> {
        let data = {
            let source = match fd {
                OutputFd::Stdout => self.stdout.as_mut(),
                OutputFd::Stderr => self.stderr.as_mut(),
            };
            let Some(source) = source else {
                return Ok(());
            };
            let available = available_bytes(source.as_fd().as_raw_fd());
            let mut buf = vec![0u8; available.clamp(1, OUTPUT_CHUNK)];
            let n = source.read(&mut buf)?;
            buf.truncate(n);
            buf
        };
        if data.is_empty() {
            debug!("{:?} closed", fd);
            match fd {
                OutputFd::Stdout => self.stdout = None,
                OutputFd::Stderr => self.stderr = None,
            }
            return Ok(());
        }
        hooks.on_output(self, fd, &data)
    }

    /// Block until at least one source is readable. `None` when every
    /// source is gone and the run is over.
    fn poll_sources(&self) -> Result<Option<Ready>> {
        let mut tags = Vec::with_capacity(4);
        let mut fds = Vec::with_capacity(4);
        if let Some(socket) = &self.trace_socket {
            tags.push(0);
            fds.push(PollFd::new(socket.as_fd(), PollFlags::POLLIN));
        }
        if let Some(gdb) = &self.gdb {
            tags.push(1);
            fds.push(PollFd::new(gdb.as_fd(), PollFlags::POLLIN));
        }
        if let Some(stdout) = &self.stdout {
            tags.push(2);
            fds.push(PollFd::new(stdout.as_fd(), PollFlags::POLLIN));
        }
        if let Some(stderr) = &self.stderr {
            tags.push(3);
            fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
        }
        if fds.is_empty() {
            return Ok(None);
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(std::io::Error::from(errno).into()),
            }
        }

        let mut ready = Ready::default();
        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for (&tag, fd) in tags.iter().zip(fds.iter()) {
            if fd
                .revents()
                .map(|revents| revents.intersects(readable))
                .unwrap_or(false)
            {
                match tag {
                    0 => ready.trace = true,
                    1 => ready.debug = true,
                    2 => ready.stdout = true,
                    _ => ready.stderr = true,
                }
            }
        }
        Ok(Some(ready))
    }

    /// The readiness loop: drain ready sources until all of them close.
    fn multiplex(&mut self, hooks: &mut dyn Hooks) -> Result<()> {
        loop {
            let Some(ready) = self.poll_sources()? else {
                break;
            };
            if ready.trace {
                self.handle_trace(hooks)?;
            }
            if ready.debug {
                self.handle_debug(hooks)?;
            }
            if ready.stdout {
                self.handle_output(OutputFd::Stdout, hooks)?;
            }
            if ready.stderr {
                self.handle_output(OutputFd::Stderr, hooks)?;
            }
        }
        Ok(())
    }

    /// Normal teardown once every source has closed.
    fn finish(&mut self) -> Result<()> {
        if let Some(code) = self.exit_code.take() {
            self.record(Event::Exited { code });
        }
        if let Some(gdb) = self.gdb.take() {
            gdb.detach()?;
        }
        self.trace_socket = None;
        self.stdout = None;
        self.stderr = None;
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            debug!("emulator exited: {}", status);
        }
        Ok(())
    }

    /// Fatal-path teardown: close everything and terminate the child. The
    /// event log up to the fault stays observable.
    fn shutdown(&mut self) {
        self.trace_socket = None;
        self.gdb = None;
        self.stdout = None;
        self.stderr = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!("failed to terminate emulator child: {}", e);
            }
            let _ = child.wait();
        }
    }
}

fn available_bytes(fd: RawFd) -> usize {
    let mut count: libc::c_int = 0;
    match unsafe { fionread(fd, &mut count) } {
        Ok(_) => count.max(0) as usize,
        Err(errno) => {
            warn!("FIONREAD failed on fd {}: {}", fd, errno);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_append_only_in_arrival_order() {
        let mut machine = TraceMachine::new(vec!["/bin/false".to_string()]);
        machine.record(Event::BasicBlock { addr: 0x1000 });
        machine.record(Event::SyscallStart {
            nr: 0,
            args: vec![0],
        });
        machine.record(Event::SyscallEnd { nr: 0, ret: 0 });
        assert_eq!(machine.trace().len(), 3);
        assert_eq!(
            machine.trace()[0],
            Event::BasicBlock { addr: 0x1000 }
        );
    }

    #[test]
    fn filtered_trace_selects_by_kind() {
        let mut machine = TraceMachine::new(vec!["/bin/false".to_string()]);
        machine.record(Event::BasicBlock { addr: 1 });
        machine.record(Event::BasicBlock { addr: 2 });
        machine.record(Event::SyscallEnd { nr: 60, ret: 0 });
        assert_eq!(machine.filtered_trace(EventKind::BasicBlock).count(), 2);
        assert_eq!(machine.filtered_trace(EventKind::SyscallEnd).count(), 1);
        assert_eq!(machine.filtered_trace(EventKind::Output).count(), 0);
    }

    #[test]
    fn filtered_by_takes_predicates() {
        let mut machine = TraceMachine::new(vec!["/bin/false".to_string()]);
        machine.record(Event::BasicBlock { addr: 0x10 });
        machine.record(Event::BasicBlock { addr: 0x4000_0000_0010 });
        let high: Vec<_> = machine
            .filtered_by(|event| matches!(event, Event::BasicBlock { addr } if *addr > 0x1000))
            .collect();
        assert_eq!(high.len(), 1);
    }

    #[test]
    fn accessors_without_connection_error() {
        let mut machine = TraceMachine::new(vec!["/bin/false".to_string()]);
        assert!(matches!(
            machine.register("rip"),
            Err(TraceError::NoDebugClient)
        ));
        assert!(matches!(machine.ack(), Err(TraceError::NotConnected)));
    }
}
