//! Emulator launcher
//!
//! Spawns QEMU out of a self-contained deps directory: the dynamic loader
//! and libraries ship alongside the emulator and the trace plugin, so the
//! child is started as `loader --library-path <libs> <qemu> ...` and does
//! not depend on the host's installed libraries. The guest's stdout and
//! stderr are captured as pipes; stdin is inherited.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use log::debug;

use crate::error::{Result, TraceError};

/// Environment variable overriding the deps directory location
pub const DEPS_ENV: &str = "QTRACE_DEPS";

/// Locations of the emulator and its support files
#[derive(Debug, Clone)]
pub struct EmulatorPaths {
    /// Dynamic loader used to start the emulator
    pub loader: PathBuf,
    /// Directory passed as `--library-path`
    pub library_path: PathBuf,
    /// The emulator binary
    pub qemu: PathBuf,
    /// The trace plugin shared object
    pub plugin: PathBuf,
}

impl EmulatorPaths {
    /// Standard layout below a deps directory.
    pub fn from_deps_dir(deps: &Path) -> Self {
        EmulatorPaths {
            loader: deps.join("lib64/ld-linux-x86-64.so.2"),
            library_path: deps.join("lib/x86_64-linux-gnu"),
            qemu: deps.join("usr/local/bin/qemu-x86_64"),
            plugin: deps.join("libqtrace.so"),
        }
    }
}

impl Default for EmulatorPaths {
    fn default() -> Self {
        let deps = env::var_os(DEPS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deps"));
        Self::from_deps_dir(&deps)
    }
}

/// Spawn the emulator with the plugin loaded and the gdb stub listening.
pub fn spawn(paths: &EmulatorPaths, gdb_port: u16, argv: &[String]) -> Result<Child> {
    debug!("spawning {} for {:?}", paths.qemu.display(), argv);
    Command::new(&paths.loader)
        .arg("--library-path")
        .arg(&paths.library_path)
        .arg(&paths.qemu)
        .arg("--gdb-port")
        .arg(gdb_port.to_string())
        .arg("--plugin")
        .arg(&paths.plugin)
        .args(argv)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| TraceError::Launch {
            program: paths.qemu.clone(),
            source,
        })
}

/// Resolve a guest program: an existing path wins, otherwise relative
/// names are searched in `PATH`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if program.starts_with('/') {
        return None;
    }
    for dir in env::split_paths(&env::var_os("PATH")?) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
