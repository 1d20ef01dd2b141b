//! Guest memory-map snapshot
//!
//! The plugin answers `REQUEST_MAPS` with an ASCII dump in the
//! `/proc/self/maps` layout, terminated by a blank line. Only a slice of
//! it matters to trace consumers: the guest-application window QEMU maps
//! guest code into, plus the program image and the usual special regions.

use crate::error::{Result, TraceError};

/// Start of the address window QEMU places guest application mappings in
pub const GUEST_REGION_START: u64 = 0x40_0000_0000;
/// End (exclusive) of the guest application window
pub const GUEST_REGION_END: u64 = 0x50_0000_0000;

/// Pathnames kept regardless of address
const SPECIAL_PATHS: [&str; 5] = ["[heap]", "[stack]", "[vvar]", "[vdso]", "[vsyscall]"];

/// One retained mapping, a half-open range `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub path: String,
}

impl MapEntry {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Parse one maps line with the fixed six-field layout.
pub fn parse_line(line: &str) -> Result<MapEntry> {
    let bad = || TraceError::MapLine(line.to_string());

    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or_else(bad)?;
    let perms = fields.next().ok_or_else(bad)?;
    let offset = fields.next().ok_or_else(bad)?;
    let _dev = fields.next().ok_or_else(bad)?;
    let _inode = fields.next().ok_or_else(bad)?;
    let path = fields.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-').ok_or_else(bad)?;
    Ok(MapEntry {
        start: u64::from_str_radix(start, 16).map_err(|_| bad())?,
        end: u64::from_str_radix(end, 16).map_err(|_| bad())?,
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).map_err(|_| bad())?,
        path,
    })
}

/// Whether an entry survives the snapshot filter: its range touches the
/// guest application window, or its pathname is the traced program or one
/// of the special regions.
pub fn retained(entry: &MapEntry, argv0: &str) -> bool {
    let in_window = |addr: u64| (GUEST_REGION_START..GUEST_REGION_END).contains(&addr);
    in_window(entry.start)
        || (entry.end > GUEST_REGION_START && entry.end <= GUEST_REGION_END)
        || entry.path == argv0
        || SPECIAL_PATHS.contains(&entry.path.as_str())
}

/// Parse a full maps dump and keep the entries that pass the filter.
pub fn parse_maps(text: &str, argv0: &str) -> Result<Vec<MapEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse_line(line)?;
        if retained(&entry, argv0) {
            entries.push(entry);
        }
    }
    Ok(entries)
}
