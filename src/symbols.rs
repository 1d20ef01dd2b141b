//! Guest symbol resolution
//!
//! Breakpoints may be registered by symbol name; the name is resolved
//! against the guest binary's symbol table when the machine starts.

use std::path::Path;

use object::{Object, ObjectSymbol};

use crate::error::{Result, TraceError};

/// Resolve `symbol` to its address in the object file at `path`.
///
/// The regular symbol table is consulted first, then the dynamic one.
pub fn resolve(path: &Path, symbol: &str) -> Result<u64> {
    let data = std::fs::read(path)?;
    let file = object::File::parse(&*data).map_err(|source| TraceError::Object {
        path: path.to_path_buf(),
        source,
    })?;
    for sym in file.symbols().chain(file.dynamic_symbols()) {
        if sym.name() == Ok(symbol) {
            return Ok(sym.address());
        }
    }
    Err(TraceError::SymbolNotFound {
        symbol: symbol.to_string(),
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{Object as ObjectWriter, Symbol, SymbolSection};
    use object::{
        Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind,
        SymbolScope,
    };
    use std::io::Write;

    fn sample_elf() -> Vec<u8> {
        let mut obj = ObjectWriter::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90; 0x40], 16);
        obj.add_symbol(Symbol {
            name: b"factorial".to_vec(),
            value: 0x20,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    }

    #[test]
    fn resolves_defined_symbol() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample_elf()).unwrap();
        assert_eq!(resolve(file.path(), "factorial").unwrap(), 0x20);
    }

    #[test]
    fn missing_symbol_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample_elf()).unwrap();
        assert!(matches!(
            resolve(file.path(), "fibonacci"),
            Err(TraceError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn garbage_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not an object file").unwrap();
        assert!(matches!(
            resolve(file.path(), "factorial"),
            Err(TraceError::Object { .. })
        ));
    }

    #[test]
    fn unreadable_path_errors() {
        assert!(matches!(
            resolve(Path::new("/nonexistent/guest"), "factorial"),
            Err(TraceError::Io(_))
        ));
    }
}
