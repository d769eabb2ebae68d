//! Binary format parsers for IL2CPP analysis
//!
//! Detects the container by its leading magic and decodes PE (Windows),
//! ELF (Linux/Android), Mach-O (macOS/iOS, thin and universal), NSO
//! (Switch) and WebAssembly into a common addressable view.

pub mod common;
pub mod elf;
pub mod error;
pub mod fat;
pub mod image;
pub mod macho;
pub mod nso;
pub mod pe;
pub mod wasm;

pub use common::{BinaryFile, BinaryReader, Section, SectionFlags, Symbol, SymbolType};
pub use error::{ParseError, ParseResult};
pub use fat::{FatMachO, SliceInfo};
pub use image::{detect, ContainerImage, ContainerKind, Detection};

use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Map a file read-only into memory
pub fn map_file(path: &Path) -> ParseResult<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and the caller keeps it alive for as
    // long as the borrowed bytes are in use.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

