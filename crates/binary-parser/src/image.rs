//! Format detection by leading magic and the closed set of decoded images

use crate::common::BinaryFile;
use crate::elf::ElfFile;
use crate::error::{ParseError, ParseResult};
use crate::fat::{FatMachO, FAT_CIGAM, FAT_MAGIC};
use crate::macho::{MachOFile, MH_MAGIC, MH_MAGIC_64};
use crate::nso::{NsoFile, NSO_MAGIC};
use crate::pe::PeFile;
use crate::wasm::{WasmFile, WASM_MAGIC};
use ilrecover_core::Address;
use tracing::debug;

/// "MZ" followed by the usual 0x90 of a DOS stub
pub const PE_MAGIC: u32 = 0x00905A4D;
/// "\x7fELF"
pub const ELF_MAGIC: u32 = 0x464C457F;

/// Container kinds selected by the leading little-endian magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    WebAssembly,
    Nso,
    Pe,
    Elf32,
    Elf64,
    FatMachO,
    MachO32,
    MachO64,
}

impl ContainerKind {
    /// Classify a blob by its first four bytes
    pub fn classify(data: &[u8]) -> ParseResult<Self> {
        let Some(head) = data.get(..4) else {
            return Err(ParseError::truncated(4, data.len()));
        };
        let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);

        let kind = match magic {
            WASM_MAGIC => Self::WebAssembly,
            NSO_MAGIC => Self::Nso,
            PE_MAGIC => Self::Pe,
            ELF_MAGIC if data.get(4) == Some(&2) => Self::Elf64,
            ELF_MAGIC => Self::Elf32,
            FAT_MAGIC | FAT_CIGAM => Self::FatMachO,
            MH_MAGIC_64 => Self::MachO64,
            MH_MAGIC => Self::MachO32,
            _ => return Err(ParseError::UnsupportedFormat { magic }),
        };
        Ok(kind)
    }
}

/// Outcome of detection: either a usable image or a fat container that
/// still needs a slice chosen.
pub enum Detection {
    Image(ContainerImage),
    FatMachO(FatMachO),
}

/// Detect and decode a binary blob
pub fn detect(data: &[u8]) -> ParseResult<Detection> {
    let kind = ContainerKind::classify(data)?;
    debug!("Detected container {:?}", kind);
    match kind {
        ContainerKind::FatMachO => Ok(Detection::FatMachO(FatMachO::parse(data)?)),
        thin => Ok(Detection::Image(ContainerImage::open(thin, data)?)),
    }
}

/// A decoded thin container; the variant never changes once opened
pub enum ContainerImage {
    WebAssembly(WasmFile),
    Nso(NsoFile),
    Pe(PeFile),
    Elf32(ElfFile),
    Elf64(ElfFile),
    MachO32(MachOFile),
    MachO64(MachOFile),
}

impl ContainerImage {
    /// Decode `data` as the given thin container kind
    pub fn open(kind: ContainerKind, data: &[u8]) -> ParseResult<Self> {
        Ok(match kind {
            ContainerKind::WebAssembly => Self::WebAssembly(WasmFile::parse(data)?),
            ContainerKind::Nso => Self::Nso(NsoFile::parse(data)?),
            ContainerKind::Pe => Self::Pe(PeFile::parse(data)?),
            ContainerKind::Elf32 => Self::Elf32(ElfFile::parse(data)?),
            ContainerKind::Elf64 => Self::Elf64(ElfFile::parse(data)?),
            ContainerKind::MachO32 => Self::MachO32(MachOFile::parse(data)?),
            ContainerKind::MachO64 => Self::MachO64(MachOFile::parse(data)?),
            ContainerKind::FatMachO => {
                return Err(ParseError::invalid_header(
                    "fat containers must be resolved to a slice first",
                ))
            }
        })
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            Self::WebAssembly(_) => ContainerKind::WebAssembly,
            Self::Nso(_) => ContainerKind::Nso,
            Self::Pe(_) => ContainerKind::Pe,
            Self::Elf32(_) => ContainerKind::Elf32,
            Self::Elf64(_) => ContainerKind::Elf64,
            Self::MachO32(_) => ContainerKind::MachO32,
            Self::MachO64(_) => ContainerKind::MachO64,
        }
    }

    pub fn file(&self) -> &dyn BinaryFile {
        match self {
            Self::WebAssembly(f) => f,
            Self::Nso(f) => f,
            Self::Pe(f) => f,
            Self::Elf32(f) | Self::Elf64(f) => f,
            Self::MachO32(f) | Self::MachO64(f) => f,
        }
    }

    /// Whether a base address re-derives the layout (segment-based formats)
    pub fn supports_reload(&self) -> bool {
        matches!(self, Self::Elf32(_) | Self::Elf64(_))
    }

    /// Re-derive the layout of a dumped image loaded at `image_base`.
    /// A no-op for formats without a file/virtual distinction.
    pub fn reload(&mut self, image_base: Address) -> ParseResult<()> {
        match self {
            Self::Elf32(elf) | Self::Elf64(elf) => elf.reload(image_base),
            _ => {
                debug!("Reload is a no-op for {:?}", self.kind());
                Ok(())
            }
        }
    }
}
