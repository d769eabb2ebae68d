//! Universal ("fat") Mach-O containers

use crate::error::{ParseError, ParseResult};
use crate::image::{ContainerImage, ContainerKind};
use crate::macho::{MH_MAGIC, MH_MAGIC_64};
use scroll::Pread;
use tracing::debug;

/// `0xCAFEBABE` stored big-endian, as written by the Apple toolchain
pub const FAT_MAGIC: u32 = 0xBEBAFECA;
/// `0xCAFEBABE` stored little-endian
pub const FAT_CIGAM: u32 = 0xCAFEBABE;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
struct FatHeader {
    _magic: u32,
    nfat_arch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// One selectable architecture slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub index: usize,
    pub is_64bit: bool,
}

/// A parsed universal container awaiting slice selection
#[derive(Debug, Clone)]
pub struct FatMachO {
    data: Vec<u8>,
    arches: Vec<FatArch>,
}

impl FatMachO {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let magic: u32 = data.pread_with(0, scroll::LE)?;
        let endian = match magic {
            FAT_MAGIC => scroll::BE,
            FAT_CIGAM => scroll::LE,
            _ => {
                return Err(ParseError::InvalidMagic {
                    expected: FAT_MAGIC,
                    actual: magic,
                })
            }
        };

        let header: FatHeader = data.pread_with(0, endian)?;
        let mut arches = Vec::with_capacity(header.nfat_arch as usize);
        let offset = &mut 8usize;
        for _ in 0..header.nfat_arch {
            let arch: FatArch = data.gread_with(offset, endian)?;
            arches.push(arch);
        }

        if arches.is_empty() {
            return Err(ParseError::invalid_header("Fat container has no slices"));
        }

        debug!("Fat Mach-O with {} slices", arches.len());
        Ok(Self {
            data: data.to_vec(),
            arches,
        })
    }

    pub fn len(&self) -> usize {
        self.arches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arches.is_empty()
    }

    pub fn arches(&self) -> &[FatArch] {
        &self.arches
    }

    /// Enumerate the slices together with their bit width
    pub fn slices(&self) -> Vec<SliceInfo> {
        self.arches
            .iter()
            .enumerate()
            .map(|(index, arch)| {
                let is_64bit = match self.slice_magic(arch) {
                    Some(MH_MAGIC_64) => true,
                    Some(MH_MAGIC) => false,
                    _ => arch.cputype & CPU_ARCH_ABI64 != 0,
                };
                SliceInfo { index, is_64bit }
            })
            .collect()
    }

    /// Raw bytes of the slice at `index % len`
    pub fn slice_bytes(&self, index: usize) -> ParseResult<&[u8]> {
        let arch = &self.arches[index % self.arches.len()];
        let start = arch.offset as usize;
        let end = start + arch.size as usize;
        self.data
            .get(start..end)
            .ok_or_else(|| ParseError::truncated(end, self.data.len()))
    }

    /// Extract the slice at `index % len` and dispatch it by its own magic.
    ///
    /// The slice must itself be a thin Mach-O image.
    pub fn select(&self, index: usize) -> ParseResult<ContainerImage> {
        let effective = index % self.arches.len();
        let bytes = self.slice_bytes(effective)?;
        let kind = ContainerKind::classify(bytes)?;
        match kind {
            ContainerKind::MachO32 | ContainerKind::MachO64 => {
                debug!("Selected fat slice {} as {:?}", effective, kind);
                ContainerImage::open(kind, bytes)
            }
            other => Err(ParseError::invalid_header(format!(
                "Fat slice {} is {:?}, expected a thin Mach-O image",
                effective, other
            ))),
        }
    }

    fn slice_magic(&self, arch: &FatArch) -> Option<u32> {
        self.data.pread_with::<u32>(arch.offset as usize, scroll::LE).ok()
    }
}
