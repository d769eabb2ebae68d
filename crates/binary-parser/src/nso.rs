//! NSO executables (Nintendo Switch)
//!
//! Segments are decompressed into one flat image where a file offset is
//! the same number as the virtual address.

use crate::common::{apply_relative_relocations, BinaryFile, Section, SectionFlags, Symbol};
use crate::error::{ParseError, ParseResult};
use ilrecover_core::{Address, Architecture, BinaryFormat};
use scroll::{Pread, LE};
use tracing::debug;

/// "NSO0"
pub const NSO_MAGIC: u32 = 0x304F534E;
/// "MOD0"
const MOD0_MAGIC: u32 = 0x30444F4D;

const HEADER_SIZE: usize = 0x100;

const FLAG_TEXT_COMPRESSED: u32 = 1 << 0;
const FLAG_RO_COMPRESSED: u32 = 1 << 1;
const FLAG_DATA_COMPRESSED: u32 = 1 << 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
struct SegmentHeader {
    file_offset: u32,
    memory_offset: u32,
    size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
struct NsoHeader {
    magic: u32,
    version: u32,
    _reserved: u32,
    flags: u32,
    text: SegmentHeader,
    module_name_offset: u32,
    ro: SegmentHeader,
    _module_name_size: u32,
    data: SegmentHeader,
    bss_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
struct CompressedSizes {
    text: u32,
    ro: u32,
    data: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
struct Mod0Header {
    magic: u32,
    dynamic_offset: i32,
    _bss_start_offset: i32,
    _bss_end_offset: i32,
}

/// Parsed and decompressed NSO module
pub struct NsoFile {
    image: Vec<u8>,
    sections: Vec<Section>,
}

impl NsoFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::truncated(HEADER_SIZE, data.len()));
        }

        let header: NsoHeader = data.pread_with(0, LE)?;
        if header.magic != NSO_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: NSO_MAGIC,
                actual: header.magic,
            });
        }
        debug!(
            "NSO version {} (module name at {:#x})",
            header.version, header.module_name_offset
        );
        let compressed: CompressedSizes = data.pread_with(0x60, LE)?;

        let image_size = (header.data.memory_offset + header.data.size) as usize;
        let mut image = vec![0u8; image_size];

        for (name, segment, file_size, flag) in [
            ("text", header.text, compressed.text, FLAG_TEXT_COMPRESSED),
            ("ro", header.ro, compressed.ro, FLAG_RO_COMPRESSED),
            ("data", header.data, compressed.data, FLAG_DATA_COMPRESSED),
        ] {
            let bytes = Self::segment_bytes(data, &segment, file_size, header.flags & flag != 0)
                .map_err(|e| ParseError::Decompress(format!("{} segment: {}", name, e)))?;
            let start = segment.memory_offset as usize;
            let target = image
                .get_mut(start..start + bytes.len())
                .ok_or_else(|| ParseError::invalid_header(format!("{} segment overlaps image end", name)))?;
            target.copy_from_slice(&bytes);
        }

        let segment = |name: &str, header: &SegmentHeader, flags: SectionFlags| Section {
            name: name.to_string(),
            virtual_address: Address::new(header.memory_offset as u64),
            virtual_size: header.size as u64,
            raw_offset: header.memory_offset as u64,
            raw_size: header.size as u64,
            characteristics: flags | SectionFlags::INITIALIZED,
        };

        let mut sections = vec![
            segment(".text", &header.text, SectionFlags::READ | SectionFlags::EXECUTE),
            segment(".rodata", &header.ro, SectionFlags::READ),
            segment(".data", &header.data, SectionFlags::READ | SectionFlags::WRITE),
        ];
        if header.bss_size > 0 {
            sections.push(Section {
                name: ".bss".to_string(),
                virtual_address: Address::new(image_size as u64),
                virtual_size: header.bss_size as u64,
                raw_offset: 0,
                raw_size: 0,
                characteristics: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::UNINITIALIZED,
            });
        }

        let mut nso = Self { image, sections };
        nso.relocate()?;
        Ok(nso)
    }

    fn segment_bytes(
        data: &[u8],
        segment: &SegmentHeader,
        file_size: u32,
        compressed: bool,
    ) -> ParseResult<Vec<u8>> {
        let start = segment.file_offset as usize;
        let stored = if compressed { file_size } else { segment.size } as usize;
        let raw = data
            .get(start..start + stored)
            .ok_or_else(|| ParseError::truncated(start + stored, data.len()))?;

        if !compressed {
            return Ok(raw.to_vec());
        }
        lz4_flex::block::decompress(raw, segment.size as usize)
            .map_err(|e| ParseError::Decompress(e.to_string()))
    }

    fn relocate(&mut self) -> ParseResult<()> {
        let mod0_offset: u32 = self.image.pread_with(4, LE)?;
        let mod0: Mod0Header = match self.image.pread_with(mod0_offset as usize, LE) {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        if mod0.magic != MOD0_MAGIC {
            debug!("NSO has no MOD0 header; skipping relocations");
            return Ok(());
        }

        let dynamic = (mod0_offset as i64 + mod0.dynamic_offset as i64) as usize;
        let len = self.image.len() as u64;
        let applied = apply_relative_relocations(
            &mut self.image,
            dynamic,
            usize::MAX,
            |va| (va < len).then_some(va),
        )?;
        debug!("Applied {} NSO relocations", applied);
        Ok(())
    }
}

impl BinaryFile for NsoFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::NSO
    }

    fn architecture(&self) -> Architecture {
        Architecture::Arm64
    }

    fn image_base(&self) -> Address {
        Address::ZERO
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn symbols(&self) -> &[Symbol] {
        &[]
    }

    fn data(&self) -> &[u8] {
        &self.image
    }
}
