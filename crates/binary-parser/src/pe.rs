//! PE (Portable Executable) format parser for Windows binaries

use crate::common::{BinaryFile, BinaryReader, Section, SectionFlags, Symbol};
use crate::error::{ParseError, ParseResult};
use ilrecover_core::{Address, Architecture, BinaryFormat};
use tracing::debug;

/// DOS header magic
const DOS_MAGIC: u16 = 0x5A4D; // "MZ"

/// PE signature
const PE_SIGNATURE: u32 = 0x00004550; // "PE\0\0"

/// PE machine types
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// PE optional header magic
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;

/// Section characteristics
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x00000040;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x00000080;

/// Parsed PE file
pub struct PeFile {
    data: Vec<u8>,
    architecture: Architecture,
    image_base: Address,
    entry_point: Address,
    sections: Vec<Section>,
    is_64bit: bool,
    memory_layout: bool,
}

impl PeFile {
    /// Parse a PE file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);

        // Parse DOS header
        let dos_magic = reader.read_u16()?;
        if dos_magic != DOS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DOS_MAGIC as u32,
                actual: dos_magic as u32,
            });
        }

        // Skip to e_lfanew (offset to PE header) at offset 0x3C
        reader.set_offset(0x3C);
        let pe_offset = reader.read_u32()? as usize;

        // Parse PE signature
        reader.set_offset(pe_offset);
        let pe_sig = reader.read_u32()?;
        if pe_sig != PE_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: PE_SIGNATURE,
                actual: pe_sig,
            });
        }

        // Parse COFF header
        let machine = reader.read_u16()?;
        let number_of_sections = reader.read_u16()?;
        reader.skip(12)?; // TimeDateStamp, PointerToSymbolTable, NumberOfSymbols
        let size_of_optional_header = reader.read_u16()?;
        let _characteristics = reader.read_u16()?;

        let architecture = match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
            IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_ARMNT => Architecture::Arm32,
            IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        // Parse optional header
        let optional_header_offset = reader.offset();
        let optional_magic = reader.read_u16()?;
        let is_64bit = match optional_magic {
            PE32_MAGIC => false,
            PE32PLUS_MAGIC => true,
            _ => {
                return Err(ParseError::invalid_header(format!(
                    "Invalid optional header magic: {:#x}",
                    optional_magic
                )))
            }
        };

        reader.skip(14)?; // linker versions, SizeOfCode, SizeOfInitializedData, SizeOfUninitializedData
        let address_of_entry_point = reader.read_u32()?;
        reader.skip(4)?; // BaseOfCode
        if !is_64bit {
            reader.skip(4)?; // BaseOfData (PE32 only)
        }

        let image_base = if is_64bit {
            reader.read_u64()?
        } else {
            reader.read_u32()? as u64
        };

        reader.set_offset(optional_header_offset + size_of_optional_header as usize);

        // (name, rva, virtual size, raw offset, raw size, characteristics)
        let mut headers = Vec::with_capacity(number_of_sections as usize);
        for _ in 0..number_of_sections {
            let name_bytes = reader.read_bytes(8)?;
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();

            let virtual_size = reader.read_u32()? as u64;
            let virtual_address = reader.read_u32()? as u64;
            let size_of_raw_data = reader.read_u32()? as u64;
            let pointer_to_raw_data = reader.read_u32()? as u64;
            reader.skip(12)?; // relocation and line-number bookkeeping
            let characteristics = reader.read_u32()?;

            headers.push((
                name,
                virtual_address,
                virtual_size,
                pointer_to_raw_data,
                size_of_raw_data,
                characteristics,
            ));
        }

        let memory_layout = !headers.is_empty()
            && headers.iter().all(|(_, rva, _, raw, _, _)| rva == raw);
        if memory_layout {
            debug!("PE sections are in memory layout");
        }

        let sections = headers
            .into_iter()
            .map(|(name, rva, virtual_size, raw_offset, raw_size, characteristics)| {
                let mut flags = SectionFlags::empty();
                if characteristics & IMAGE_SCN_MEM_READ != 0 {
                    flags |= SectionFlags::READ;
                }
                if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
                    flags |= SectionFlags::WRITE;
                }
                if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
                    flags |= SectionFlags::EXECUTE;
                }
                if characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
                    flags |= SectionFlags::INITIALIZED;
                }
                if characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
                    flags |= SectionFlags::UNINITIALIZED;
                }

                Section {
                    name,
                    virtual_address: Address::new(image_base + rva),
                    virtual_size,
                    raw_offset,
                    raw_size: if memory_layout { virtual_size } else { raw_size },
                    characteristics: flags,
                }
            })
            .collect();

        Ok(Self {
            data: data.to_vec(),
            architecture,
            image_base: Address::new(image_base),
            entry_point: Address::new(image_base + address_of_entry_point as u64),
            sections,
            is_64bit,
            memory_layout,
        })
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }
}

impl BinaryFile for PeFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::PE
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn image_base(&self) -> Address {
        self.image_base
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn symbols(&self) -> &[Symbol] {
        &[]
    }

    fn looks_like_dump(&self) -> bool {
        self.memory_layout
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}
