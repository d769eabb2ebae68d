//! WebAssembly modules
//!
//! The decoded view is the module's initial linear memory rather than the
//! container itself. Method pointers in a wasm build are function table
//! indices, so the executable range is the function index space.

use crate::common::{BinaryFile, BinaryReader, Section, SectionFlags, Symbol};
use crate::error::{ParseError, ParseResult};
use ilrecover_core::{Address, Architecture, BinaryFormat};
use tracing::debug;

/// "\0asm"
pub const WASM_MAGIC: u32 = 0x6D736100;

const PAGE_SIZE: u64 = 0x10000;

/// wasm32 linear memory tops out at 4 GiB
const MAX_PAGES: u64 = 0x10000;

const SECTION_IMPORT: u8 = 2;
const SECTION_FUNCTION: u8 = 3;
const SECTION_MEMORY: u8 = 5;
const SECTION_DATA: u8 = 11;

const IMPORT_FUNCTION: u8 = 0;
const IMPORT_TABLE: u8 = 1;
const IMPORT_MEMORY: u8 = 2;
const IMPORT_GLOBAL: u8 = 3;

const OP_I32_CONST: u8 = 0x41;
const OP_END: u8 = 0x0b;

/// A passive or active data segment
#[derive(Debug, Clone)]
struct DataSegment {
    offset: Option<u64>,
    bytes: Vec<u8>,
}

/// Linear-memory view of a WebAssembly module
pub struct WasmFile {
    memory: Vec<u8>,
    function_count: u64,
    sections: Vec<Section>,
}

impl WasmFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);
        let magic = reader.read_u32()?;
        if magic != WASM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: WASM_MAGIC,
                actual: magic,
            });
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(ParseError::invalid_header(format!(
                "Unsupported WebAssembly version {}",
                version
            )));
        }

        let mut function_count = 0u64;
        let mut memory_pages = 0u64;
        let mut segments = Vec::new();

        while reader.remaining() > 0 {
            let id = reader.read_u8()?;
            let size = reader.read_uleb128()? as usize;
            let body = reader.read_bytes(size)?;
            let mut section = BinaryReader::new(body, true);

            match id {
                SECTION_IMPORT => function_count += Self::count_imported_functions(&mut section)?,
                SECTION_FUNCTION => function_count += section.read_uleb128()?,
                SECTION_MEMORY => {
                    if section.read_uleb128()? > 0 {
                        let flags = section.read_uleb128()?;
                        memory_pages = section.read_uleb128()?;
                        if flags & 1 != 0 {
                            let _maximum = section.read_uleb128()?;
                        }
                    }
                }
                SECTION_DATA => segments = Self::parse_data_segments(&mut section)?,
                _ => {}
            }
        }

        let active: Vec<_> = segments
            .iter()
            .filter_map(|s| s.offset.map(|offset| (offset, &s.bytes)))
            .collect();
        let data_start = active.iter().map(|(offset, _)| *offset).min().unwrap_or(0);
        let data_end = active
            .iter()
            .map(|(offset, bytes)| offset + bytes.len() as u64)
            .max()
            .unwrap_or(0);
        if memory_pages > MAX_PAGES {
            return Err(ParseError::invalid_header(format!(
                "Memory declares {} pages, more than a 32-bit address space",
                memory_pages
            )));
        }
        let memory_size = data_end.max(memory_pages * PAGE_SIZE);

        // Only the initialized prefix is backed; the rest reads as bss.
        let mut memory = vec![0u8; data_end as usize];
        for (offset, bytes) in &active {
            let start = *offset as usize;
            memory[start..start + bytes.len()].copy_from_slice(bytes);
        }
        debug!(
            "WebAssembly module: {} functions, {} data segments, {:#x} bytes of memory",
            function_count,
            segments.len(),
            memory_size
        );

        let mut sections = vec![
            Section {
                name: "code".to_string(),
                virtual_address: Address::ZERO,
                virtual_size: function_count,
                raw_offset: 0,
                raw_size: 0,
                characteristics: SectionFlags::READ | SectionFlags::EXECUTE,
            },
            Section {
                name: "data".to_string(),
                virtual_address: Address::new(data_start),
                virtual_size: data_end - data_start,
                raw_offset: data_start,
                raw_size: data_end - data_start,
                characteristics: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::INITIALIZED,
            },
        ];
        if memory_size > data_end {
            sections.push(Section {
                name: "bss".to_string(),
                virtual_address: Address::new(data_end),
                virtual_size: memory_size - data_end,
                raw_offset: data_end,
                raw_size: 0,
                characteristics: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::UNINITIALIZED,
            });
        }

        Ok(Self {
            memory,
            function_count,
            sections,
        })
    }

    fn count_imported_functions(section: &mut BinaryReader<'_>) -> ParseResult<u64> {
        let mut functions = 0;
        for _ in 0..section.read_uleb128()? {
            for _ in 0..2 {
                let len = section.read_uleb128()? as usize;
                section.skip(len)?;
            }
            match section.read_u8()? {
                IMPORT_FUNCTION => {
                    let _type_index = section.read_uleb128()?;
                    functions += 1;
                }
                IMPORT_TABLE => {
                    let _element_type = section.read_u8()?;
                    Self::skip_limits(section)?;
                }
                IMPORT_MEMORY => Self::skip_limits(section)?,
                IMPORT_GLOBAL => section.skip(2)?,
                kind => {
                    return Err(ParseError::parse(format!("Unknown import kind {}", kind)));
                }
            }
        }
        Ok(functions)
    }

    fn skip_limits(section: &mut BinaryReader<'_>) -> ParseResult<()> {
        let flags = section.read_uleb128()?;
        let _minimum = section.read_uleb128()?;
        if flags & 1 != 0 {
            let _maximum = section.read_uleb128()?;
        }
        Ok(())
    }

    fn parse_data_segments(section: &mut BinaryReader<'_>) -> ParseResult<Vec<DataSegment>> {
        let count = section.read_uleb128()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = match section.read_uleb128()? {
                0 => Some(Self::read_offset_expr(section)?),
                1 => None,
                2 => {
                    let _memory_index = section.read_uleb128()?;
                    Some(Self::read_offset_expr(section)?)
                }
                flags => {
                    return Err(ParseError::parse(format!("Unknown data segment flags {}", flags)));
                }
            };
            let len = section.read_uleb128()? as usize;
            let bytes = section.read_bytes(len)?.to_vec();
            segments.push(DataSegment { offset, bytes });
        }
        Ok(segments)
    }

    fn read_offset_expr(section: &mut BinaryReader<'_>) -> ParseResult<u64> {
        let opcode = section.read_u8()?;
        if opcode != OP_I32_CONST {
            return Err(ParseError::parse(format!(
                "Unsupported data offset expression opcode {:#x}",
                opcode
            )));
        }
        let value = section.read_sleb128()? as u32 as u64;
        if section.read_u8()? != OP_END {
            return Err(ParseError::parse("Unterminated data offset expression"));
        }
        Ok(value)
    }

    /// Number of entries in the function index space (imports included)
    pub fn function_count(&self) -> u64 {
        self.function_count
    }
}

impl BinaryFile for WasmFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::WebAssembly
    }

    fn architecture(&self) -> Architecture {
        Architecture::Wasm32
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
        &self.memory
    }
}
