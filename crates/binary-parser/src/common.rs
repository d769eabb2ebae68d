//! Common traits and types for binary parsing

use crate::{ParseError, ParseResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ilrecover_core::{Address, Architecture, BinaryFormat};

/// Trait for decoded executable containers
pub trait BinaryFile: Send + Sync {
    /// Get the binary format
    fn format(&self) -> BinaryFormat;

    /// Get the architecture
    fn architecture(&self) -> Architecture;

    /// Check if 64-bit
    fn is_64bit(&self) -> bool {
        self.architecture().is_64bit()
    }

    /// Width of a native pointer in bytes
    fn pointer_size(&self) -> usize {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    /// Get the image base address
    fn image_base(&self) -> Address;

    /// Get all address ranges. For segment-based formats these are the
    /// loadable segments rather than the linker's sections.
    fn sections(&self) -> &[Section];

    /// Find a section by name
    fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections().iter().find(|s| s.name == name)
    }

    /// Get all symbols (if available)
    fn symbols(&self) -> &[Symbol];

    /// Find a symbol by name, ignoring the leading underscore Mach-O adds
    fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols()
            .iter()
            .find(|s| s.name == name || s.name.strip_prefix('_') == Some(name))
    }

    /// Whether the layout looks like a raw memory dump rather than a file image
    fn looks_like_dump(&self) -> bool {
        false
    }

    /// Convert virtual address to file offset
    fn va_to_offset(&self, va: Address) -> Option<u64> {
        let va = va.as_u64();
        self.sections().iter().find_map(|s| {
            let start = s.virtual_address.as_u64();
            let delta = va.checked_sub(start)?;
            (delta < s.raw_size)
                .then_some(s.raw_offset + delta)
        })
    }

    /// Convert file offset to virtual address
    fn offset_to_va(&self, offset: u64) -> Option<Address> {
        self.sections()
            .iter()
            .find(|s| offset >= s.raw_offset && offset < s.raw_offset + s.raw_size)
            .map(|s| Address::new(s.virtual_address.as_u64() + (offset - s.raw_offset)))
    }

    /// Read bytes at a virtual address
    fn read_va(&self, va: Address, size: usize) -> ParseResult<&[u8]> {
        let offset = self
            .va_to_offset(va)
            .ok_or(ParseError::AddressOutOfBounds(va.as_u64()))? as usize;
        let data = self.data();
        if offset + size > data.len() {
            return Err(ParseError::AddressOutOfBounds(va.as_u64()));
        }
        Ok(&data[offset..offset + size])
    }

    /// Read a null-terminated string at a virtual address
    fn read_string_va(&self, va: Address, max_len: usize) -> ParseResult<String> {
        let offset = self
            .va_to_offset(va)
            .ok_or(ParseError::AddressOutOfBounds(va.as_u64()))? as usize;
        BinaryReader::new_at(self.data(), offset, true).read_cstring(max_len)
    }

    /// Get the raw binary data
    fn data(&self) -> &[u8];

    /// Get executable sections
    fn executable_sections(&self) -> Vec<&Section> {
        self.sections()
            .iter()
            .filter(|s| s.characteristics.contains(SectionFlags::EXECUTE))
            .collect()
    }

    /// Get file-backed data sections
    fn data_sections(&self) -> Vec<&Section> {
        self.sections()
            .iter()
            .filter(|s| {
                !s.characteristics.contains(SectionFlags::EXECUTE)
                    && !s.characteristics.contains(SectionFlags::UNINITIALIZED)
                    && s.raw_size > 0
            })
            .collect()
    }

    /// Get raw data for a section
    fn section_data(&self, section: &Section) -> Option<&[u8]> {
        let start = section.raw_offset as usize;
        let end = start + section.raw_size as usize;
        self.data().get(start..end)
    }
}

/// Binary section information
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Virtual address
    pub virtual_address: Address,
    /// Virtual size
    pub virtual_size: u64,
    /// Raw file offset
    pub raw_offset: u64,
    /// Raw file size
    pub raw_size: u64,
    /// Section characteristics/flags
    pub characteristics: SectionFlags,
}

impl Section {
    pub fn virtual_end(&self) -> u64 {
        self.virtual_address.as_u64() + self.virtual_size
    }
}

bitflags::bitflags! {
    /// Section flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        const INITIALIZED = 0x0008;
        const UNINITIALIZED = 0x0010;
    }
}

/// Symbol information
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Symbol address
    pub address: Address,
    /// Symbol size (if known)
    pub size: Option<u64>,
    /// Symbol type
    pub symbol_type: SymbolType,
}

/// Symbol type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Function,
    Object,
    Section,
    File,
    Unknown,
}

/// Helper to read primitives from byte slices
pub struct BinaryReader<'a> {
    data: &'a [u8],
    offset: usize,
    little_endian: bool,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        Self {
            data,
            offset: 0,
            little_endian,
        }
    }

    pub fn new_at(data: &'a [u8], offset: usize, little_endian: bool) -> Self {
        Self {
            data,
            offset,
            little_endian,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        if self.offset.checked_add(count).map_or(true, |end| end > self.data.len()) {
            return Err(ParseError::truncated(count, self.remaining()));
        }
        let bytes = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        let bytes = self.take(2)?;
        Ok(if self.little_endian {
            LittleEndian::read_u16(bytes)
        } else {
            BigEndian::read_u16(bytes)
        })
    }

    pub fn read_u32(&mut self) -> ParseResult<u32> {
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    pub fn read_u64(&mut self) -> ParseResult<u64> {
        let bytes = self.take(8)?;
        Ok(if self.little_endian {
            LittleEndian::read_u64(bytes)
        } else {
            BigEndian::read_u64(bytes)
        })
    }

    pub fn read_i32(&mut self) -> ParseResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> ParseResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a native pointer of the given width, zero-extended
    pub fn read_pointer(&mut self, pointer_size: usize) -> ParseResult<u64> {
        if pointer_size == 8 {
            self.read_u64()
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        self.take(count)
    }

    pub fn read_uleb128(&mut self) -> ParseResult<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= ((byte & 0x7f) as u64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            if shift > 70 {
                return Err(ParseError::parse("LEB128 value too long"));
            }
        }
    }

    pub fn read_sleb128(&mut self) -> ParseResult<i64> {
        let mut result = 0i64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= ((byte & 0x7f) as i64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if shift > 70 {
                return Err(ParseError::parse("LEB128 value too long"));
            }
        }
    }

    pub fn read_cstring(&mut self, max_len: usize) -> ParseResult<String> {
        let start = self.offset;
        let end = start.saturating_add(max_len).min(self.data.len());

        match self.data.get(start..end).and_then(|s| s.iter().position(|&b| b == 0)) {
            Some(len) => {
                self.offset = start + len + 1;
                Ok(String::from_utf8_lossy(&self.data[start..start + len]).to_string())
            }
            None => Err(ParseError::parse("Unterminated string")),
        }
    }

    pub fn skip(&mut self, count: usize) -> ParseResult<()> {
        self.take(count).map(|_| ())
    }

    pub fn peek_u32(&self) -> ParseResult<u32> {
        let mut peek = BinaryReader::new_at(self.data, self.offset, self.little_endian);
        peek.read_u32()
    }
}

/// Read a null-terminated string out of a string table
pub(crate) fn table_string(data: &[u8], offset: usize) -> String {
    let Some(tail) = data.get(offset..) else {
        return String::new();
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).to_string()
}

const DT_NULL: i64 = 0;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;

const R_X86_64_RELATIVE: u32 = 8;
const R_AARCH64_RELATIVE: u32 = 1027;

/// Apply 64-bit relative RELA relocations described by a dynamic table.
///
/// `map` translates a virtual address into a file offset. Images are
/// relocated against a zero load bias, so each slot receives its addend.
pub(crate) fn apply_relative_relocations(
    data: &mut [u8],
    dynamic_offset: usize,
    dynamic_size: usize,
    map: impl Fn(u64) -> Option<u64>,
) -> ParseResult<usize> {
    let mut rela = None;
    let mut rela_size = 0u64;
    {
        let end = dynamic_offset.saturating_add(dynamic_size).min(data.len());
        let mut reader = BinaryReader::new_at(data, dynamic_offset, true);
        while reader.offset() + 16 <= end {
            let tag = reader.read_i64()?;
            let value = reader.read_u64()?;
            match tag {
                DT_NULL => break,
                DT_RELA => rela = Some(value),
                DT_RELASZ => rela_size = value,
                _ => {}
            }
        }
    }

    let Some(rela_offset) = rela.and_then(&map) else {
        return Ok(0);
    };

    let mut entries = Vec::new();
    {
        let mut reader = BinaryReader::new_at(data, rela_offset as usize, true);
        for _ in 0..rela_size / 24 {
            let r_offset = reader.read_u64()?;
            let r_info = reader.read_u64()?;
            let r_addend = reader.read_i64()?;
            entries.push((r_offset, r_info as u32, r_addend));
        }
    }

    let mut applied = 0;
    for (r_offset, kind, addend) in entries {
        if kind != R_AARCH64_RELATIVE && kind != R_X86_64_RELATIVE {
            continue;
        }
        if let Some(target) = map(r_offset).map(|o| o as usize) {
            if let Some(slot) = data.get_mut(target..target + 8) {
                LittleEndian::write_u64(slot, addend as u64);
                applied += 1;
            }
        }
    }
    Ok(applied)
}
