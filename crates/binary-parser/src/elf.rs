//! ELF (Executable and Linkable Format) parser for Linux/Android binaries
//!
//! Address translation goes through the loadable program segments. Section
//! headers are only used for names and symbol tables, which lets the same
//! decoder serve both shared objects read from disk and images dumped from
//! process memory (where section headers are usually garbage).

use crate::common::{
    apply_relative_relocations, table_string, BinaryFile, BinaryReader, Section, SectionFlags,
    Symbol, SymbolType,
};
use crate::error::{ParseError, ParseResult};
use ilrecover_core::{Address, Architecture, BinaryFormat};
use tracing::{debug, warn};

/// ELF magic
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF classes
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// ELF endianness
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

/// ELF machine types
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Program header types
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

/// Program header flags
const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// Section types
const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;

/// Symbol types
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;
const STT_FILE: u8 = 4;

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
}

/// Parsed ELF file
pub struct ElfFile {
    data: Vec<u8>,
    architecture: Architecture,
    is_64bit: bool,
    entry_point: Address,
    program_headers: Vec<ProgramHeader>,
    segments: Vec<Section>,
    section_names: Vec<String>,
    symbols: Vec<Symbol>,
    image_base: Address,
    dumped: bool,
}

impl ElfFile {
    /// Parse an ELF file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 16 {
            return Err(ParseError::truncated(16, data.len()));
        }

        if data[0..4] != ELF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from_le_bytes(ELF_MAGIC),
                actual: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            });
        }

        let is_64bit = match data[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            class => return Err(ParseError::invalid_header(format!("Invalid ELF class: {}", class))),
        };

        let little_endian = match data[5] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            encoding => {
                return Err(ParseError::invalid_header(format!(
                    "Invalid ELF data encoding: {}",
                    encoding
                )))
            }
        };

        let mut reader = BinaryReader::new_at(data, 16, little_endian);
        let _e_type = reader.read_u16()?;
        let e_machine = reader.read_u16()?;
        let _e_version = reader.read_u32()?;

        let architecture = match e_machine {
            EM_386 => Architecture::X86,
            EM_X86_64 => Architecture::X64,
            EM_ARM => Architecture::Arm32,
            EM_AARCH64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let (entry_point, ph_offset, sh_offset) = if is_64bit {
            (reader.read_u64()?, reader.read_u64()?, reader.read_u64()?)
        } else {
            (
                reader.read_u32()? as u64,
                reader.read_u32()? as u64,
                reader.read_u32()? as u64,
            )
        };
        let _e_flags = reader.read_u32()?;
        let _e_ehsize = reader.read_u16()?;
        let ph_entsize = reader.read_u16()? as usize;
        let ph_num = reader.read_u16()? as usize;
        let sh_entsize = reader.read_u16()? as usize;
        let sh_num = reader.read_u16()? as usize;
        let sh_strndx = reader.read_u16()? as usize;

        let mut program_headers = Vec::with_capacity(ph_num);
        for i in 0..ph_num {
            reader.set_offset(ph_offset as usize + i * ph_entsize);
            let header = if is_64bit {
                let p_type = reader.read_u32()?;
                let p_flags = reader.read_u32()?;
                let p_offset = reader.read_u64()?;
                let p_vaddr = reader.read_u64()?;
                let _p_paddr = reader.read_u64()?;
                let p_filesz = reader.read_u64()?;
                let p_memsz = reader.read_u64()?;
                ProgramHeader { p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz }
            } else {
                let p_type = reader.read_u32()?;
                let p_offset = reader.read_u32()? as u64;
                let p_vaddr = reader.read_u32()? as u64;
                let _p_paddr = reader.read_u32()?;
                let p_filesz = reader.read_u32()? as u64;
                let p_memsz = reader.read_u32()? as u64;
                let p_flags = reader.read_u32()?;
                ProgramHeader { p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz }
            };
            program_headers.push(header);
        }

        // Dumped images keep stale section headers, so failures here only
        // mean there are no names or symbols to offer.
        let section_headers =
            Self::parse_section_headers(data, sh_offset, sh_entsize, sh_num, is_64bit, little_endian)
                .unwrap_or_else(|e| {
                    debug!("Ignoring unreadable ELF section headers: {}", e);
                    Vec::new()
                });

        let section_names = match section_headers.get(sh_strndx) {
            Some(strtab) => section_headers
                .iter()
                .map(|s| table_string(data, (strtab.sh_offset + s.sh_name as u64) as usize))
                .collect(),
            None => Vec::new(),
        };

        let symbols = Self::parse_symbols(data, &section_headers, is_64bit, little_endian)
            .unwrap_or_else(|e| {
                warn!("Failed to read ELF symbol tables: {}", e);
                Vec::new()
            });

        let mut elf = Self {
            data: data.to_vec(),
            architecture,
            is_64bit,
            entry_point: Address::new(entry_point),
            program_headers,
            segments: Vec::new(),
            section_names,
            symbols,
            image_base: Address::ZERO,
            dumped: false,
        };
        elf.segments = elf.build_segments(elf.dumped, elf.image_base)?;

        if is_64bit && little_endian && !elf.looks_like_dump() {
            elf.relocate()?;
        }

        Ok(elf)
    }

    fn parse_section_headers(
        data: &[u8],
        sh_offset: u64,
        sh_entsize: usize,
        sh_num: usize,
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<SectionHeader>> {
        let mut headers = Vec::with_capacity(sh_num);
        if sh_offset == 0 {
            return Ok(headers);
        }

        let mut reader = BinaryReader::new(data, little_endian);
        for i in 0..sh_num {
            reader.set_offset(sh_offset as usize + i * sh_entsize);
            let header = if is_64bit {
                let sh_name = reader.read_u32()?;
                let sh_type = reader.read_u32()?;
                let _sh_flags = reader.read_u64()?;
                let _sh_addr = reader.read_u64()?;
                let sh_offset = reader.read_u64()?;
                let sh_size = reader.read_u64()?;
                let sh_link = reader.read_u32()?;
                SectionHeader { sh_name, sh_type, sh_offset, sh_size, sh_link }
            } else {
                let sh_name = reader.read_u32()?;
                let sh_type = reader.read_u32()?;
                let _sh_flags = reader.read_u32()?;
                let _sh_addr = reader.read_u32()?;
                let sh_offset = reader.read_u32()? as u64;
                let sh_size = reader.read_u32()? as u64;
                let sh_link = reader.read_u32()?;
                SectionHeader { sh_name, sh_type, sh_offset, sh_size, sh_link }
            };
            headers.push(header);
        }
        Ok(headers)
    }

    fn parse_symbols(
        data: &[u8],
        sections: &[SectionHeader],
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let mut symbols = Vec::new();
        let sym_size = if is_64bit { 24 } else { 16 };

        for table in sections
            .iter()
            .filter(|s| s.sh_type == SHT_SYMTAB || s.sh_type == SHT_DYNSYM)
        {
            let Some(strtab) = sections.get(table.sh_link as usize) else {
                continue;
            };

            let mut reader = BinaryReader::new(data, little_endian);
            for j in 0..table.sh_size as usize / sym_size {
                reader.set_offset(table.sh_offset as usize + j * sym_size);

                let (st_name, st_value, st_size, st_info) = if is_64bit {
                    let st_name = reader.read_u32()?;
                    let st_info = reader.read_u8()?;
                    let _st_other = reader.read_u8()?;
                    let _st_shndx = reader.read_u16()?;
                    let st_value = reader.read_u64()?;
                    let st_size = reader.read_u64()?;
                    (st_name, st_value, st_size, st_info)
                } else {
                    let st_name = reader.read_u32()?;
                    let st_value = reader.read_u32()? as u64;
                    let st_size = reader.read_u32()? as u64;
                    let st_info = reader.read_u8()?;
                    (st_name, st_value, st_size, st_info)
                };

                if st_name as u64 >= strtab.sh_size {
                    continue;
                }
                let name = table_string(data, (strtab.sh_offset + st_name as u64) as usize);
                if name.is_empty() {
                    continue;
                }

                let symbol_type = match st_info & 0xf {
                    STT_FUNC => SymbolType::Function,
                    STT_OBJECT => SymbolType::Object,
                    STT_SECTION => SymbolType::Section,
                    STT_FILE => SymbolType::File,
                    _ => SymbolType::Unknown,
                };

                symbols.push(Symbol {
                    name,
                    address: Address::new(st_value),
                    size: (st_size > 0).then_some(st_size),
                    symbol_type,
                });
            }
        }

        Ok(symbols)
    }

    /// Derive the loadable segment table, fixing it up for a memory dump
    /// loaded at `image_base` when `dumped`.
    fn build_segments(&self, dumped: bool, image_base: Address) -> ParseResult<Vec<Section>> {
        self.program_headers
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .enumerate()
            .map(|(i, p)| {
                let (raw_offset, vaddr, raw_size) = if dumped {
                    let vaddr = p.p_vaddr.checked_add(image_base.as_u64()).ok_or_else(|| {
                        ParseError::invalid_header(format!(
                            "Segment at {:#x} does not fit above base {}",
                            p.p_vaddr, image_base
                        ))
                    })?;
                    (p.p_vaddr, vaddr, p.p_memsz)
                } else {
                    (p.p_offset, p.p_vaddr, p.p_filesz)
                };

                let mut flags = SectionFlags::empty();
                if p.p_flags & PF_R != 0 {
                    flags |= SectionFlags::READ;
                }
                if p.p_flags & PF_W != 0 {
                    flags |= SectionFlags::WRITE;
                }
                if p.p_flags & PF_X != 0 {
                    flags |= SectionFlags::EXECUTE;
                }
                if raw_size > 0 {
                    flags |= SectionFlags::INITIALIZED;
                }

                Ok(Section {
                    name: format!("LOAD{}", i),
                    virtual_address: Address::new(vaddr),
                    virtual_size: p.p_memsz,
                    raw_offset,
                    raw_size,
                    characteristics: flags,
                })
            })
            .collect()
    }

    fn relocate(&mut self) -> ParseResult<()> {
        let Some(dynamic) = self.program_headers.iter().find(|p| p.p_type == PT_DYNAMIC).copied()
        else {
            return Ok(());
        };

        let segments = self.segments.clone();
        let map = |va: u64| {
            segments
                .iter()
                .find(|s| va >= s.virtual_address.as_u64() && va < s.virtual_end())
                .and_then(|s| {
                    let delta = va - s.virtual_address.as_u64();
                    (delta < s.raw_size).then_some(s.raw_offset + delta)
                })
        };

        let applied = apply_relative_relocations(
            &mut self.data,
            dynamic.p_offset as usize,
            dynamic.p_filesz as usize,
            map,
        )?;
        debug!("Applied {} relative relocations", applied);
        Ok(())
    }

    /// Re-derive the segment layout of a memory dump loaded at `image_base`.
    ///
    /// Segment file offsets become their original virtual addresses and
    /// every segment is treated as fully present in the file. A base that
    /// pushes a segment past the address space leaves the layout untouched.
    pub fn reload(&mut self, image_base: Address) -> ParseResult<()> {
        self.segments = self.build_segments(true, image_base)?;
        self.image_base = image_base;
        self.dumped = true;
        Ok(())
    }

    pub fn section_names(&self) -> &[String] {
        &self.section_names
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn is_dumped(&self) -> bool {
        self.dumped
    }
}

impl BinaryFile for ElfFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::ELF
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
        &self.segments
    }

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn looks_like_dump(&self) -> bool {
        !self.section_names.iter().any(|name| name == ".text")
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal ELF with one exec and one data segment, optionally with a
    /// `.text` section header and a symbol table.
    pub(crate) fn tiny_elf(is_64bit: bool, with_sections: bool) -> Vec<u8> {
        let mut out = vec![0u8; 0x2000];
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = if is_64bit { ELFCLASS64 } else { ELFCLASS32 };
        out[5] = ELFDATA2LSB;
        out[6] = 1;

        let put16 = |out: &mut Vec<u8>, at: usize, v: u16| out[at..at + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |out: &mut Vec<u8>, at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        let put64 = |out: &mut Vec<u8>, at: usize, v: u64| out[at..at + 8].copy_from_slice(&v.to_le_bytes());

        let (machine, phoff, phentsize, shentsize) =
            if is_64bit { (EM_AARCH64, 0x40, 56, 64) } else { (EM_ARM, 0x34, 32, 40) };
        put16(&mut out, 18, machine);
        let segs = [(0u64, 0x1000u64, PF_R | PF_X), (0x1000, 0x1000, PF_R | PF_W)];
        let shoff = 0x1800u64;
        let (shnum, shstrndx) = if with_sections { (5u16, 2u16) } else { (0, 0) };
        if is_64bit {
            put64(&mut out, 32, phoff);
            put64(&mut out, 40, if with_sections { shoff } else { 0 });
            put16(&mut out, 54, phentsize);
            put16(&mut out, 56, 2);
            put16(&mut out, 58, shentsize);
            put16(&mut out, 60, shnum);
            put16(&mut out, 62, shstrndx);
        } else {
            put32(&mut out, 28, phoff as u32);
            put32(&mut out, 32, if with_sections { shoff as u32 } else { 0 });
            put16(&mut out, 42, phentsize);
            put16(&mut out, 44, 2);
            put16(&mut out, 46, shentsize);
            put16(&mut out, 48, shnum);
            put16(&mut out, 50, shstrndx);
        }

        for (i, (vaddr, size, flags)) in segs.iter().enumerate() {
            let at = phoff as usize + i * phentsize as usize;
            if is_64bit {
                put32(&mut out, at, PT_LOAD);
                put32(&mut out, at + 4, *flags);
                put64(&mut out, at + 8, *vaddr);
                put64(&mut out, at + 16, *vaddr);
                put64(&mut out, at + 32, *size);
                put64(&mut out, at + 40, *size);
            } else {
                put32(&mut out, at, PT_LOAD);
                put32(&mut out, at + 4, *vaddr as u32);
                put32(&mut out, at + 8, *vaddr as u32);
                put32(&mut out, at + 16, *size as u32);
                put32(&mut out, at + 20, *size as u32);
                put32(&mut out, at + 24, *flags);
            }
        }

        if with_sections {
            // shstrtab at 0x1700, symbol strings at 0x1740, symbols at 0x1780
            let names = b"\0.text\0.shstrtab\0.symtab\0.strtab\0";
            out[0x1700..0x1700 + names.len()].copy_from_slice(names);
            let strs = b"\0g_CodeRegistration\0g_MetadataRegistration\0";
            out[0x1740..0x1740 + strs.len()].copy_from_slice(strs);

            let sym_size = if is_64bit { 24 } else { 16 };
            for (k, (name, value)) in [(1u32, 0x1100u64), (20, 0x1200)].iter().enumerate() {
                let at = 0x1780 + (k + 1) * sym_size;
                put32(&mut out, at, *name);
                if is_64bit {
                    out[at + 4] = STT_OBJECT;
                    put64(&mut out, at + 8, *value);
                } else {
                    put32(&mut out, at + 4, *value as u32);
                    out[at + 12] = STT_OBJECT;
                }
            }

            // (name, type, offset, size, link)
            let headers = [
                (1u32, 1u32, 0u64, 0x1000u64, 0u32),
                (7, 3, 0x1700, names.len() as u64, 0),
                (17, SHT_SYMTAB, 0x1780, 3 * sym_size as u64, 4),
                (25, 3, 0x1740, strs.len() as u64, 0),
            ];
            for (k, (name, kind, offset, size, link)) in headers.iter().enumerate() {
                let at = shoff as usize + (k + 1) * shentsize as usize;
                put32(&mut out, at, *name);
                put32(&mut out, at + 4, *kind);
                if is_64bit {
                    put64(&mut out, at + 24, *offset);
                    put64(&mut out, at + 32, *size);
                    put32(&mut out, at + 40, *link);
                } else {
                    put32(&mut out, at + 16, *offset as u32);
                    put32(&mut out, at + 20, *size as u32);
                    put32(&mut out, at + 24, *link);
                }
            }
        }
        out
    }

    #[test]
    fn segments_translate_addresses() {
        let elf = ElfFile::parse(&tiny_elf(false, true)).unwrap();
        assert!(!elf.is_64bit());
        assert_eq!(elf.architecture(), Architecture::Arm32);
        assert_eq!(elf.sections().len(), 2);
        assert_eq!(elf.va_to_offset(Address::new(0x1010)), Some(0x1010));
        assert_eq!(elf.executable_sections().len(), 1);
        assert_eq!(elf.data_sections().len(), 1);
    }

    #[test]
    fn text_section_means_file_backed() {
        let elf = ElfFile::parse(&tiny_elf(true, true)).unwrap();
        assert!(!elf.looks_like_dump());
        assert_eq!(
            elf.find_symbol("g_MetadataRegistration").map(|s| s.address),
            Some(Address::new(0x1200))
        );
    }

    #[test]
    fn missing_sections_look_like_dump() {
        let elf = ElfFile::parse(&tiny_elf(true, false)).unwrap();
        assert!(elf.looks_like_dump());
        assert!(elf.symbols().is_empty());
    }

    #[test]
    fn reload_rebases_segments() {
        let mut elf = ElfFile::parse(&tiny_elf(true, false)).unwrap();
        elf.reload(Address::new(0x7100_0000)).unwrap();
        assert!(elf.is_dumped());
        assert_eq!(elf.image_base(), Address::new(0x7100_0000));
        assert_eq!(elf.va_to_offset(Address::new(0x7100_1008)), Some(0x1008));
        assert_eq!(elf.va_to_offset(Address::new(0x1008)), None);
    }

    #[test]
    fn reload_rejects_a_base_past_the_address_space() {
        let mut elf = ElfFile::parse(&tiny_elf(true, false)).unwrap();
        assert!(elf.reload(Address::new(0xFFFF_FFFF_FFFF_F000)).is_err());
        assert!(!elf.is_dumped());
        assert!(elf.image_base().is_null());
        assert_eq!(elf.va_to_offset(Address::new(0x1008)), Some(0x1008));
    }
}
