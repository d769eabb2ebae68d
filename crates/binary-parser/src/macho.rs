//! Mach-O format parser for macOS/iOS binaries
//!
//! Only thin images are handled here; universal containers are split by
//! [`crate::fat`] before a slice reaches this parser.

use crate::common::{table_string, BinaryFile, BinaryReader, Section, SectionFlags, Symbol, SymbolType};
use crate::error::{ParseError, ParseResult};
use ilrecover_core::{Address, Architecture, BinaryFormat};

/// Mach-O magic numbers
pub const MH_MAGIC: u32 = 0xFEEDFACE; // 32-bit
pub const MH_MAGIC_64: u32 = 0xFEEDFACF; // 64-bit
const MH_CIGAM: u32 = 0xCEFAEDFE; // 32-bit big endian
const MH_CIGAM_64: u32 = 0xCFFAEDFE; // 64-bit big endian

/// CPU types
const CPU_TYPE_I386: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x01000007;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100000C;

/// Load commands
const LC_SEGMENT: u32 = 0x01;
const LC_SYMTAB: u32 = 0x02;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x80000028;

/// Segment protection
const VM_PROT_READ: u32 = 0x01;
const VM_PROT_WRITE: u32 = 0x02;
const VM_PROT_EXECUTE: u32 = 0x04;

/// Section types
const SECTION_TYPE: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;
const S_GB_ZEROFILL: u32 = 0xc;
const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

/// Parsed Mach-O file
pub struct MachOFile {
    data: Vec<u8>,
    architecture: Architecture,
    is_64bit: bool,
    entry_point: Address,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    text_base: Address,
}

impl MachOFile {
    /// Parse a thin Mach-O image from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 4 {
            return Err(ParseError::truncated(4, data.len()));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let (is_64bit, little_endian) = match magic {
            MH_MAGIC => (false, true),
            MH_MAGIC_64 => (true, true),
            MH_CIGAM => (false, false),
            MH_CIGAM_64 => (true, false),
            _ => {
                return Err(ParseError::InvalidMagic {
                    expected: MH_MAGIC_64,
                    actual: magic,
                })
            }
        };

        let mut reader = BinaryReader::new_at(data, 4, little_endian);
        let cputype = reader.read_u32()?;
        let _cpusubtype = reader.read_u32()?;
        let _filetype = reader.read_u32()?;
        let ncmds = reader.read_u32()?;
        let _sizeofcmds = reader.read_u32()?;
        let _flags = reader.read_u32()?;
        if is_64bit {
            let _reserved = reader.read_u32()?;
        }

        let architecture = match cputype {
            CPU_TYPE_I386 => Architecture::X86,
            CPU_TYPE_X86_64 => Architecture::X64,
            CPU_TYPE_ARM => Architecture::Arm32,
            CPU_TYPE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let mut sections = Vec::new();
        let mut entry_point = Address::ZERO;
        let mut text_base = Address::ZERO;
        let mut symtab = None;

        for _ in 0..ncmds {
            let cmd_start = reader.offset();
            let cmd = reader.read_u32()?;
            let cmdsize = reader.read_u32()?;

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let wide = cmd == LC_SEGMENT_64;
                    let segname = table_string(reader.read_bytes(16)?, 0);
                    let vmaddr = reader.read_pointer(if wide { 8 } else { 4 })?;
                    reader.skip(if wide { 24 } else { 12 })?; // vmsize, fileoff, filesize
                    let _maxprot = reader.read_u32()?;
                    let initprot = reader.read_u32()?;
                    let nsects = reader.read_u32()?;
                    let _flags = reader.read_u32()?;

                    if segname == "__TEXT" {
                        text_base = Address::new(vmaddr);
                    }

                    for _ in 0..nsects {
                        let sectname = table_string(reader.read_bytes(16)?, 0);
                        let _segname = reader.read_bytes(16)?;
                        let (addr, size) = if wide {
                            (reader.read_u64()?, reader.read_u64()?)
                        } else {
                            (reader.read_u32()? as u64, reader.read_u32()? as u64)
                        };
                        let offset = reader.read_u32()? as u64;
                        reader.skip(12)?; // align, reloff, nreloc
                        let section_flags = reader.read_u32()?;
                        reader.skip(if wide { 12 } else { 8 })?;

                        let zerofill = matches!(
                            section_flags & SECTION_TYPE,
                            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
                        );

                        let mut flags = SectionFlags::empty();
                        if initprot & VM_PROT_READ != 0 {
                            flags |= SectionFlags::READ;
                        }
                        if initprot & VM_PROT_WRITE != 0 {
                            flags |= SectionFlags::WRITE;
                        }
                        if initprot & VM_PROT_EXECUTE != 0 {
                            flags |= SectionFlags::EXECUTE;
                        }
                        flags |= if zerofill {
                            SectionFlags::UNINITIALIZED
                        } else {
                            SectionFlags::INITIALIZED
                        };

                        sections.push(Section {
                            name: format!("{},{}", segname, sectname),
                            virtual_address: Address::new(addr),
                            virtual_size: size,
                            raw_offset: offset,
                            raw_size: if zerofill { 0 } else { size },
                            characteristics: flags,
                        });
                    }
                }
                LC_MAIN => {
                    entry_point = Address::new(reader.read_u64()?);
                }
                LC_SYMTAB => {
                    let symoff = reader.read_u32()? as usize;
                    let nsyms = reader.read_u32()? as usize;
                    let stroff = reader.read_u32()? as usize;
                    let strsize = reader.read_u32()? as usize;
                    symtab = Some((symoff, nsyms, stroff, strsize));
                }
                _ => {}
            }

            reader.set_offset(cmd_start + cmdsize as usize);
        }

        // Adjust entry point to absolute address
        if entry_point.as_u64() > 0 {
            entry_point = Address::new(text_base.as_u64() + entry_point.as_u64());
        }

        let symbols = match symtab {
            Some((symoff, nsyms, stroff, strsize)) if nsyms > 0 && strsize > 0 => {
                Self::parse_symbols(data, symoff, nsyms, stroff, strsize, is_64bit, little_endian)?
            }
            _ => Vec::new(),
        };

        Ok(Self {
            data: data.to_vec(),
            architecture,
            is_64bit,
            entry_point,
            sections,
            symbols,
            text_base,
        })
    }

    fn parse_symbols(
        data: &[u8],
        symtab_offset: usize,
        symtab_count: usize,
        strtab_offset: usize,
        strtab_size: usize,
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let mut symbols = Vec::new();
        let sym_size = if is_64bit { 16 } else { 12 };
        let mut reader = BinaryReader::new(data, little_endian);

        for i in 0..symtab_count {
            let offset = symtab_offset + i * sym_size;
            if offset + sym_size > data.len() {
                break;
            }
            reader.set_offset(offset);

            let n_strx = reader.read_u32()?;
            let n_type = reader.read_u8()?;
            let _n_sect = reader.read_u8()?;
            let _n_desc = reader.read_u16()?;
            let n_value = reader.read_pointer(if is_64bit { 8 } else { 4 })?;

            if (n_strx as usize) >= strtab_size {
                continue;
            }

            let name = table_string(data, strtab_offset + n_strx as usize);
            if name.is_empty() {
                continue;
            }

            let symbol_type = if n_type & 0x0e == 0x0e {
                SymbolType::Function
            } else if n_type & 0x0e == 0x02 {
                SymbolType::Object
            } else {
                SymbolType::Unknown
            };

            symbols.push(Symbol {
                name,
                address: Address::new(n_value),
                size: None,
                symbol_type,
            });
        }

        Ok(symbols)
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }
}

impl BinaryFile for MachOFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::MachO
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn image_base(&self) -> Address {
        self.text_base
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A thin little-endian Mach-O with a `__TEXT,__text` section, a
    /// `__DATA,__data` section, a `__DATA,__bss` zero-fill section and one
    /// exported symbol.
    pub(crate) fn tiny_macho(is_64bit: bool) -> Vec<u8> {
        let mut out = vec![0u8; 0x3000];
        let put32 = |out: &mut Vec<u8>, at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        let put64 = |out: &mut Vec<u8>, at: usize, v: u64| out[at..at + 8].copy_from_slice(&v.to_le_bytes());

        let (magic, cpu, header, seg_cmd, seg_size, sect_size) = if is_64bit {
            (MH_MAGIC_64, CPU_TYPE_ARM64, 32, LC_SEGMENT_64, 72, 80)
        } else {
            (MH_MAGIC, CPU_TYPE_ARM, 28, LC_SEGMENT, 56, 68)
        };
        put32(&mut out, 0, magic);
        put32(&mut out, 4, cpu);
        put32(&mut out, 16, 3);

        // (segname, prot, sections: (sectname, addr, size, offset, flags))
        let segments: [(&str, u32, Vec<(&str, u64, u64, u32, u32)>); 2] = [
            ("__TEXT", VM_PROT_READ | VM_PROT_EXECUTE, vec![("__text", 0x1000, 0x1000, 0x1000, 0)]),
            (
                "__DATA",
                VM_PROT_READ | VM_PROT_WRITE,
                vec![("__data", 0x2000, 0x800, 0x2000, 0), ("__bss", 0x2800, 0x800, 0, S_ZEROFILL)],
            ),
        ];

        let mut at = header;
        for (segname, prot, sects) in &segments {
            let cmdsize = seg_size + sects.len() * sect_size;
            put32(&mut out, at, seg_cmd);
            put32(&mut out, at + 4, cmdsize as u32);
            out[at + 8..at + 8 + segname.len()].copy_from_slice(segname.as_bytes());
            let tail = if is_64bit { at + 56 } else { at + 40 };
            if is_64bit {
                put64(&mut out, at + 24, sects[0].1);
            } else {
                put32(&mut out, at + 24, sects[0].1 as u32);
            }
            put32(&mut out, tail + 4, *prot);
            put32(&mut out, tail + 8, sects.len() as u32);

            let mut sat = at + seg_size;
            for (sectname, addr, size, offset, flags) in sects {
                out[sat..sat + sectname.len()].copy_from_slice(sectname.as_bytes());
                out[sat + 16..sat + 16 + segname.len()].copy_from_slice(segname.as_bytes());
                let after = if is_64bit {
                    put64(&mut out, sat + 32, *addr);
                    put64(&mut out, sat + 40, *size);
                    sat + 48
                } else {
                    put32(&mut out, sat + 32, *addr as u32);
                    put32(&mut out, sat + 36, *size as u32);
                    sat + 40
                };
                put32(&mut out, after, *offset);
                put32(&mut out, after + 16, *flags);
                sat += sect_size;
            }
            at += cmdsize;
        }

        // symtab: one nlist at 0x2900, strings at 0x2a00
        put32(&mut out, at, LC_SYMTAB);
        put32(&mut out, at + 4, 24);
        put32(&mut out, at + 8, 0x2900);
        put32(&mut out, at + 12, 1);
        put32(&mut out, at + 16, 0x2a00);
        put32(&mut out, at + 20, 0x40);
        let name = b"\0_g_CodeRegistration\0";
        out[0x2a00..0x2a00 + name.len()].copy_from_slice(name);
        put32(&mut out, 0x2900, 1);
        out[0x2904] = 0x0f;
        if is_64bit {
            put64(&mut out, 0x2908, 0x2100);
        } else {
            put32(&mut out, 0x2908, 0x2100);
        }
        out
    }

    #[test]
    fn zerofill_sections_are_bss() {
        let macho = MachOFile::parse(&tiny_macho(true)).unwrap();
        assert_eq!(macho.architecture(), Architecture::Arm64);
        assert_eq!(macho.image_base(), Address::new(0x1000));
        let bss = macho.find_section("__DATA,__bss").unwrap();
        assert!(bss.characteristics.contains(SectionFlags::UNINITIALIZED));
        assert_eq!(bss.raw_size, 0);
        assert_eq!(macho.data_sections().len(), 1);
        assert_eq!(macho.va_to_offset(Address::new(0x2900)), None);
    }

    #[test]
    fn symbol_lookup_ignores_underscore() {
        let macho = MachOFile::parse(&tiny_macho(false)).unwrap();
        assert!(!macho.is_64bit());
        assert_eq!(
            macho.find_symbol("g_CodeRegistration").map(|s| s.address),
            Some(Address::new(0x2100))
        );
    }
}
