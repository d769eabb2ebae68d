//! Synthetic metadata blobs and executable images for the unit tests.
//!
//! Every image shares one virtual layout: code at `0x1000..0x3000`, data at
//! `0x4000..0x7000` with a zero-filled tail up to `0x8000`. File offsets
//! equal virtual addresses except for PE file layout.

use crate::locator::SearchCounts;
use crate::session::{Operator, Prompt};
use crate::types::*;
use ilrecover_binary_parser::SliceInfo;
use ilrecover_core::{Address, Error, Result};
use indexmap::IndexMap;
use std::collections::VecDeque;

const IMAGE_SIZE: usize = 0x8000;
const EXEC_VA: u64 = 0x1000;
const DATA_VA: u64 = 0x4000;
const PE_IMAGE_BASE: u64 = 0x40_0000;

const MSCORLIB_NAME: u64 = DATA_VA + 0x10;
const ASSEMBLY_NAME: u64 = DATA_VA + 0x30;
const METHOD_POINTERS: u64 = DATA_VA + 0x100;
const CODE_GEN_MODULES: u64 = DATA_VA + 0x200;
const MODULE_ARRAY: u64 = DATA_VA + 0x280;
const CODE_REGISTRATION: u64 = DATA_VA + 0x300;
const METADATA_REGISTRATION: u64 = DATA_VA + 0x400;
const TYPE_POINTERS: u64 = DATA_VA + 0x500;
const TYPE_RECORDS: u64 = DATA_VA + 0x600;
const TYPE_SIZES: u64 = DATA_VA + 0x700;
const FIELD_OFFSETS: u64 = DATA_VA + 0x720;
const SIZE_VALUES: u64 = DATA_VA + 0x740;

/// Marker in `GenericAdjustorThunks`, implausible when read as an invoker count
const ADJUSTOR_THUNKS: u64 = 0xDEAD_0000;

const ELF_EM_ARM: u16 = 40;
const ELF_EM_AARCH64: u16 = 183;

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_word(buf: &mut [u8], at: u64, value: u64, wide: bool) {
    if wide {
        put_u64(buf, at as usize, value);
    } else {
        put_u32(buf, at as usize, value as u32);
    }
}

/// A built image plus the addresses the tests expect the pipeline to find
pub(crate) struct Fixture {
    pub bytes: Vec<u8>,
    pub code_registration: u64,
    pub metadata_registration: u64,
    pub module_array: u64,
}

/// Description of a synthetic image holding both registrations
#[derive(Debug, Clone)]
pub(crate) struct FixtureImage {
    version: Version,
    layout: Version,
    wide: bool,
    dump_base: Option<u64>,
    pe: bool,
    in_memory: bool,
    machine: Option<u16>,
    usages: u64,
    symbols: bool,
    type_handles: Option<u64>,
    registrations: bool,
    code: Vec<(u64, Vec<u8>)>,
}

impl FixtureImage {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            layout: version,
            wide: false,
            dump_base: None,
            pe: false,
            in_memory: false,
            machine: None,
            usages: 0,
            symbols: false,
            type_handles: None,
            registrations: true,
            code: Vec::new(),
        }
    }

    /// 64-bit pointers
    pub fn wide(mut self) -> Self {
        self.wide = true;
        self
    }

    /// A memory dump loaded at `base`: pointers are absolute and the ELF
    /// has no section headers
    pub fn dumped(mut self, base: u64) -> Self {
        self.dump_base = Some(base);
        self
    }

    pub fn pe(mut self) -> Self {
        self.pe = true;
        self
    }

    /// PE sections stored at their RVAs
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    /// ELF `e_machine`
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = Some(machine);
        self
    }

    pub fn with_usages(mut self, usages: u64) -> Self {
        self.usages = usages;
        self
    }

    /// Export `g_CodeRegistration` and `g_MetadataRegistration`
    pub fn with_symbols(mut self) -> Self {
        self.symbols = true;
        self
    }

    /// Lay the code registration out as `layout` while the image claims `version`
    pub fn layout(mut self, layout: Version) -> Self {
        self.layout = layout;
        self
    }

    /// Class types point at type definitions of metadata loaded at `base`
    pub fn type_handles(mut self, base: u64) -> Self {
        self.type_handles = Some(base);
        self
    }

    pub fn without_registrations(mut self) -> Self {
        self.registrations = false;
        self
    }

    /// Place raw instruction bytes at a code address
    pub fn code_at(mut self, at: u64, bytes: Vec<u8>) -> Self {
        self.code.push((at, bytes));
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn usages(&self) -> u64 {
        self.usages
    }

    fn pointer_size(&self) -> u64 {
        if self.wide {
            8
        } else {
            4
        }
    }

    fn pointer_base(&self) -> u64 {
        match self.dump_base {
            Some(base) => base,
            None if self.pe => PE_IMAGE_BASE,
            None => 0,
        }
    }

    fn ptr(&self, va: u64) -> u64 {
        self.pointer_base() + va
    }

    /// `(code, metadata)` registration addresses as the image's pointers see them
    pub fn registration_addresses(&self) -> (u64, u64) {
        (self.ptr(CODE_REGISTRATION), self.ptr(METADATA_REGISTRATION))
    }

    pub fn type_record_address(&self, index: u64) -> u64 {
        self.ptr(TYPE_RECORDS + index * self.pointer_size() * 2)
    }

    /// Virtual memory image, indexed by address
    fn memory(&self) -> Vec<u8> {
        let mut mem = vec![0u8; IMAGE_SIZE];
        if self.registrations {
            self.write_registrations(&mut mem);
        }
        for (at, bytes) in &self.code {
            let at = *at as usize;
            mem[at..at + bytes.len()].copy_from_slice(bytes);
        }
        mem
    }

    fn write_registrations(&self, mem: &mut [u8]) {
        let p = self.pointer_size();
        let wide = self.wide;
        let word = |mem: &mut [u8], va: u64, value: u64| put_word(mem, va, value, wide);

        mem[MSCORLIB_NAME as usize..][..13].copy_from_slice(b"mscorlib.dll\0");
        mem[ASSEMBLY_NAME as usize..][..16].copy_from_slice(b"Assembly-CSharp\0");

        let code = |offset: u64| self.ptr(EXEC_VA + offset);
        let per_module = self.layout >= Version::new(24, 2);
        if per_module {
            // Assembly-CSharp first, mscorlib second
            let modules = [
                (ASSEMBLY_NAME, METHOD_POINTERS, vec![code(0x200), code(0x300)]),
                (MSCORLIB_NAME, METHOD_POINTERS + 0x40, vec![code(0x100)]),
            ];
            for (k, (name, table, pointers)) in modules.iter().enumerate() {
                for (i, pointer) in pointers.iter().enumerate() {
                    word(mem, table + i as u64 * p, *pointer);
                }
                let module = CODE_GEN_MODULES + k as u64 * 3 * p;
                word(mem, module, self.ptr(*name));
                word(mem, module + p, pointers.len() as u64);
                word(mem, module + 2 * p, self.ptr(*table));
                word(mem, MODULE_ARRAY + k as u64 * p, self.ptr(module));
            }
        } else {
            for (i, offset) in [0x100, 0x200, 0x300].into_iter().enumerate() {
                word(mem, METHOD_POINTERS + i as u64 * p, code(offset));
            }
        }

        for (slot, field) in CodeRegistrationField::layout(self.layout).into_iter().enumerate() {
            let value = match field {
                CodeRegistrationField::MethodPointersCount => 3,
                CodeRegistrationField::MethodPointers => self.ptr(METHOD_POINTERS),
                CodeRegistrationField::GenericAdjustorThunks => ADJUSTOR_THUNKS,
                CodeRegistrationField::CodeGenModulesCount => 2,
                CodeRegistrationField::CodeGenModules => self.ptr(MODULE_ARRAY),
                _ => 0,
            };
            word(mem, CODE_REGISTRATION + slot as u64 * p, value);
        }

        let mut registration = [0u64; Il2CppMetadataRegistration::WORDS];
        registration[6] = 5;
        registration[7] = self.ptr(TYPE_POINTERS);
        registration[10] = 2;
        registration[11] = self.ptr(FIELD_OFFSETS);
        registration[12] = 2;
        registration[13] = self.ptr(TYPE_SIZES);
        registration[14] = self.usages;
        for (i, value) in registration.iter().enumerate() {
            word(mem, METADATA_REGISTRATION + i as u64 * p, *value);
        }

        for i in 0..2u64 {
            word(mem, TYPE_SIZES + i * p, self.ptr(SIZE_VALUES + i * 8));
            word(mem, FIELD_OFFSETS + i * p, self.ptr(SIZE_VALUES + 0x10 + i * 8));
            put_u32(mem, (SIZE_VALUES + i * 8) as usize, 0x10 + i as u32 * 8);
        }

        // Object, Player, void, float, string
        let class = |index: u64| match self.type_handles {
            Some(base) => {
                let tdo = MetadataBuilder::new(self.version).type_definitions_offset();
                base + tdo + index * Il2CppTypeDefinition::size(self.version) as u64
            }
            None => index,
        };
        let types = [
            (class(0), type_enum::CLASS),
            (class(1), type_enum::CLASS),
            (0, type_enum::VOID),
            (0, type_enum::R4),
            (0, type_enum::STRING),
        ];
        for (i, (datapoint, kind)) in types.into_iter().enumerate() {
            let record = TYPE_RECORDS + i as u64 * 2 * p;
            word(mem, TYPE_POINTERS + i as u64 * p, self.ptr(record));
            word(mem, record, datapoint);
            put_u32(mem, (record + p) as usize, (kind as u32) << 16);
        }
    }

    fn finish(&self, bytes: Vec<u8>) -> Fixture {
        let (code_registration, metadata_registration) = self.registration_addresses();
        Fixture {
            bytes,
            code_registration,
            metadata_registration,
            module_array: self.ptr(MODULE_ARRAY),
        }
    }
}

/// ELF with an executable and a writable `PT_LOAD`. File-backed images get
/// `.text`, `.shstrtab`, `.symtab` and `.strtab` section headers.
pub(crate) fn elf_fixture(image: FixtureImage) -> Fixture {
    const PF_X: u32 = 1;
    const PF_W: u32 = 2;
    const PF_R: u32 = 4;
    const SHOFF: usize = 0x7000;

    let mut out = image.memory();
    let wide = image.wide;
    let machine = image
        .machine
        .unwrap_or(if wide { ELF_EM_AARCH64 } else { ELF_EM_ARM });

    out[0..4].copy_from_slice(b"\x7fELF");
    out[4] = if wide { 2 } else { 1 };
    out[5] = 1;
    out[6] = 1;
    put_u16(&mut out, 16, 3);
    put_u16(&mut out, 18, machine);

    let (phoff, phentsize, shentsize) = if wide { (0x40, 56, 64) } else { (0x34, 32, 40) };
    let with_sections = image.dump_base.is_none();
    let (shoff, shnum, shstrndx) = if with_sections { (SHOFF, 5u16, 2u16) } else { (0, 0, 0) };
    if wide {
        put_u64(&mut out, 32, phoff as u64);
        put_u64(&mut out, 40, shoff as u64);
        put_u16(&mut out, 52, 64);
        put_u16(&mut out, 54, phentsize as u16);
        put_u16(&mut out, 56, 2);
        put_u16(&mut out, 58, shentsize as u16);
        put_u16(&mut out, 60, shnum);
        put_u16(&mut out, 62, shstrndx);
    } else {
        put_u32(&mut out, 28, phoff as u32);
        put_u32(&mut out, 32, shoff as u32);
        put_u16(&mut out, 40, 52);
        put_u16(&mut out, 42, phentsize as u16);
        put_u16(&mut out, 44, 2);
        put_u16(&mut out, 46, shentsize as u16);
        put_u16(&mut out, 48, shnum);
        put_u16(&mut out, 50, shstrndx);
    }

    // (offset/vaddr, filesz, memsz, flags)
    let segments = [
        (0u64, 0x3000u64, 0x3000u64, PF_R | PF_X),
        (DATA_VA, 0x3000, 0x4000, PF_R | PF_W),
    ];
    for (i, (va, filesz, memsz, flags)) in segments.into_iter().enumerate() {
        let at = phoff + i * phentsize;
        put_u32(&mut out, at, 1);
        if wide {
            put_u32(&mut out, at + 4, flags);
            put_u64(&mut out, at + 8, va);
            put_u64(&mut out, at + 16, va);
            put_u64(&mut out, at + 24, va);
            put_u64(&mut out, at + 32, filesz);
            put_u64(&mut out, at + 40, memsz);
        } else {
            put_u32(&mut out, at + 4, va as u32);
            put_u32(&mut out, at + 8, va as u32);
            put_u32(&mut out, at + 12, va as u32);
            put_u32(&mut out, at + 16, filesz as u32);
            put_u32(&mut out, at + 20, memsz as u32);
            put_u32(&mut out, at + 24, flags);
        }
    }

    if with_sections {
        let names = b"\0.text\0.shstrtab\0.symtab\0.strtab\0";
        let strings = b"\0g_CodeRegistration\0g_MetadataRegistration\0";
        let (names_at, strings_at, symtab_at) = (0x7200usize, 0x7280usize, 0x7300usize);
        out[names_at..names_at + names.len()].copy_from_slice(names);
        out[strings_at..strings_at + strings.len()].copy_from_slice(strings);

        let sym_size = if wide { 24 } else { 16 };
        let (code, meta) = image.registration_addresses();
        for (k, (name, value)) in [(1u32, code), (20, meta)].into_iter().enumerate() {
            let at = symtab_at + (k + 1) * sym_size;
            put_u32(&mut out, at, name);
            if wide {
                out[at + 4] = 1; // STT_OBJECT
                put_u64(&mut out, at + 8, value);
            } else {
                put_u32(&mut out, at + 4, value as u32);
                out[at + 12] = 1;
            }
        }
        let symtab_size = if image.symbols { 3 * sym_size } else { 0 };

        // (name, type, offset, size, link)
        let headers = [
            (1u32, 1u32, EXEC_VA, 0x2000u64, 0u32),
            (7, 3, names_at as u64, names.len() as u64, 0),
            (17, 2, symtab_at as u64, symtab_size as u64, 4),
            (25, 3, strings_at as u64, strings.len() as u64, 0),
        ];
        for (k, (name, kind, offset, size, link)) in headers.into_iter().enumerate() {
            let at = SHOFF + (k + 1) * shentsize;
            put_u32(&mut out, at, name);
            put_u32(&mut out, at + 4, kind);
            if wide {
                put_u64(&mut out, at + 24, offset);
                put_u64(&mut out, at + 32, size);
                put_u32(&mut out, at + 40, link);
            } else {
                put_u32(&mut out, at + 16, offset as u32);
                put_u32(&mut out, at + 20, size as u32);
                put_u32(&mut out, at + 24, link);
            }
        }
    }

    image.finish(out)
}

/// PE32 (or PE32+ when wide) with `.text` and `.data`
pub(crate) fn pe_fixture(image: FixtureImage) -> Fixture {
    const EXECUTE_READ: u32 = 0x6000_0020;
    const READ_WRITE_DATA: u32 = 0xC000_0040;

    let memory = image.memory();
    let mut out = vec![0u8; IMAGE_SIZE];
    let wide = image.wide;

    out[0..3].copy_from_slice(b"MZ\x90");
    put_u32(&mut out, 0x3C, 0x80);
    out[0x80..0x84].copy_from_slice(b"PE\0\0");
    put_u16(&mut out, 0x84, if wide { 0x8664 } else { 0x014C });
    put_u16(&mut out, 0x86, 2);
    let optional_size = if wide { 0xF0 } else { 0xE0 };
    put_u16(&mut out, 0x94, optional_size as u16);
    put_u16(&mut out, 0x98, if wide { 0x20B } else { 0x10B });
    if wide {
        put_u64(&mut out, 0x98 + 24, PE_IMAGE_BASE);
    } else {
        put_u32(&mut out, 0x98 + 28, PE_IMAGE_BASE as u32);
    }

    // (name, rva, virtual size, raw size, file offset, characteristics)
    let sections: [(&[u8], u32, u32, u32, u32, u32); 2] = [
        (b".text", EXEC_VA as u32, 0x2000, 0x2000, 0x400, EXECUTE_READ),
        (b".data", DATA_VA as u32, 0x4000, 0x3000, 0x2400, READ_WRITE_DATA),
    ];
    let mut at = 0x98 + optional_size;
    for (name, rva, virtual_size, raw_size, file_offset, flags) in sections {
        let raw = if image.in_memory { rva } else { file_offset };
        let (src, dst, len) = (rva as usize, raw as usize, raw_size as usize);
        out[dst..dst + len].copy_from_slice(&memory[src..src + len]);

        out[at..at + name.len()].copy_from_slice(name);
        put_u32(&mut out, at + 8, virtual_size);
        put_u32(&mut out, at + 12, rva);
        put_u32(&mut out, at + 16, raw_size);
        put_u32(&mut out, at + 20, raw);
        put_u32(&mut out, at + 36, flags);
        at += 40;
    }

    image.finish(out)
}

/// Thin little-endian Mach-O, ARM64 when wide and ARM otherwise
pub(crate) fn macho_fixture(image: FixtureImage) -> Fixture {
    const VM_PROT_RX: u32 = 0x5;
    const VM_PROT_RW: u32 = 0x3;
    const SYMBOLS_AT: usize = 0x7000;
    const STRINGS_AT: usize = 0x7100;

    let mut out = image.memory();
    let wide = image.wide;

    let (magic, cputype, header, seg_cmd, seg_size, sect_size) = if wide {
        (0xFEED_FACFu32, 0x0100_000Cu32, 32usize, 0x19u32, 72usize, 80usize)
    } else {
        (0xFEED_FACE, 12, 28, 0x01, 56, 68)
    };
    put_u32(&mut out, 0, magic);
    put_u32(&mut out, 4, cputype);
    put_u32(&mut out, 12, 6);
    put_u32(&mut out, 16, 3);
    put_u32(&mut out, 20, (2 * (seg_size + sect_size) + 24) as u32);

    let segments = [
        ("__TEXT", "__text", EXEC_VA, 0x2000u64, VM_PROT_RX),
        ("__DATA", "__data", DATA_VA, 0x3000, VM_PROT_RW),
    ];
    let mut at = header;
    for (segname, sectname, addr, size, prot) in segments {
        put_u32(&mut out, at, seg_cmd);
        put_u32(&mut out, at + 4, (seg_size + sect_size) as u32);
        out[at + 8..at + 8 + segname.len()].copy_from_slice(segname.as_bytes());
        let prot_at = if wide {
            put_u64(&mut out, at + 24, addr);
            put_u64(&mut out, at + 32, size);
            put_u64(&mut out, at + 40, addr);
            put_u64(&mut out, at + 48, size);
            at + 56
        } else {
            put_u32(&mut out, at + 24, addr as u32);
            put_u32(&mut out, at + 28, size as u32);
            put_u32(&mut out, at + 32, addr as u32);
            put_u32(&mut out, at + 36, size as u32);
            at + 40
        };
        put_u32(&mut out, prot_at, prot);
        put_u32(&mut out, prot_at + 4, prot);
        put_u32(&mut out, prot_at + 8, 1);

        let sect = at + seg_size;
        out[sect..sect + sectname.len()].copy_from_slice(sectname.as_bytes());
        out[sect + 16..sect + 16 + segname.len()].copy_from_slice(segname.as_bytes());
        let offset_at = if wide {
            put_u64(&mut out, sect + 32, addr);
            put_u64(&mut out, sect + 40, size);
            sect + 48
        } else {
            put_u32(&mut out, sect + 32, addr as u32);
            put_u32(&mut out, sect + 36, size as u32);
            sect + 40
        };
        put_u32(&mut out, offset_at, addr as u32);
        at += seg_size + sect_size;
    }

    let strings = b"\0_g_CodeRegistration\0_g_MetadataRegistration\0";
    let nsyms = if image.symbols { 2 } else { 0 };
    put_u32(&mut out, at, 0x2);
    put_u32(&mut out, at + 4, 24);
    put_u32(&mut out, at + 8, SYMBOLS_AT as u32);
    put_u32(&mut out, at + 12, nsyms);
    put_u32(&mut out, at + 16, STRINGS_AT as u32);
    put_u32(&mut out, at + 20, strings.len() as u32);
    out[STRINGS_AT..STRINGS_AT + strings.len()].copy_from_slice(strings);

    let sym_size = if wide { 16 } else { 12 };
    let (code, meta) = image.registration_addresses();
    for (k, (name, value)) in [(1u32, code), (21, meta)].into_iter().enumerate() {
        let entry = SYMBOLS_AT + k * sym_size;
        put_u32(&mut out, entry, name);
        out[entry + 4] = 0x0F;
        put_word(&mut out, entry as u64 + 8, value, wide);
    }

    image.finish(out)
}

/// Big-endian universal container around thin images
pub(crate) fn fat_fixture<S: AsRef<[u8]>>(slices: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = 0x1000u32;
    let mut placed = Vec::new();
    for slice in slices {
        let slice = slice.as_ref();
        let cputype = if slice[0] == 0xCF { 0x0100_000C } else { 12u32 };
        for field in [cputype, 0, offset, slice.len() as u32, 12] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        placed.push(offset as usize);
        offset += (slice.len() as u32 + 0xFFF) & !0xFFF;
    }
    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend_from_slice(slice.as_ref());
    }
    out
}

/// `adrp xN, target` placed at `pc`
pub(crate) fn arm64_adrp(rd: u32, pc: u64, target: u64) -> u32 {
    let pages = ((target & !0xFFF) as i64 - (pc & !0xFFF) as i64) >> 12;
    let imm = (pages as u32) & 0x1F_FFFF;
    0x9000_0000 | ((imm & 0x3) << 29) | ((imm >> 2) << 5) | rd
}

/// `add xD, xN, #imm12`
pub(crate) fn arm64_add(rd: u32, rn: u32, imm: u64) -> u32 {
    0x9100_0000 | (((imm as u32) & 0xFFF) << 10) | (rn << 5) | rd
}

/// Builds a global-metadata blob with two images, two types and three
/// methods:
///
/// * `mscorlib.dll`: `System.Object` with `ToString()`
/// * `Assembly-CSharp`: `Game.Player : Object` with field `health`,
///   property `Speed`, and methods `get_Speed()` and `Jump(float height)`
pub(crate) struct MetadataBuilder {
    version: Version,
    usages: Vec<u32>,
}

struct StringHeap(Vec<u8>);

impl StringHeap {
    fn add(&mut self, value: &str) -> u32 {
        let index = self.0.len() as u32;
        self.0.extend_from_slice(value.as_bytes());
        self.0.push(0);
        index
    }
}

struct Row(Vec<u8>);

impl Row {
    fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }
}

impl MetadataBuilder {
    pub fn new(version: Version) -> Self {
        Self { version, usages: Vec::new() }
    }

    /// Metadata usage pairs with these destination slots
    pub fn with_usages(mut self, destinations: &[u32]) -> Self {
        self.usages = destinations.to_vec();
        self
    }

    /// Counts the fixture metadata reports to the searches
    pub fn counts() -> SearchCounts {
        SearchCounts {
            defined_method_count: 3,
            type_definition_count: 2,
            image_count: 2,
        }
    }

    pub fn type_definitions_offset(&self) -> u64 {
        let (_, ranges) = self.assemble();
        ranges
            .get(tables::TYPE_DEFINITIONS)
            .map(|range| range.offset as u64)
            .unwrap_or_default()
    }

    pub fn build(&self) -> Vec<u8> {
        self.assemble().0
    }

    fn assemble(&self) -> (Vec<u8>, IndexMap<&'static str, TableRange>) {
        let v = self.version;
        let mut strings = StringHeap(vec![0]);
        let mscorlib = strings.add("mscorlib.dll");
        let assembly = strings.add("Assembly-CSharp");
        let system = strings.add("System");
        let object = strings.add("Object");
        let game = strings.add("Game");
        let player = strings.add("Player");
        let to_string = strings.add("ToString");
        let get_speed = strings.add("get_Speed");
        let jump = strings.add("Jump");
        let height = strings.add("height");
        let health = strings.add("health");
        let speed = strings.add("Speed");

        let mut blobs: IndexMap<&'static str, Vec<u8>> = IndexMap::new();
        blobs.insert(tables::STRING, strings.0);

        let types = [
            Il2CppTypeDefinition {
                name_index: object,
                namespace_index: system,
                byval_type_index: 0,
                parent_index: -1,
                flags: type_attributes::PUBLIC,
                method_start: 0,
                method_count: 1,
                token: 0x0200_0002,
                ..Self::type_defaults()
            },
            Il2CppTypeDefinition {
                name_index: player,
                namespace_index: game,
                byval_type_index: 1,
                parent_index: 0,
                flags: type_attributes::PUBLIC | type_attributes::SEALED,
                field_start: 0,
                field_count: 1,
                method_start: 1,
                method_count: 2,
                property_start: 0,
                property_count: 1,
                token: 0x0200_0002,
                ..Self::type_defaults()
            },
        ];
        let mut rows = Row(Vec::new());
        for def in &types {
            Self::type_row(v, def, &mut rows);
        }
        blobs.insert(tables::TYPE_DEFINITIONS, rows.0);

        let public = method_attributes::PUBLIC;
        let methods = [
            (to_string, 0, 4, -1, 0u16, 0, 0x0600_0001, public | method_attributes::VIRTUAL),
            (get_speed, 1, 3, -1, 0, 1, 0x0600_0001, public),
            (jump, 1, 2, 0, 1, 2, 0x0600_0002, public),
        ];
        let mut rows = Row(Vec::new());
        for (name, declaring, ret, param_start, param_count, index, token, flags) in methods {
            rows.u32(name).i32(declaring).i32(ret);
            if v >= Version::new(31, 0) {
                rows.i32(0);
            }
            rows.i32(param_start);
            if v <= Version::new(24, 0) {
                rows.i32(-1);
            }
            rows.i32(-1);
            if Il2CppMethodDefinition::has_method_index(v) {
                rows.i32(index).i32(index).i32(-1).i32(-1).i32(0);
            }
            rows.u32(token).u16(flags).u16(0).u16(0xFFFF).u16(param_count);
        }
        blobs.insert(tables::METHODS, rows.0);

        let mut rows = Row(Vec::new());
        rows.u32(height).u32(0x0800_0001);
        if v <= Version::new(24, 0) {
            rows.i32(-1);
        }
        rows.i32(3);
        blobs.insert(tables::PARAMETERS, rows.0);

        let mut rows = Row(Vec::new());
        rows.u32(health).i32(3);
        if v <= Version::new(24, 0) {
            rows.i32(-1);
        }
        rows.u32(0x0400_0001);
        blobs.insert(tables::FIELDS, rows.0);

        let mut rows = Row(Vec::new());
        rows.u32(speed).i32(0).i32(-1).u32(0);
        if v <= Version::new(24, 0) {
            rows.i32(-1);
        }
        rows.u32(0x1700_0001);
        blobs.insert(tables::PROPERTIES, rows.0);

        let mut rows = Row(Vec::new());
        for (k, name) in [mscorlib, assembly].into_iter().enumerate() {
            rows.u32(name).i32(k as i32).i32(k as i32).u32(1).i32(-1).u32(0).i32(-1).u32(1);
            if v >= Version::new(24, 1) {
                rows.i32(0).u32(0);
            }
        }
        blobs.insert(tables::IMAGES, rows.0);

        let mut rows = Row(Vec::new());
        for (source, destination) in self.usages.iter().enumerate() {
            rows.u32(*destination).u32(source as u32);
        }
        blobs.insert(tables::METADATA_USAGE_PAIRS, rows.0);

        let names = header_tables(v);
        let mut body_at = 8 + 8 * names.len();
        let mut header = Vec::with_capacity(body_at);
        header.extend_from_slice(&METADATA_MAGIC.to_le_bytes());
        header.extend_from_slice(&v.major.to_le_bytes());
        let mut body = Vec::new();
        let mut ranges = IndexMap::new();
        for name in names {
            let blob = blobs.get(name).map(Vec::as_slice).unwrap_or_default();
            let range = TableRange { offset: body_at as u32, size: blob.len() as u32 };
            header.extend_from_slice(&range.offset.to_le_bytes());
            header.extend_from_slice(&range.size.to_le_bytes());
            body.extend_from_slice(blob);
            body_at += blob.len();
            ranges.insert(name, range);
        }
        header.extend_from_slice(&body);
        (header, ranges)
    }

    fn type_defaults() -> Il2CppTypeDefinition {
        Il2CppTypeDefinition {
            custom_attribute_index: -1,
            byref_type_index: -1,
            declaring_type_index: -1,
            element_type_index: -1,
            rgctx_start_index: -1,
            generic_container_index: -1,
            event_start: -1,
            nested_types_start: -1,
            interfaces_start: -1,
            vtable_start: -1,
            interface_offsets_start: -1,
            ..Default::default()
        }
    }

    fn type_row(v: Version, def: &Il2CppTypeDefinition, rows: &mut Row) {
        rows.u32(def.name_index).u32(def.namespace_index);
        if v <= Version::new(24, 0) {
            rows.i32(def.custom_attribute_index);
        }
        rows.i32(def.byval_type_index);
        if v < Version::new(27, 0) {
            rows.i32(def.byref_type_index);
        }
        rows.i32(def.declaring_type_index)
            .i32(def.parent_index)
            .i32(def.element_type_index);
        if v <= Version::new(24, 1) {
            rows.i32(def.rgctx_start_index).i32(def.rgctx_count);
        }
        rows.i32(def.generic_container_index)
            .u32(def.flags)
            .i32(def.field_start)
            .i32(def.method_start)
            .i32(def.event_start)
            .i32(def.property_start)
            .i32(def.nested_types_start)
            .i32(def.interfaces_start)
            .i32(def.vtable_start)
            .i32(def.interface_offsets_start);
        for count in [
            def.method_count,
            def.property_count,
            def.field_count,
            def.event_count,
            def.nested_types_count,
            def.vtable_count,
            def.interfaces_count,
            def.interface_offsets_count,
        ] {
            rows.u16(count);
        }
        rows.u32(def.bitfield).u32(def.token);
    }
}

/// Operator answering from queued replies, recording every prompt
pub(crate) struct ScriptedOperator {
    slices: VecDeque<usize>,
    addresses: VecDeque<Address>,
    pub prompts: Vec<Prompt>,
}

impl ScriptedOperator {
    pub fn new(slices: Vec<usize>, addresses: Vec<Address>) -> Self {
        Self {
            slices: slices.into(),
            addresses: addresses.into(),
            prompts: Vec::new(),
        }
    }
}

impl Operator for ScriptedOperator {
    fn select_slice(&mut self, slices: &[SliceInfo]) -> Result<usize> {
        self.prompts.push(Prompt::SelectSlice(slices.to_vec()));
        self.slices
            .pop_front()
            .ok_or_else(|| Error::invalid_input("no slice reply queued"))
    }

    fn read_address(&mut self, prompt: &Prompt) -> Result<Address> {
        self.prompts.push(prompt.clone());
        self.addresses
            .pop_front()
            .ok_or_else(|| Error::invalid_input("no address reply queued"))
    }
}
