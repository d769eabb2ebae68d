//! Counts-driven registration search over the exec, data and bss ranges

use crate::locator::SearchCounts;
use crate::types::{CodeRegistrationField, Il2CppMetadataRegistration, Version};
use ilrecover_binary_parser::{BinaryFile, BinaryReader, SectionFlags};
use ilrecover_core::Address;
use tracing::debug;

const MSCORLIB: &[u8] = b"mscorlib.dll\0";

/// File and virtual extent of one searchable range
#[derive(Debug, Clone, Copy)]
pub struct SearchSection {
    pub offset: u64,
    pub offset_end: u64,
    pub address: u64,
    pub address_end: u64,
}

impl SearchSection {
    fn contains(&self, va: u64) -> bool {
        va >= self.address && va < self.address_end
    }
}

/// Classified address ranges of an image plus the counts the heuristics
/// validate against
pub struct SectionHelper<'a> {
    file: &'a dyn BinaryFile,
    version: Version,
    counts: SearchCounts,
    metadata_usages_count: u64,
    exec: Vec<SearchSection>,
    data: Vec<SearchSection>,
    bss: Vec<SearchSection>,
}

impl<'a> SectionHelper<'a> {
    pub fn new(
        file: &'a dyn BinaryFile,
        version: Version,
        counts: SearchCounts,
        metadata_usages_count: u64,
    ) -> Self {
        let mut exec = Vec::new();
        let mut data = Vec::new();
        let mut bss = Vec::new();

        for section in file.sections() {
            let address = section.virtual_address.as_u64();
            let flags = section.characteristics;

            if flags.contains(SectionFlags::EXECUTE) {
                exec.push(SearchSection {
                    offset: section.raw_offset,
                    offset_end: section.raw_offset + section.raw_size,
                    address,
                    address_end: section.virtual_end(),
                });
            } else if flags.contains(SectionFlags::UNINITIALIZED) || section.raw_size == 0 {
                bss.push(SearchSection {
                    offset: section.raw_offset,
                    offset_end: section.raw_offset,
                    address,
                    address_end: section.virtual_end(),
                });
                continue;
            } else {
                data.push(SearchSection {
                    offset: section.raw_offset,
                    offset_end: section.raw_offset + section.raw_size,
                    address,
                    address_end: address + section.raw_size,
                });
            }

            // zero-filled tail past the file-backed part
            if !flags.contains(SectionFlags::EXECUTE) && section.virtual_size > section.raw_size {
                bss.push(SearchSection {
                    offset: section.raw_offset + section.raw_size,
                    offset_end: section.raw_offset + section.raw_size,
                    address: address + section.raw_size,
                    address_end: section.virtual_end(),
                });
            }
        }

        debug!(
            "Search ranges: {} exec, {} data, {} bss",
            exec.len(),
            data.len(),
            bss.len()
        );

        Self { file, version, counts, metadata_usages_count, exec, data, bss }
    }

    pub fn file(&self) -> &'a dyn BinaryFile {
        self.file
    }

    pub fn exec(&self) -> &[SearchSection] {
        &self.exec
    }

    pub fn data(&self) -> &[SearchSection] {
        &self.data
    }

    pub fn bss(&self) -> &[SearchSection] {
        &self.bss
    }

    pub fn in_exec(&self, va: u64) -> bool {
        self.exec.iter().any(|s| s.contains(va))
    }

    pub fn in_data(&self, va: u64) -> bool {
        self.data.iter().any(|s| s.contains(va))
    }

    pub fn in_bss(&self, va: u64) -> bool {
        self.bss.iter().any(|s| s.contains(va))
    }

    fn pointer_size(&self) -> usize {
        self.file.pointer_size()
    }

    fn bytes_of(&self, section: &SearchSection) -> &'a [u8] {
        let data = self.file.data();
        let start = (section.offset as usize).min(data.len());
        let end = (section.offset_end as usize).clamp(start, data.len());
        &data[start..end]
    }

    fn word(&self, bytes: &[u8]) -> u64 {
        if self.pointer_size() == 8 {
            u64::from_le_bytes(bytes[..8].try_into().unwrap_or_default())
        } else {
            u32::from_le_bytes(bytes[..4].try_into().unwrap_or_default()) as u64
        }
    }

    /// Pointer-sized word at a virtual address
    pub fn read_word(&self, va: u64) -> Option<u64> {
        let p = self.pointer_size();
        let bytes = self.file.read_va(Address::new(va), p).ok()?;
        BinaryReader::new(bytes, true).read_pointer(p).ok()
    }

    /// `count` consecutive pointer-sized words at a virtual address
    pub fn read_words(&self, va: u64, count: u64) -> Option<Vec<u64>> {
        let p = self.pointer_size();
        let len = usize::try_from(count).ok()?.checked_mul(p)?;
        let bytes = self.file.read_va(Address::new(va), len).ok()?;
        Some(bytes.chunks_exact(p).map(|chunk| self.word(chunk)).collect())
    }

    /// Addresses of pointer-aligned words in data that hold `addr`
    pub fn find_reference(&self, addr: u64) -> Vec<u64> {
        let p = self.pointer_size();
        let mut refs = Vec::new();
        for section in &self.data {
            let bytes = self.bytes_of(section);
            for (i, chunk) in bytes.chunks_exact(p).enumerate() {
                if self.word(chunk) == addr {
                    refs.push(section.address + (i * p) as u64);
                }
            }
        }
        refs
    }

    pub fn find_code_registration(&self) -> Option<u64> {
        if self.version >= Version::new(24, 2) {
            self.find_code_registration_2019()
        } else {
            self.find_code_registration_old()
        }
    }

    /// Pre-24.2 layout: `methodPointersCount` followed by a pointer to that
    /// many pointers into executable code.
    fn find_code_registration_old(&self) -> Option<u64> {
        let p = self.pointer_size();
        let count = self.counts.defined_method_count as u64;
        if count == 0 {
            return None;
        }

        for section in &self.data {
            let bytes = self.bytes_of(section);
            let words: Vec<u64> = bytes.chunks_exact(p).map(|c| self.word(c)).collect();
            for (i, pair) in words.windows(2).enumerate() {
                if pair[0] != count || !self.in_data(pair[1]) {
                    continue;
                }
                let Some(pointers) = self.read_words(pair[1], count) else {
                    continue;
                };
                if pointers.iter().all(|&ptr| self.in_exec(ptr)) {
                    return Some(section.address + (i * p) as u64);
                }
            }
        }
        None
    }

    /// 24.2+ layout: walk from the `mscorlib.dll` module name back through
    /// its code-gen module and the module array to the registration.
    fn find_code_registration_2019(&self) -> Option<u64> {
        let p = self.pointer_size() as u64;
        let slot = CodeRegistrationField::CodeGenModules.slot(self.version)? as u64;
        let image_count = self.counts.image_count as u64;

        for section in self.exec.iter().chain(&self.data) {
            let bytes = self.bytes_of(section);
            let hits = bytes
                .windows(MSCORLIB.len())
                .enumerate()
                .filter(|(_, window)| *window == MSCORLIB)
                .map(|(index, _)| index as u64);

            for index in hits {
                let dll_va = section.address + index;
                for module in self.find_reference(dll_va) {
                    for entry in self.find_reference(module) {
                        for i in 0..image_count {
                            let Some(first) = entry.checked_sub(i * p) else {
                                break;
                            };
                            for field in self.find_reference(first) {
                                let Some(count_va) = field.checked_sub(p) else {
                                    continue;
                                };
                                if self.read_word(count_va) == Some(image_count) {
                                    return field.checked_sub(p * slot);
                                }
                            }
                        }
                    }
                }
            }
        }
        None
    }

    /// `fieldOffsetsCount` and `typeDefinitionsSizesCount` both equal the
    /// type definition count and the sizes table points into data.
    pub fn find_metadata_registration(&self) -> Option<u64> {
        let p = self.pointer_size();
        let count = self.counts.type_definition_count as u64;
        if count == 0 {
            return None;
        }
        let check_usages = self.version < Version::from(27) && self.metadata_usages_count > 0;

        for section in &self.data {
            let bytes = self.bytes_of(section);
            let words: Vec<u64> = bytes.chunks_exact(p).map(|c| self.word(c)).collect();
            for i in 0..words.len().saturating_sub(3) {
                if words[i] != count || words[i + 2] != count {
                    continue;
                }
                let sizes = words[i + 3];
                if !self.in_data(sizes) {
                    continue;
                }
                if check_usages && words.get(i + 4) != Some(&self.metadata_usages_count) {
                    continue;
                }
                let Some(pointers) = self.read_words(sizes, count) else {
                    continue;
                };
                if !pointers.iter().all(|&ptr| self.in_data(ptr) || self.in_bss(ptr)) {
                    continue;
                }
                let field_offsets_count = section.address + (i * p) as u64;
                return field_offsets_count.checked_sub((10 * p) as u64);
            }
        }
        None
    }

    /// Structural sanity check for a metadata registration candidate
    pub fn is_metadata_registration(&self, va: u64) -> bool {
        let Some(words) = self.read_words(va, Il2CppMetadataRegistration::WORDS as u64) else {
            return false;
        };
        words[10] != 0 && words[10] == words[12] && self.in_data(words[13])
    }
}
