//! The IL2CPP binary image: one decoded container plus the registration
//! state recovered from it

use crate::locator::{RegistrationSearch, SearchCounts};
use crate::search;
use crate::section_helper::SectionHelper;
use crate::types::*;
use ilrecover_binary_parser::{BinaryFile, BinaryReader, ContainerImage, ContainerKind};
use ilrecover_core::{Address, BinaryFormat, Error, Result};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

/// Implausible invoker count, a sign the layout carries one more field
const MAX_INVOKER_POINTERS: u64 = 0x50000;

const MAX_MODULE_NAME: usize = 1024;

/// Uniform view of the executable container for the recovery pipeline
pub struct Il2CppImage {
    container: ContainerImage,
    version: Version,
    metadata_usages_count: u64,
    image_base: Address,
    is_dumped: bool,
    code_registration_address: Address,
    metadata_registration_address: Address,
    code_registration: Il2CppCodeRegistration,
    metadata_registration: Il2CppMetadataRegistration,
    types: Vec<Il2CppType>,
    method_pointers: Vec<u64>,
    code_gen_modules: IndexMap<String, Vec<u64>>,
}

impl Il2CppImage {
    pub fn new(container: ContainerImage) -> Self {
        let image_base = container.file().image_base();
        Self {
            container,
            version: Version::from(MIN_METADATA_VERSION),
            metadata_usages_count: 0,
            image_base,
            is_dumped: false,
            code_registration_address: Address::ZERO,
            metadata_registration_address: Address::ZERO,
            code_registration: Il2CppCodeRegistration::default(),
            metadata_registration: Il2CppMetadataRegistration::default(),
            types: Vec::new(),
            method_pointers: Vec::new(),
            code_gen_modules: IndexMap::new(),
        }
    }

    /// Adopt the metadata version and the usage count the searches check
    pub fn set_properties(&mut self, version: Version, metadata_usages_count: u64) {
        self.version = version;
        self.metadata_usages_count = metadata_usages_count;
        debug!(
            "Image properties: version {}, {} metadata usages",
            version, metadata_usages_count
        );
    }

    /// Whether the layout looks like a raw memory dump
    pub fn check_dump(&self) -> bool {
        self.file().looks_like_dump()
    }

    pub fn file(&self) -> &dyn BinaryFile {
        self.container.file()
    }

    pub fn kind(&self) -> ContainerKind {
        self.container.kind()
    }

    pub fn format(&self) -> BinaryFormat {
        self.file().format()
    }

    pub fn pointer_size(&self) -> usize {
        self.file().pointer_size()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn image_base(&self) -> Address {
        self.image_base
    }

    pub fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    pub(crate) fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    pub fn supports_reload(&self) -> bool {
        self.container.supports_reload()
    }

    /// Re-derive the container layout around `image_base`, adopting it as
    /// this image's base once the layout fits
    pub fn reload(&mut self, image_base: Address) -> Result<()> {
        self.container.reload(image_base)?;
        self.image_base = image_base;
        Ok(())
    }

    pub fn code_registration_address(&self) -> Address {
        self.code_registration_address
    }

    pub fn metadata_registration_address(&self) -> Address {
        self.metadata_registration_address
    }

    pub fn code_registration(&self) -> &Il2CppCodeRegistration {
        &self.code_registration
    }

    pub fn metadata_registration(&self) -> &Il2CppMetadataRegistration {
        &self.metadata_registration
    }

    /// Runtime type records, in `types` array order
    pub fn types(&self) -> &[Il2CppType] {
        &self.types
    }

    /// Global method pointer table (before 24.2)
    pub fn method_pointers(&self) -> &[u64] {
        &self.method_pointers
    }

    /// Per-module method pointer tables (24.2 and later)
    pub fn code_gen_modules(&self) -> &IndexMap<String, Vec<u64>> {
        &self.code_gen_modules
    }

    fn section_helper(&self, counts: SearchCounts) -> SectionHelper<'_> {
        SectionHelper::new(self.file(), self.version, counts, self.metadata_usages_count)
    }

    /// Counts-driven search for both registrations
    pub fn plus_search(&mut self, counts: &SearchCounts) -> Result<bool> {
        let (code, meta) = {
            let helper = self.section_helper(*counts);
            (helper.find_code_registration(), helper.find_metadata_registration())
        };
        debug!("Plus search: code {:?}, metadata {:?}", code, meta);
        self.auto_init(code, meta)
    }

    /// Call-site signature search
    pub fn search(&mut self) -> Result<bool> {
        let found = search::find_registrations(&self.section_helper(SearchCounts::default()));
        match found {
            Some((code, meta)) => self.auto_init(Some(code), Some(meta)),
            None => Ok(false),
        }
    }

    /// Exported `g_CodeRegistration` / `g_MetadataRegistration` symbols
    pub fn symbol_search(&mut self) -> Result<bool> {
        let lookup = |name: &str| self.file().find_symbol(name).map(|s| s.address.as_u64());
        let (code, meta) = (lookup("g_CodeRegistration"), lookup("g_MetadataRegistration"));
        debug!("Symbol search: code {:?}, metadata {:?}", code, meta);

        // Only a rebased dump has symbol values relative to its base
        let base = if self.is_dumped && self.supports_reload() {
            self.image_base.as_u64()
        } else {
            0
        };
        self.auto_init(
            code.and_then(|a| a.checked_add(base)),
            meta.and_then(|a| a.checked_add(base)),
        )
    }

    fn auto_init(&mut self, code: Option<u64>, meta: Option<u64>) -> Result<bool> {
        match (code, meta) {
            (Some(code), Some(meta)) if code != 0 && meta != 0 => {
                self.init(Address::new(code), Address::new(meta))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Read both registrations and everything hanging off them.
    ///
    /// The addresses are trusted as given; a wrong address surfaces as a
    /// read fault here or as nonsense further down.
    pub fn init(&mut self, code_registration: Address, metadata_registration: Address) -> Result<()> {
        info!("CodeRegistration : {}", code_registration);
        info!("MetadataRegistration : {}", metadata_registration);

        let mut code = self.read_code_registration(code_registration)?;
        let invokers = code.get(CodeRegistrationField::InvokerPointersCount);
        if self.version == Version::from(27) && invokers > MAX_INVOKER_POINTERS {
            self.refine_version(Version::new(27, 1));
            code = self.read_code_registration(code_registration)?;
        }
        if self.version == Version::new(24, 4) && invokers > MAX_INVOKER_POINTERS {
            self.refine_version(Version::new(24, 5));
            code = self.read_code_registration(code_registration)?;
        }
        if self.version == Version::new(24, 2) && code.get(CodeRegistrationField::CodeGenModules) == 0
        {
            self.refine_version(Version::new(24, 3));
            code = self.read_code_registration(code_registration)?;
        }

        let words = self.read_words(metadata_registration.as_u64(), Il2CppMetadataRegistration::WORDS as u64)?;
        let mut fixed = [0u64; Il2CppMetadataRegistration::WORDS];
        fixed.copy_from_slice(&words);
        let metadata = Il2CppMetadataRegistration::from_words(&fixed);

        let type_pointers = self.read_words(metadata.types, metadata.types_count as u64)?;
        let types = type_pointers
            .iter()
            .map(|&ptr| self.read_type_at(ptr))
            .collect::<Result<Vec<_>>>()?;
        debug!("Read {} runtime types", types.len());

        if self.version >= Version::new(24, 2) {
            self.code_gen_modules = self.read_code_gen_modules(&code)?;
            self.method_pointers.clear();
        } else {
            self.method_pointers = self.read_words(
                code.get(CodeRegistrationField::MethodPointers),
                code.get(CodeRegistrationField::MethodPointersCount),
            )?;
            self.code_gen_modules.clear();
        }

        self.code_registration_address = code_registration;
        self.metadata_registration_address = metadata_registration;
        self.code_registration = code;
        self.metadata_registration = metadata;
        self.types = types;
        Ok(())
    }

    fn refine_version(&mut self, version: Version) {
        info!("Change il2cpp version to: {}", version);
        self.version = version;
    }

    fn read_code_registration(&self, va: Address) -> Result<Il2CppCodeRegistration> {
        let layout = CodeRegistrationField::layout(self.version);
        let words = self.read_words(va.as_u64(), layout.len() as u64)?;
        Ok(Il2CppCodeRegistration {
            fields: layout.into_iter().zip(words).collect(),
        })
    }

    fn read_code_gen_modules(&self, code: &Il2CppCodeRegistration) -> Result<IndexMap<String, Vec<u64>>> {
        let modules = self.read_words(
            code.get(CodeRegistrationField::CodeGenModules),
            code.get(CodeRegistrationField::CodeGenModulesCount),
        )?;

        let mut tables = IndexMap::with_capacity(modules.len());
        for module_va in modules {
            let module = self.read_code_gen_module(module_va)?;
            let pointers = self
                .read_words(module.method_pointers, module.method_pointer_count)
                .unwrap_or_else(|e| {
                    warn!("Unreadable method pointers for {}: {}", module.module_name, e);
                    vec![0; module.method_pointer_count as usize]
                });
            tables.insert(module.module_name, pointers);
        }
        Ok(tables)
    }

    fn read_code_gen_module(&self, va: u64) -> Result<Il2CppCodeGenModule> {
        let words = self.read_words(va, 3)?;
        let module_name = self
            .file()
            .read_string_va(Address::new(words[0]), MAX_MODULE_NAME)?;
        Ok(Il2CppCodeGenModule {
            module_name,
            // uint32_t followed by padding on 64-bit targets
            method_pointer_count: words[1] & 0xFFFF_FFFF,
            method_pointers: words[2],
        })
    }

    /// Pointer-sized word at a virtual address
    pub fn read_word(&self, va: u64) -> Result<u64> {
        let p = self.pointer_size();
        let bytes = self.file().read_va(Address::new(va), p)?;
        Ok(BinaryReader::new(bytes, true).read_pointer(p)?)
    }

    /// `count` consecutive pointer-sized words at a virtual address
    pub fn read_words(&self, va: u64, count: u64) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let p = self.pointer_size();
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(p))
            .ok_or_else(|| Error::registration(format!("Table of {} pointers at {:#x} is too large", count, va)))?;
        let bytes = self.file().read_va(Address::new(va), len)?;
        let mut reader = BinaryReader::new(bytes, true);
        (0..count).map(|_| Ok(reader.read_pointer(p)?)).collect()
    }

    /// Read an `Il2CppType` record
    pub fn read_type_at(&self, va: u64) -> Result<Il2CppType> {
        let p = self.pointer_size();
        let bytes = self.file().read_va(Address::new(va), p + 4)?;
        let mut reader = BinaryReader::new(bytes, true);
        Ok(Il2CppType {
            datapoint: reader.read_pointer(p)?,
            bits: reader.read_u32()?,
        })
    }
}

impl RegistrationSearch for Il2CppImage {
    fn format(&self) -> BinaryFormat {
        Il2CppImage::format(self)
    }

    fn plus_search(&mut self, counts: &SearchCounts) -> Result<bool> {
        Il2CppImage::plus_search(self, counts)
    }

    fn search(&mut self) -> Result<bool> {
        Il2CppImage::search(self)
    }

    fn symbol_search(&mut self) -> Result<bool> {
        Il2CppImage::symbol_search(self)
    }

    fn init(&mut self, code_registration: Address, metadata_registration: Address) -> Result<()> {
        Il2CppImage::init(self, code_registration, metadata_registration)
    }
}
