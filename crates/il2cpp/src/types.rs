//! IL2CPP structure definitions
//!
//! These structures mirror the IL2CPP runtime metadata format. Layouts move
//! between releases, so every reader takes the effective [`Version`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// IL2CPP metadata magic number
pub const METADATA_MAGIC: u32 = 0xFAB11BAF;

/// Supported metadata versions
pub const MIN_METADATA_VERSION: u32 = 24;
pub const MAX_METADATA_VERSION: u32 = 31;

/// Effective il2cpp version, e.g. `24.2` or `27.1`.
///
/// The minor revision is never stored in the metadata blob; it is inferred
/// from table layouts and from the registration structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl From<u32> for Version {
    fn from(major: u32) -> Self {
        Self::new(major, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

/// Offset and byte size of one metadata table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRange {
    pub offset: u32,
    pub size: u32,
}

/// Global metadata header, as an ordered set of table ranges
#[derive(Debug, Clone, Default)]
pub struct Il2CppGlobalMetadataHeader {
    pub sanity: u32,
    pub version: u32,
    pub tables: IndexMap<&'static str, TableRange>,
}

impl Il2CppGlobalMetadataHeader {
    /// Range of a table, empty when this version has no such table
    pub fn table(&self, name: &str) -> TableRange {
        self.tables.get(name).copied().unwrap_or_default()
    }

    pub fn type_definitions_offset(&self) -> u32 {
        self.table(tables::TYPE_DEFINITIONS).offset
    }
}

/// Metadata table names in header order
pub mod tables {
    pub const STRING_LITERAL: &str = "stringLiteral";
    pub const STRING_LITERAL_DATA: &str = "stringLiteralData";
    pub const STRING: &str = "string";
    pub const EVENTS: &str = "events";
    pub const PROPERTIES: &str = "properties";
    pub const METHODS: &str = "methods";
    pub const PARAMETER_DEFAULT_VALUES: &str = "parameterDefaultValues";
    pub const FIELD_DEFAULT_VALUES: &str = "fieldDefaultValues";
    pub const FIELD_AND_PARAMETER_DEFAULT_VALUE_DATA: &str = "fieldAndParameterDefaultValueData";
    pub const FIELD_MARSHALED_SIZES: &str = "fieldMarshaledSizes";
    pub const PARAMETERS: &str = "parameters";
    pub const FIELDS: &str = "fields";
    pub const GENERIC_PARAMETERS: &str = "genericParameters";
    pub const GENERIC_PARAMETER_CONSTRAINTS: &str = "genericParameterConstraints";
    pub const GENERIC_CONTAINERS: &str = "genericContainers";
    pub const NESTED_TYPES: &str = "nestedTypes";
    pub const INTERFACES: &str = "interfaces";
    pub const VTABLE_METHODS: &str = "vtableMethods";
    pub const INTERFACE_OFFSETS: &str = "interfaceOffsets";
    pub const TYPE_DEFINITIONS: &str = "typeDefinitions";
    pub const RGCTX_ENTRIES: &str = "rgctxEntries";
    pub const IMAGES: &str = "images";
    pub const ASSEMBLIES: &str = "assemblies";
    pub const METADATA_USAGE_LISTS: &str = "metadataUsageLists";
    pub const METADATA_USAGE_PAIRS: &str = "metadataUsagePairs";
    pub const FIELD_REFS: &str = "fieldRefs";
    pub const REFERENCED_ASSEMBLIES: &str = "referencedAssemblies";
    pub const ATTRIBUTES_INFO: &str = "attributesInfo";
    pub const ATTRIBUTE_TYPES: &str = "attributeTypes";
    pub const ATTRIBUTE_DATA: &str = "attributeData";
    pub const ATTRIBUTE_DATA_RANGE: &str = "attributeDataRange";
    pub const UNRESOLVED_VIRTUAL_CALL_PARAMETER_TYPES: &str = "unresolvedVirtualCallParameterTypes";
    pub const UNRESOLVED_VIRTUAL_CALL_PARAMETER_RANGES: &str = "unresolvedVirtualCallParameterRanges";
    pub const WINDOWS_RUNTIME_TYPE_NAMES: &str = "windowsRuntimeTypeNames";
    pub const WINDOWS_RUNTIME_STRINGS: &str = "windowsRuntimeStrings";
    pub const EXPORTED_TYPE_DEFINITIONS: &str = "exportedTypeDefinitions";
}

/// Tables present in the header of the given version, in file order
pub fn header_tables(version: Version) -> Vec<&'static str> {
    use tables::*;

    let mut names = vec![
        STRING_LITERAL,
        STRING_LITERAL_DATA,
        STRING,
        EVENTS,
        PROPERTIES,
        METHODS,
        PARAMETER_DEFAULT_VALUES,
        FIELD_DEFAULT_VALUES,
        FIELD_AND_PARAMETER_DEFAULT_VALUE_DATA,
        FIELD_MARSHALED_SIZES,
        PARAMETERS,
        FIELDS,
        GENERIC_PARAMETERS,
        GENERIC_PARAMETER_CONSTRAINTS,
        GENERIC_CONTAINERS,
        NESTED_TYPES,
        INTERFACES,
        VTABLE_METHODS,
        INTERFACE_OFFSETS,
        TYPE_DEFINITIONS,
    ];
    if version <= Version::new(24, 1) {
        names.push(RGCTX_ENTRIES);
    }
    names.extend([IMAGES, ASSEMBLIES]);
    if version.major == 24 {
        names.extend([METADATA_USAGE_LISTS, METADATA_USAGE_PAIRS]);
    }
    names.extend([FIELD_REFS, REFERENCED_ASSEMBLIES]);
    if version < Version::new(29, 0) {
        names.extend([ATTRIBUTES_INFO, ATTRIBUTE_TYPES]);
    } else {
        names.extend([ATTRIBUTE_DATA, ATTRIBUTE_DATA_RANGE]);
    }
    names.extend([
        UNRESOLVED_VIRTUAL_CALL_PARAMETER_TYPES,
        UNRESOLVED_VIRTUAL_CALL_PARAMETER_RANGES,
        WINDOWS_RUNTIME_TYPE_NAMES,
    ]);
    if version >= Version::new(27, 0) {
        names.push(WINDOWS_RUNTIME_STRINGS);
    }
    names.push(EXPORTED_TYPE_DEFINITIONS);
    names
}

/// Type definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppTypeDefinition {
    pub name_index: u32,
    pub namespace_index: u32,
    pub custom_attribute_index: i32,
    pub byval_type_index: i32,
    pub byref_type_index: i32,
    pub declaring_type_index: i32,
    pub parent_index: i32,
    pub element_type_index: i32,
    pub rgctx_start_index: i32,
    pub rgctx_count: i32,
    pub generic_container_index: i32,
    pub flags: u32,
    pub field_start: i32,
    pub method_start: i32,
    pub event_start: i32,
    pub property_start: i32,
    pub nested_types_start: i32,
    pub interfaces_start: i32,
    pub vtable_start: i32,
    pub interface_offsets_start: i32,
    pub method_count: u16,
    pub property_count: u16,
    pub field_count: u16,
    pub event_count: u16,
    pub nested_types_count: u16,
    pub vtable_count: u16,
    pub interfaces_count: u16,
    pub interface_offsets_count: u16,
    pub bitfield: u32,
    pub token: u32,
}

impl Il2CppTypeDefinition {
    pub fn size(version: Version) -> usize {
        if version >= Version::new(27, 0) {
            88
        } else if version >= Version::new(24, 2) {
            92
        } else if version >= Version::new(24, 1) {
            100
        } else {
            104
        }
    }

    pub fn is_value_type(&self) -> bool {
        self.bitfield & 0x1 != 0
    }

    pub fn is_enum(&self) -> bool {
        self.bitfield & 0x2 != 0
    }
}

/// Method definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppMethodDefinition {
    pub name_index: u32,
    pub declaring_type: i32,
    pub return_type: i32,
    pub return_parameter_token: i32,
    pub parameter_start: i32,
    pub custom_attribute_index: i32,
    pub generic_container_index: i32,
    pub method_index: i32,
    pub invoker_index: i32,
    pub delegate_wrapper_index: i32,
    pub rgctx_start_index: i32,
    pub rgctx_count: i32,
    pub token: u32,
    pub flags: u16,
    pub iflags: u16,
    pub slot: u16,
    pub parameter_count: u16,
}

impl Il2CppMethodDefinition {
    pub fn size(version: Version) -> usize {
        if version >= Version::new(31, 0) {
            36
        } else if version >= Version::new(24, 2) {
            32
        } else if version >= Version::new(24, 1) {
            52
        } else {
            56
        }
    }

    /// Whether this layout still carries a global method index
    pub fn has_method_index(version: Version) -> bool {
        version <= Version::new(24, 1)
    }
}

/// Field definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppFieldDefinition {
    pub name_index: u32,
    pub type_index: i32,
    pub custom_attribute_index: i32,
    pub token: u32,
}

impl Il2CppFieldDefinition {
    pub fn size(version: Version) -> usize {
        if version <= Version::new(24, 0) {
            16
        } else {
            12
        }
    }
}

/// Parameter definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppParameterDefinition {
    pub name_index: u32,
    pub token: u32,
    pub custom_attribute_index: i32,
    pub type_index: i32,
}

impl Il2CppParameterDefinition {
    pub fn size(version: Version) -> usize {
        if version <= Version::new(24, 0) {
            16
        } else {
            12
        }
    }
}

/// Property definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppPropertyDefinition {
    pub name_index: u32,
    pub get: i32,
    pub set: i32,
    pub attrs: u32,
    pub custom_attribute_index: i32,
    pub token: u32,
}

impl Il2CppPropertyDefinition {
    pub fn size(version: Version) -> usize {
        if version <= Version::new(24, 0) {
            24
        } else {
            20
        }
    }
}

/// Image definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppImageDefinition {
    pub name_index: u32,
    pub assembly_index: i32,
    pub type_start: i32,
    pub type_count: u32,
    pub exported_type_start: i32,
    pub exported_type_count: u32,
    pub entry_point_index: i32,
    pub token: u32,
    pub custom_attribute_start: i32,
    pub custom_attribute_count: u32,
}

impl Il2CppImageDefinition {
    pub fn size(version: Version) -> usize {
        if version <= Version::new(24, 0) {
            32
        } else {
            40
        }
    }
}

/// Metadata usage pair (24.x only)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Il2CppMetadataUsagePair {
    pub destination_index: u32,
    pub encoded_source_index: u32,
}

/// Word-sized fields of the code registration, in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeRegistrationField {
    MethodPointersCount,
    MethodPointers,
    ReversePInvokeWrapperCount,
    ReversePInvokeWrappers,
    GenericMethodPointersCount,
    GenericMethodPointers,
    GenericAdjustorThunks,
    InvokerPointersCount,
    InvokerPointers,
    CustomAttributeCount,
    CustomAttributeGenerators,
    UnresolvedVirtualCallCount,
    UnresolvedVirtualCallPointers,
    UnresolvedInstanceCallPointers,
    UnresolvedStaticCallPointers,
    InteropDataCount,
    InteropData,
    WindowsRuntimeFactoryCount,
    WindowsRuntimeFactoryTable,
    CodeGenModulesCount,
    CodeGenModules,
}

impl CodeRegistrationField {
    /// Fields present in the given version, in memory order
    pub fn layout(version: Version) -> Vec<Self> {
        use CodeRegistrationField::*;

        let mut fields = Vec::with_capacity(21);
        if version <= Version::new(24, 1) {
            fields.extend([MethodPointersCount, MethodPointers]);
        }
        fields.extend([
            ReversePInvokeWrapperCount,
            ReversePInvokeWrappers,
            GenericMethodPointersCount,
            GenericMethodPointers,
        ]);
        if version == Version::new(24, 5) || version >= Version::new(27, 1) {
            fields.push(GenericAdjustorThunks);
        }
        fields.extend([InvokerPointersCount, InvokerPointers]);
        if version < Version::new(29, 0) {
            fields.extend([CustomAttributeCount, CustomAttributeGenerators]);
        }
        fields.extend([UnresolvedVirtualCallCount, UnresolvedVirtualCallPointers]);
        if version >= Version::new(29, 1) {
            fields.extend([UnresolvedInstanceCallPointers, UnresolvedStaticCallPointers]);
        }
        fields.extend([InteropDataCount, InteropData]);
        if version >= Version::new(24, 3) {
            fields.extend([WindowsRuntimeFactoryCount, WindowsRuntimeFactoryTable]);
        }
        if version >= Version::new(24, 2) {
            fields.extend([CodeGenModulesCount, CodeGenModules]);
        }
        fields
    }

    /// Word index of this field in the given version's layout
    pub fn slot(self, version: Version) -> Option<usize> {
        Self::layout(version).iter().position(|f| *f == self)
    }
}

/// Code registration structure (found in binary)
#[derive(Debug, Clone, Default)]
pub struct Il2CppCodeRegistration {
    pub fields: IndexMap<CodeRegistrationField, u64>,
}

impl Il2CppCodeRegistration {
    /// Value of a field, zero when the layout does not carry it
    pub fn get(&self, field: CodeRegistrationField) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }
}

/// Metadata registration structure (found in binary)
#[derive(Debug, Clone, Default)]
pub struct Il2CppMetadataRegistration {
    pub generic_classes_count: i64,
    pub generic_classes: u64,
    pub generic_insts_count: i64,
    pub generic_insts: u64,
    pub generic_method_table_count: i64,
    pub generic_method_table: u64,
    pub types_count: i64,
    pub types: u64,
    pub method_specs_count: i64,
    pub method_specs: u64,
    pub field_offsets_count: i64,
    pub field_offsets: u64,
    pub type_definitions_sizes_count: i64,
    pub type_definitions_sizes: u64,
    pub metadata_usages_count: u64,
    pub metadata_usages: u64,
}

impl Il2CppMetadataRegistration {
    /// Number of pointer-sized words in the structure
    pub const WORDS: usize = 16;

    pub fn from_words(words: &[u64; Self::WORDS]) -> Self {
        Self {
            generic_classes_count: words[0] as i64,
            generic_classes: words[1],
            generic_insts_count: words[2] as i64,
            generic_insts: words[3],
            generic_method_table_count: words[4] as i64,
            generic_method_table: words[5],
            types_count: words[6] as i64,
            types: words[7],
            method_specs_count: words[8] as i64,
            method_specs: words[9],
            field_offsets_count: words[10] as i64,
            field_offsets: words[11],
            type_definitions_sizes_count: words[12] as i64,
            type_definitions_sizes: words[13],
            metadata_usages_count: words[14],
            metadata_usages: words[15],
        }
    }
}

/// Per-image code generation module (24.2+), trimmed to what the recovery reads
#[derive(Debug, Clone, Default)]
pub struct Il2CppCodeGenModule {
    pub module_name: String,
    pub method_pointer_count: u64,
    pub method_pointers: u64,
}

/// Runtime type record from the metadata registration's `types` array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Il2CppType {
    /// Union of klass index, type handle and nested type pointers
    pub datapoint: u64,
    pub bits: u32,
}

impl Il2CppType {
    pub fn type_enum(&self) -> u8 {
        ((self.bits >> 16) & 0xff) as u8
    }

    pub fn attrs(&self) -> u16 {
        (self.bits & 0xffff) as u16
    }

    /// Type definition index, for layouts that store it directly
    pub fn klass_index(&self) -> i32 {
        self.datapoint as u32 as i32
    }
}

/// `Il2CppTypeEnum`
pub mod type_enum {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1b;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const MVAR: u8 = 0x1e;
}

/// Type attribute flags
pub mod type_attributes {
    pub const VISIBILITY_MASK: u32 = 0x00000007;
    pub const PUBLIC: u32 = 0x00000001;
    pub const INTERFACE: u32 = 0x00000020;
    pub const ABSTRACT: u32 = 0x00000080;
    pub const SEALED: u32 = 0x00000100;
}

/// Method attribute flags
pub mod method_attributes {
    pub const MEMBER_ACCESS_MASK: u16 = 0x0007;
    pub const PUBLIC: u16 = 0x0006;
    pub const STATIC: u16 = 0x0010;
    pub const VIRTUAL: u16 = 0x0040;
    pub const ABSTRACT: u16 = 0x0400;
}

/// Field attribute flags
pub mod field_attributes {
    pub const STATIC: u16 = 0x0010;
    pub const LITERAL: u16 = 0x0040;
}
