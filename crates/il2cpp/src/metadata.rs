//! IL2CPP global-metadata.dat parser

use crate::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use ilrecover_core::{Address, Error, Result};
use std::io::{self, Cursor};
use tracing::{debug, info};

/// Parsed IL2CPP metadata
pub struct Metadata {
    /// Raw metadata bytes
    data: Vec<u8>,
    /// Metadata header
    pub header: Il2CppGlobalMetadataHeader,
    /// Effective metadata version, including the inferred 24.x revision
    pub version: Version,
    /// Load address of the blob in a dumped process, resolved by the linker
    image_base: Address,
    pub type_definitions: Vec<Il2CppTypeDefinition>,
    pub method_definitions: Vec<Il2CppMethodDefinition>,
    pub field_definitions: Vec<Il2CppFieldDefinition>,
    pub parameter_definitions: Vec<Il2CppParameterDefinition>,
    pub property_definitions: Vec<Il2CppPropertyDefinition>,
    pub image_definitions: Vec<Il2CppImageDefinition>,
    pub interfaces: Vec<i32>,
    pub metadata_usage_pairs: Vec<Il2CppMetadataUsagePair>,
}

impl Metadata {
    /// Parse IL2CPP metadata from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::parse("Metadata too small"));
        }

        let mut cursor = Cursor::new(data);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != METADATA_MAGIC {
            return Err(Error::InvalidMagic {
                expected: METADATA_MAGIC,
                actual: magic,
            });
        }

        let raw_version = cursor.read_u32::<LittleEndian>()?;
        if !(MIN_METADATA_VERSION..=MAX_METADATA_VERSION).contains(&raw_version) {
            return Err(Error::UnsupportedVersion(raw_version));
        }

        let mut version = Version::from(raw_version);
        let mut header = Self::read_header(data, version)?;

        if raw_version == 24 {
            if header.table(tables::STRING_LITERAL).offset == 264 {
                version = Version::new(24, 2);
                header = Self::read_header(data, version)?;
            } else {
                let images = Self::read_image_definitions(data, &header, version)?;
                if images.iter().any(|image| image.token != 1) {
                    version = Version::new(24, 1);
                }
            }
        }

        info!("Metadata Version: {}", version);

        let type_definitions = Self::read_type_definitions(data, &header, version)?;
        let method_definitions = Self::read_method_definitions(data, &header, version)?;
        let field_definitions = Self::read_field_definitions(data, &header, version)?;
        let parameter_definitions = Self::read_parameter_definitions(data, &header, version)?;
        let property_definitions = Self::read_property_definitions(data, &header, version)?;
        let image_definitions = Self::read_image_definitions(data, &header, version)?;
        let interfaces = read_rows(data, header.table(tables::INTERFACES), 4, |c| {
            c.read_i32::<LittleEndian>()
        })?;
        let metadata_usage_pairs = read_rows(data, header.table(tables::METADATA_USAGE_PAIRS), 8, |c| {
            Ok(Il2CppMetadataUsagePair {
                destination_index: c.read_u32::<LittleEndian>()?,
                encoded_source_index: c.read_u32::<LittleEndian>()?,
            })
        })?;

        info!(
            "Parsed {} images, {} types, {} methods, {} fields",
            image_definitions.len(),
            type_definitions.len(),
            method_definitions.len(),
            field_definitions.len()
        );

        Ok(Self {
            data: data.to_vec(),
            header,
            version,
            image_base: Address::ZERO,
            type_definitions,
            method_definitions,
            field_definitions,
            parameter_definitions,
            property_definitions,
            image_definitions,
            interfaces,
            metadata_usage_pairs,
        })
    }

    fn read_header(data: &[u8], version: Version) -> Result<Il2CppGlobalMetadataHeader> {
        let mut cursor = Cursor::new(data);
        let mut header = Il2CppGlobalMetadataHeader {
            sanity: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u32::<LittleEndian>()?,
            ..Default::default()
        };

        for name in header_tables(version) {
            let offset = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            header.tables.insert(name, TableRange { offset, size });
        }

        debug!("Header parsed with {} tables", header.tables.len());
        Ok(header)
    }

    fn read_type_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppTypeDefinition>> {
        let range = header.table(tables::TYPE_DEFINITIONS);
        read_rows(data, range, Il2CppTypeDefinition::size(version), |c| {
            let mut def = Il2CppTypeDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                namespace_index: c.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            if version <= Version::new(24, 0) {
                def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
            }
            def.byval_type_index = c.read_i32::<LittleEndian>()?;
            if version < Version::new(27, 0) {
                def.byref_type_index = c.read_i32::<LittleEndian>()?;
            }
            def.declaring_type_index = c.read_i32::<LittleEndian>()?;
            def.parent_index = c.read_i32::<LittleEndian>()?;
            def.element_type_index = c.read_i32::<LittleEndian>()?;
            if version <= Version::new(24, 1) {
                def.rgctx_start_index = c.read_i32::<LittleEndian>()?;
                def.rgctx_count = c.read_i32::<LittleEndian>()?;
            }
            def.generic_container_index = c.read_i32::<LittleEndian>()?;
            def.flags = c.read_u32::<LittleEndian>()?;
            def.field_start = c.read_i32::<LittleEndian>()?;
            def.method_start = c.read_i32::<LittleEndian>()?;
            def.event_start = c.read_i32::<LittleEndian>()?;
            def.property_start = c.read_i32::<LittleEndian>()?;
            def.nested_types_start = c.read_i32::<LittleEndian>()?;
            def.interfaces_start = c.read_i32::<LittleEndian>()?;
            def.vtable_start = c.read_i32::<LittleEndian>()?;
            def.interface_offsets_start = c.read_i32::<LittleEndian>()?;
            def.method_count = c.read_u16::<LittleEndian>()?;
            def.property_count = c.read_u16::<LittleEndian>()?;
            def.field_count = c.read_u16::<LittleEndian>()?;
            def.event_count = c.read_u16::<LittleEndian>()?;
            def.nested_types_count = c.read_u16::<LittleEndian>()?;
            def.vtable_count = c.read_u16::<LittleEndian>()?;
            def.interfaces_count = c.read_u16::<LittleEndian>()?;
            def.interface_offsets_count = c.read_u16::<LittleEndian>()?;
            def.bitfield = c.read_u32::<LittleEndian>()?;
            def.token = c.read_u32::<LittleEndian>()?;
            Ok(def)
        })
    }

    fn read_method_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppMethodDefinition>> {
        let range = header.table(tables::METHODS);
        read_rows(data, range, Il2CppMethodDefinition::size(version), |c| {
            let mut def = Il2CppMethodDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                declaring_type: c.read_i32::<LittleEndian>()?,
                return_type: c.read_i32::<LittleEndian>()?,
                ..Default::default()
            };
            if version >= Version::new(31, 0) {
                def.return_parameter_token = c.read_i32::<LittleEndian>()?;
            }
            def.parameter_start = c.read_i32::<LittleEndian>()?;
            if version <= Version::new(24, 0) {
                def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
            }
            def.generic_container_index = c.read_i32::<LittleEndian>()?;
            if Il2CppMethodDefinition::has_method_index(version) {
                def.method_index = c.read_i32::<LittleEndian>()?;
                def.invoker_index = c.read_i32::<LittleEndian>()?;
                def.delegate_wrapper_index = c.read_i32::<LittleEndian>()?;
                def.rgctx_start_index = c.read_i32::<LittleEndian>()?;
                def.rgctx_count = c.read_i32::<LittleEndian>()?;
            }
            def.token = c.read_u32::<LittleEndian>()?;
            def.flags = c.read_u16::<LittleEndian>()?;
            def.iflags = c.read_u16::<LittleEndian>()?;
            def.slot = c.read_u16::<LittleEndian>()?;
            def.parameter_count = c.read_u16::<LittleEndian>()?;
            Ok(def)
        })
    }

    fn read_field_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppFieldDefinition>> {
        let range = header.table(tables::FIELDS);
        read_rows(data, range, Il2CppFieldDefinition::size(version), |c| {
            let mut def = Il2CppFieldDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                type_index: c.read_i32::<LittleEndian>()?,
                ..Default::default()
            };
            if version <= Version::new(24, 0) {
                def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
            }
            def.token = c.read_u32::<LittleEndian>()?;
            Ok(def)
        })
    }

    fn read_parameter_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppParameterDefinition>> {
        let range = header.table(tables::PARAMETERS);
        read_rows(data, range, Il2CppParameterDefinition::size(version), |c| {
            let mut def = Il2CppParameterDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                token: c.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            if version <= Version::new(24, 0) {
                def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
            }
            def.type_index = c.read_i32::<LittleEndian>()?;
            Ok(def)
        })
    }

    fn read_property_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppPropertyDefinition>> {
        let range = header.table(tables::PROPERTIES);
        read_rows(data, range, Il2CppPropertyDefinition::size(version), |c| {
            let mut def = Il2CppPropertyDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                get: c.read_i32::<LittleEndian>()?,
                set: c.read_i32::<LittleEndian>()?,
                attrs: c.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            if version <= Version::new(24, 0) {
                def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
            }
            def.token = c.read_u32::<LittleEndian>()?;
            Ok(def)
        })
    }

    fn read_image_definitions(
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: Version,
    ) -> Result<Vec<Il2CppImageDefinition>> {
        let range = header.table(tables::IMAGES);
        read_rows(data, range, Il2CppImageDefinition::size(version), |c| {
            let mut def = Il2CppImageDefinition {
                name_index: c.read_u32::<LittleEndian>()?,
                assembly_index: c.read_i32::<LittleEndian>()?,
                type_start: c.read_i32::<LittleEndian>()?,
                type_count: c.read_u32::<LittleEndian>()?,
                exported_type_start: c.read_i32::<LittleEndian>()?,
                exported_type_count: c.read_u32::<LittleEndian>()?,
                entry_point_index: c.read_i32::<LittleEndian>()?,
                token: c.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            if version >= Version::new(24, 1) {
                def.custom_attribute_start = c.read_i32::<LittleEndian>()?;
                def.custom_attribute_count = c.read_u32::<LittleEndian>()?;
            }
            Ok(def)
        })
    }

    /// Get a string from the string table
    pub fn get_string(&self, index: u32) -> Option<&str> {
        let range = self.header.table(tables::STRING);
        if index >= range.size {
            return None;
        }
        let start = range.offset as usize + index as usize;
        let end = (range.offset + range.size) as usize;
        let bytes = self.data.get(start..end.min(self.data.len()))?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..len]).ok()
    }

    /// Number of methods that own a compiled body
    pub fn defined_method_count(&self) -> usize {
        if Il2CppMethodDefinition::has_method_index(self.version) {
            self.method_definitions
                .iter()
                .filter(|m| m.method_index >= 0)
                .count()
        } else {
            self.method_definitions.len()
        }
    }

    /// Highest metadata usage slot plus one, zero when the table is absent
    pub fn metadata_usages_count(&self) -> u64 {
        self.metadata_usage_pairs
            .iter()
            .map(|pair| pair.destination_index as u64 + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn type_definition_size(&self) -> usize {
        Il2CppTypeDefinition::size(self.version)
    }

    pub fn image_base(&self) -> Address {
        self.image_base
    }

    pub(crate) fn set_image_base(&mut self, image_base: Address) {
        self.image_base = image_base;
    }

    /// Fully qualified name of a type definition
    pub fn type_definition_name(&self, index: usize) -> Option<String> {
        let type_def = self.type_definitions.get(index)?;
        let name = self.get_string(type_def.name_index)?;
        let namespace = self.get_string(type_def.namespace_index).unwrap_or("");
        Some(if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", namespace, name)
        })
    }
}

/// Read a table of fixed-size rows, ignoring a trailing partial row
fn read_rows<T>(
    data: &[u8],
    range: TableRange,
    row_size: usize,
    mut parse: impl FnMut(&mut Cursor<&[u8]>) -> io::Result<T>,
) -> Result<Vec<T>> {
    let count = range.size as usize / row_size;
    let start = range.offset as usize;
    let end = start + count * row_size;
    if end > data.len() {
        return Err(Error::parse(format!(
            "Metadata table at {:#x} runs past the end of the file",
            start
        )));
    }

    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let pos = start + i * row_size;
        let mut cursor = Cursor::new(&data[pos..pos + row_size]);
        rows.push(parse(&mut cursor)?);
    }
    Ok(rows)
}
