//! Execution context over a linked metadata/image pair

use crate::image::Il2CppImage;
use crate::metadata::Metadata;
use crate::types::*;
use tracing::debug;

/// Runtime-type records nest at most this deep before names give up
const MAX_TYPE_DEPTH: usize = 8;

/// Read-only lookups shared by assembly writers
pub struct Executor<'a> {
    metadata: &'a Metadata,
    image: &'a Il2CppImage,
}

impl<'a> Executor<'a> {
    pub fn new(metadata: &'a Metadata, image: &'a Il2CppImage) -> Self {
        Self { metadata, image }
    }

    pub fn metadata(&self) -> &'a Metadata {
        self.metadata
    }

    pub fn image(&self) -> &'a Il2CppImage {
        self.image
    }

    /// Runtime type at a metadata type index
    pub fn runtime_type(&self, index: i32) -> Option<&'a Il2CppType> {
        self.image.types().get(usize::try_from(index).ok()?)
    }

    /// Type definition a class or value type refers to.
    ///
    /// Dumped images from 27 on hold the address of the definition inside the
    /// loaded metadata; everything else holds the index.
    pub fn type_definition_index(&self, ty: &Il2CppType) -> Option<usize> {
        if self.image.version() >= Version::new(27, 0) && self.image.is_dumped() {
            let start = self.metadata.image_base().as_u64()
                + self.metadata.header.type_definitions_offset() as u64;
            let offset = ty.datapoint.checked_sub(start)?;
            let size = self.metadata.type_definition_size() as u64;
            if offset % size != 0 {
                debug!("Type handle {:#x} is not aligned to a definition", ty.datapoint);
                return None;
            }
            usize::try_from(offset / size).ok()
        } else {
            usize::try_from(ty.klass_index()).ok()
        }
    }

    /// Display name of a runtime type
    pub fn type_name(&self, ty: &Il2CppType) -> String {
        self.type_name_at_depth(ty, 0)
    }

    /// Display name of the runtime type at a metadata type index
    pub fn type_name_by_index(&self, index: i32) -> String {
        match self.runtime_type(index) {
            Some(ty) => self.type_name(ty),
            None => format!("Type_{}", index),
        }
    }

    fn type_name_at_depth(&self, ty: &Il2CppType, depth: usize) -> String {
        let kind = ty.type_enum();
        if let Some(name) = primitive_name(kind) {
            return name.to_string();
        }

        match kind {
            type_enum::CLASS | type_enum::VALUETYPE => self
                .type_definition_index(ty)
                .and_then(|index| self.metadata.type_definition_name(index))
                .unwrap_or_else(|| format!("Type_{:#x}", ty.datapoint)),
            type_enum::SZARRAY | type_enum::PTR if depth < MAX_TYPE_DEPTH => {
                let suffix = if kind == type_enum::SZARRAY { "[]" } else { "*" };
                match self.image.read_type_at(ty.datapoint) {
                    Ok(element) => format!("{}{}", self.type_name_at_depth(&element, depth + 1), suffix),
                    Err(e) => {
                        debug!("Unreadable element type at {:#x}: {}", ty.datapoint, e);
                        format!("Type_{:#x}{}", ty.datapoint, suffix)
                    }
                }
            }
            _ => format!("Type_{:#x}", kind),
        }
    }

    /// Compiled body of a method declared in `image_name`, when it has one
    pub fn method_pointer(&self, method: &Il2CppMethodDefinition, image_name: &str) -> Option<u64> {
        let pointer = if self.image.version() < Version::new(24, 2) {
            let index = usize::try_from(method.method_index).ok()?;
            self.image.method_pointers().get(index).copied()
        } else {
            let rid = (method.token & 0x00FF_FFFF) as usize;
            let table = self.image.code_gen_modules().get(image_name)?;
            table.get(rid.checked_sub(1)?).copied()
        };
        pointer.filter(|&p| p != 0)
    }
}

fn primitive_name(kind: u8) -> Option<&'static str> {
    Some(match kind {
        type_enum::VOID => "void",
        type_enum::BOOLEAN => "bool",
        type_enum::CHAR => "char",
        type_enum::I1 => "sbyte",
        type_enum::U1 => "byte",
        type_enum::I2 => "short",
        type_enum::U2 => "ushort",
        type_enum::I4 => "int",
        type_enum::U4 => "uint",
        type_enum::I8 => "long",
        type_enum::U8 => "ulong",
        type_enum::R4 => "float",
        type_enum::R8 => "double",
        type_enum::STRING => "string",
        type_enum::TYPEDBYREF => "TypedReference",
        type_enum::I => "IntPtr",
        type_enum::U => "UIntPtr",
        type_enum::OBJECT => "object",
        _ => return None,
    })
}
