//! Metadata linker: resolves where a dumped process had the metadata blob
//! loaded, from the type handles its runtime types point at

use crate::image::Il2CppImage;
use crate::metadata::Metadata;
use crate::types::Version;
use ilrecover_core::{Address, Error, Result};
use tracing::{debug, info};

/// First version whose runtime types reference definitions by address
pub const TYPE_HANDLE_VERSION: Version = Version::new(27, 0);

/// Whether linking applies to an image
pub fn needs_link(image: &Il2CppImage) -> bool {
    image.version() >= TYPE_HANDLE_VERSION && image.is_dumped()
}

/// Metadata load address given the handle of the first type definition
pub fn resolve_metadata_base(type_handle: u64, type_definitions_offset: u32) -> Result<Address> {
    type_handle
        .checked_sub(type_definitions_offset as u64)
        .map(Address::new)
        .ok_or_else(|| {
            Error::link(format!(
                "Type handle {:#x} lies below the type definitions offset {:#x}",
                type_handle, type_definitions_offset
            ))
        })
}

/// Set `metadata`'s image base when the image needs it. Returns whether it ran.
pub fn link(metadata: &mut Metadata, image: &Il2CppImage) -> Result<bool> {
    if !needs_link(image) {
        debug!(
            "Metadata link skipped (version {}, dumped {})",
            image.version(),
            image.is_dumped()
        );
        return Ok(false);
    }

    let first = metadata
        .type_definitions
        .first()
        .ok_or_else(|| Error::link("Metadata has no type definitions"))?;
    let index = usize::try_from(first.byval_type_index)
        .map_err(|_| Error::link(format!("Invalid byval type index {}", first.byval_type_index)))?;
    let ty = image
        .types()
        .get(index)
        .ok_or_else(|| Error::link(format!("Runtime type {} is missing", index)))?;

    let base = resolve_metadata_base(ty.datapoint, metadata.header.type_definitions_offset())?;
    info!("Metadata image base: {}", base);
    metadata.set_image_base(base);
    Ok(true)
}
