//! Dump address resolution for images captured from process memory

use crate::image::Il2CppImage;
use ilrecover_core::{Address, Result};
use tracing::info;

/// Result of checking an image for dump layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpCheck {
    /// A file-backed image; nothing to do
    NotDumped,
    /// A segment-based dump; the operator must supply its load address
    NeedsBase,
    /// A dump of a format without a file/virtual split, already marked
    MarkedDumped,
}

/// Check the image for dump layout, marking it dumped where no base is needed
pub fn check(image: &mut Il2CppImage) -> DumpCheck {
    if !image.check_dump() {
        return DumpCheck::NotDumped;
    }

    info!("Detected this may be a dump file.");
    if image.supports_reload() {
        DumpCheck::NeedsBase
    } else {
        image.set_dumped(true);
        DumpCheck::MarkedDumped
    }
}

/// Apply an operator-supplied load address. Zero leaves the image as is.
pub fn apply_base(image: &mut Il2CppImage, base: Address) -> Result<()> {
    if base.is_null() {
        info!("No dump address supplied, continuing without adjustment");
        return Ok(());
    }

    info!("Dump address: {}", base);
    image.reload(base)?;
    image.set_dumped(true);
    Ok(())
}
