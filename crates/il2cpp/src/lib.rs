//! IL2CPP registration recovery
//!
//! This crate reads the global metadata blob, locates the code and metadata
//! registrations inside the compiled binary, links the two and hands the
//! result to an assembly writer.

pub mod types;
pub mod metadata;
pub mod image;
pub mod section_helper;
pub mod search;
pub mod locator;
pub mod dump;
pub mod linker;
pub mod session;
pub mod executor;
pub mod synthesizer;
pub mod writer;
pub mod output;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::Executor;
pub use image::Il2CppImage;
pub use locator::{RegistrationLocator, Strategy};
pub use metadata::Metadata;
pub use output::RecoveryReport;
pub use session::{initialize, parse_hex_address, Operator, PendingInput, Prompt, Recovery, Reply, Session, Step};
pub use synthesizer::{AssemblyModel, AssemblyWriter, Synthesizer};
pub use writer::SkeletonWriter;

use ilrecover_core::{Config, Result};

/// Recover and synthesize in one call, answering prompts through `operator`
pub fn recover(
    binary: &[u8],
    metadata: &[u8],
    config: &Config,
    operator: &mut dyn Operator,
) -> Result<RecoveryReport> {
    let recovery = initialize(binary, metadata, config, operator)?;
    let assemblies = Synthesizer::new(SkeletonWriter, config).synthesize(&recovery.metadata, &recovery.image)?;
    Ok(RecoveryReport::new(&recovery, assemblies))
}
