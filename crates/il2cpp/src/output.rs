//! JSON report of a finished recovery

use crate::locator::Strategy;
use crate::session::Recovery;
use crate::synthesizer::AssemblyModel;
use chrono::{DateTime, Utc};
use ilrecover_core::{Address, BinaryFormat, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// File name the report is written under inside an output directory
pub const REPORT_FILE_NAME: &str = "assemblies.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub generated_at: DateTime<Utc>,
    pub il2cpp_version: String,
    pub format: BinaryFormat,
    pub strategy: Strategy,
    pub code_registration: Address,
    pub metadata_registration: Address,
    pub image_base: Address,
    pub metadata_image_base: Address,
    pub assemblies: Vec<AssemblyModel>,
}

impl RecoveryReport {
    pub fn new(recovery: &Recovery, assemblies: Vec<AssemblyModel>) -> Self {
        Self {
            generated_at: Utc::now(),
            il2cpp_version: recovery.image.version().to_string(),
            format: recovery.image.format(),
            strategy: recovery.strategy,
            code_registration: recovery.image.code_registration_address(),
            metadata_registration: recovery.image.metadata_registration_address(),
            image_base: recovery.image.image_base(),
            metadata_image_base: recovery.metadata.image_base(),
            assemblies,
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        json.map_err(|e| Error::parse(e.to_string()))
    }

    /// Write to JSON file
    pub fn write_to_file(&self, path: &Path, pretty: bool) -> Result<()> {
        std::fs::write(path, self.to_json(pretty)?)?;
        info!("Wrote {} assemblies to {:?}", self.assemblies.len(), path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| Error::parse(e.to_string()))
    }
}
