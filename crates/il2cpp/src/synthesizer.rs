//! Assembly synthesis boundary: hands the linked pair to an assembly writer
//! and fixes up the module names it produced

use crate::executor::Executor;
use crate::image::Il2CppImage;
use crate::metadata::Metadata;
use ilrecover_core::{Config, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One recovered managed assembly
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyModel {
    pub name: String,
    /// File name of the primary module
    pub module_name: String,
    pub types: Vec<TypeModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeModel {
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub token: u32,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub is_value_type: bool,
    pub is_enum: bool,
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_sealed: bool,
    pub fields: Vec<FieldModel>,
    pub properties: Vec<PropertyModel>,
    pub methods: Vec<MethodModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldModel {
    pub name: String,
    pub type_name: String,
    pub token: u32,
    pub is_static: bool,
    pub is_literal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyModel {
    pub name: String,
    pub type_name: Option<String>,
    pub getter: Option<String>,
    pub setter: Option<String>,
    pub token: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodModel {
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<ParameterModel>,
    pub token: u32,
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_abstract: bool,
    /// Entry point of the compiled body, absent for abstract or stripped methods
    pub address: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterModel {
    pub name: String,
    pub type_name: String,
}

/// Produces assembly models from an execution context
pub trait AssemblyWriter {
    fn write(&self, executor: &Executor<'_>) -> Result<Vec<AssemblyModel>>;
}

/// Append `extension` to the module name unless it already ends with it.
/// Returns whether the name changed.
pub fn ensure_module_extension(assembly: &mut AssemblyModel, extension: &str) -> bool {
    if extension.is_empty() || assembly.module_name.ends_with(extension) {
        return false;
    }
    let fixed = format!("{}{}", assembly.module_name, extension);
    warn!("Module name {} lacks {}, renamed to {}", assembly.module_name, extension, fixed);
    assembly.module_name = fixed;
    true
}

pub struct Synthesizer<W> {
    writer: W,
    module_extension: String,
}

impl<W: AssemblyWriter> Synthesizer<W> {
    pub fn new(writer: W, config: &Config) -> Self {
        Self {
            writer,
            module_extension: config.module_extension.clone(),
        }
    }

    /// Run the writer over the linked pair. Any fault is a session failure.
    pub fn synthesize(&self, metadata: &Metadata, image: &Il2CppImage) -> Result<Vec<AssemblyModel>> {
        let executor = Executor::new(metadata, image);
        let mut assemblies = self
            .writer
            .write(&executor)
            .map_err(crate::session::fail)?;
        for assembly in &mut assemblies {
            ensure_module_extension(assembly, &self.module_extension);
        }
        info!("Synthesized {} assemblies", assemblies.len());
        Ok(assemblies)
    }
}
