//! Default assembly writer: one skeleton model per image definition

use crate::executor::Executor;
use crate::metadata::Metadata;
use crate::synthesizer::*;
use crate::types::*;
use ilrecover_core::Result;
use rayon::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Builds declarations and recovered method addresses, no bodies
#[derive(Debug, Clone, Copy, Default)]
pub struct SkeletonWriter;

impl AssemblyWriter for SkeletonWriter {
    fn write(&self, executor: &Executor<'_>) -> Result<Vec<AssemblyModel>> {
        let metadata = executor.metadata();
        metadata
            .image_definitions
            .par_iter()
            .map(|image| Ok(AssemblyBuilder { executor, metadata, image }.build()))
            .collect()
    }
}

/// Rows `start..start + count` of a table, empty for a negative start
fn rows(start: i32, count: usize) -> Range<usize> {
    match usize::try_from(start) {
        Ok(start) => start..start + count,
        Err(_) => 0..0,
    }
}

struct AssemblyBuilder<'a, 'e> {
    executor: &'e Executor<'a>,
    metadata: &'a Metadata,
    image: &'a Il2CppImageDefinition,
}

impl AssemblyBuilder<'_, '_> {
    fn string(&self, index: u32) -> String {
        self.metadata.get_string(index).unwrap_or_default().to_string()
    }

    fn build(&self) -> AssemblyModel {
        let module_name = self.string(self.image.name_index);
        let name = module_name
            .strip_suffix(".dll")
            .unwrap_or(&module_name)
            .to_string();

        let types: Vec<TypeModel> = rows(self.image.type_start, self.image.type_count as usize)
            .filter_map(|index| self.metadata.type_definitions.get(index))
            .map(|def| self.type_model(def, &module_name))
            .collect();
        debug!("{}: {} types", module_name, types.len());

        AssemblyModel { name, module_name, types }
    }

    fn type_model(&self, def: &Il2CppTypeDefinition, module_name: &str) -> TypeModel {
        let namespace = self.string(def.namespace_index);
        let name = self.string(def.name_index);
        let full_name = if namespace.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", namespace, name)
        };

        let parent = (def.parent_index >= 0).then(|| self.executor.type_name_by_index(def.parent_index));
        let interfaces = rows(def.interfaces_start, def.interfaces_count as usize)
            .filter_map(|i| self.metadata.interfaces.get(i))
            .map(|&index| self.executor.type_name_by_index(index))
            .collect();

        TypeModel {
            namespace,
            name,
            full_name,
            token: def.token,
            parent,
            interfaces,
            is_value_type: def.is_value_type(),
            is_enum: def.is_enum(),
            is_interface: def.flags & type_attributes::INTERFACE != 0,
            is_abstract: def.flags & type_attributes::ABSTRACT != 0,
            is_sealed: def.flags & type_attributes::SEALED != 0,
            fields: self.fields(def),
            properties: self.properties(def),
            methods: rows(def.method_start, def.method_count as usize)
                .filter_map(|i| self.metadata.method_definitions.get(i))
                .map(|method| self.method_model(method, module_name))
                .collect(),
        }
    }

    fn fields(&self, def: &Il2CppTypeDefinition) -> Vec<FieldModel> {
        rows(def.field_start, def.field_count as usize)
            .filter_map(|i| self.metadata.field_definitions.get(i))
            .map(|field| {
                let attrs = self
                    .executor
                    .runtime_type(field.type_index)
                    .map(|ty| ty.attrs())
                    .unwrap_or(0);
                FieldModel {
                    name: self.string(field.name_index),
                    type_name: self.executor.type_name_by_index(field.type_index),
                    token: field.token,
                    is_static: attrs & field_attributes::STATIC != 0,
                    is_literal: attrs & field_attributes::LITERAL != 0,
                }
            })
            .collect()
    }

    fn properties(&self, def: &Il2CppTypeDefinition) -> Vec<PropertyModel> {
        let accessor = |offset: i32| {
            let index = usize::try_from(def.method_start).ok()? + usize::try_from(offset).ok()?;
            self.metadata.method_definitions.get(index)
        };

        rows(def.property_start, def.property_count as usize)
            .filter_map(|i| self.metadata.property_definitions.get(i))
            .map(|property| {
                let getter = accessor(property.get);
                let setter = accessor(property.set);
                PropertyModel {
                    name: self.string(property.name_index),
                    type_name: getter.map(|m| self.executor.type_name_by_index(m.return_type)),
                    getter: getter.map(|m| self.string(m.name_index)),
                    setter: setter.map(|m| self.string(m.name_index)),
                    token: property.token,
                }
            })
            .collect()
    }

    fn method_model(&self, method: &Il2CppMethodDefinition, module_name: &str) -> MethodModel {
        let parameters = rows(method.parameter_start, method.parameter_count as usize)
            .filter_map(|i| self.metadata.parameter_definitions.get(i))
            .enumerate()
            .map(|(i, param)| ParameterModel {
                name: self
                    .metadata
                    .get_string(param.name_index)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("param{}", i)),
                type_name: self.executor.type_name_by_index(param.type_index),
            })
            .collect();

        MethodModel {
            name: self.string(method.name_index),
            return_type: self.executor.type_name_by_index(method.return_type),
            parameters,
            token: method.token,
            is_static: method.flags & method_attributes::STATIC != 0,
            is_virtual: method.flags & method_attributes::VIRTUAL != 0,
            is_abstract: method.flags & method_attributes::ABSTRACT != 0,
            address: self.executor.method_pointer(method, module_name),
        }
    }
}
