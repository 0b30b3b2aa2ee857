//! Binding and vertex input reflection from the WGSL module.
//!
//! Reflection runs on the source module rather than the backend output, so
//! every dialect reports the same slots. Binding groups are fixed per kind:
//!
//! | Group | Contents |
//! |-------|----------|
//! | 0 | constant buffers |
//! | 1 | textures |
//! | 2 | samplers |
//! | 3 | unordered access views |

use naga::{AddressSpace, Binding, ImageClass, ImageDimension, ScalarKind, TypeInner, VectorSize};

use crate::types::VertexFormat;

use super::transpile::ParsedModule;
use super::{ResourceKind, ResourceSlot, ShaderStage, StageReflection, VertexInput};

pub const CONSTANT_BUFFER_GROUP: u32 = 0;
pub const TEXTURE_GROUP: u32 = 1;
pub const SAMPLER_GROUP: u32 = 2;
pub const UNORDERED_ACCESS_GROUP: u32 = 3;

/// Binding group a resource of `kind` lives in.
pub fn group_for(kind: ResourceKind) -> u32 {
    match kind {
        ResourceKind::ConstantBuffer => CONSTANT_BUFFER_GROUP,
        ResourceKind::Texture | ResourceKind::TextureCube | ResourceKind::Texture3d => TEXTURE_GROUP,
        ResourceKind::Sampler | ResourceKind::ComparisonSampler => SAMPLER_GROUP,
        ResourceKind::UnorderedAccess => UNORDERED_ACCESS_GROUP,
    }
}

/// Reflect one stage.
///
/// Bindings are limited to globals the entry point uses. Stages naga cannot
/// express report every bound global.
pub fn reflect(parsed: &ParsedModule, stage: ShaderStage) -> StageReflection {
    let module = &parsed.module;
    let entry = parsed.entry_point_index(stage);

    let mut bindings = Vec::new();
    for (handle, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        if let Some(index) = entry {
            if parsed.info.get_entry_point(index)[handle].is_empty() {
                continue;
            }
        }
        let Some(kind) = resource_kind(module, var) else {
            continue;
        };
        if binding.group != group_for(kind) {
            log::warn!(
                "{stage} binding '{}' is in group {}, expected {} for {kind:?}",
                var.name.as_deref().unwrap_or("?"),
                binding.group,
                group_for(kind)
            );
        }
        bindings.push(ResourceSlot {
            name: var.name.clone().unwrap_or_default(),
            kind,
            group: binding.group,
            slot: binding.binding,
        });
    }
    bindings.sort_by_key(|b| (b.group, b.slot));

    let mut reflection = StageReflection {
        bindings,
        ..Default::default()
    };

    if let Some(index) = entry {
        let ep = &module.entry_points[index];
        if stage == ShaderStage::Vertex {
            reflection.inputs = vertex_inputs(module, &ep.function);
        }
        if stage == ShaderStage::Compute {
            reflection.workgroup_size = ep.workgroup_size;
        }
    }
    reflection
}

fn resource_kind(module: &naga::Module, var: &naga::GlobalVariable) -> Option<ResourceKind> {
    match var.space {
        AddressSpace::Uniform => Some(ResourceKind::ConstantBuffer),
        AddressSpace::Storage { .. } => Some(ResourceKind::UnorderedAccess),
        AddressSpace::Handle => handle_kind(module, &module.types[var.ty].inner),
        _ => None,
    }
}

fn handle_kind(module: &naga::Module, inner: &TypeInner) -> Option<ResourceKind> {
    match inner {
        TypeInner::Image { dim, class, .. } => Some(match (class, dim) {
            (ImageClass::Storage { .. }, _) => ResourceKind::UnorderedAccess,
            (_, ImageDimension::Cube) => ResourceKind::TextureCube,
            (_, ImageDimension::D3) => ResourceKind::Texture3d,
            _ => ResourceKind::Texture,
        }),
        TypeInner::Sampler { comparison: true } => Some(ResourceKind::ComparisonSampler),
        TypeInner::Sampler { comparison: false } => Some(ResourceKind::Sampler),
        TypeInner::BindingArray { base, .. } => handle_kind(module, &module.types[*base].inner),
        _ => None,
    }
}

fn vertex_inputs(module: &naga::Module, function: &naga::Function) -> Vec<VertexInput> {
    let mut inputs = Vec::new();
    for arg in &function.arguments {
        let ty = &module.types[arg.ty].inner;
        match (&arg.binding, ty) {
            (Some(Binding::Location { location, .. }), _) => {
                push_input(&mut inputs, arg.name.as_deref(), *location, ty);
            }
            (None, TypeInner::Struct { members, .. }) => {
                for member in members {
                    if let Some(Binding::Location { location, .. }) = &member.binding {
                        push_input(
                            &mut inputs,
                            member.name.as_deref(),
                            *location,
                            &module.types[member.ty].inner,
                        );
                    }
                }
            }
            _ => {}
        }
    }
    inputs.sort_by_key(|i| i.location);
    inputs
}

fn push_input(inputs: &mut Vec<VertexInput>, name: Option<&str>, location: u32, ty: &TypeInner) {
    let name = name.unwrap_or_default().to_string();
    match vertex_format(ty) {
        Some(format) => inputs.push(VertexInput {
            name,
            location,
            format,
        }),
        None => log::warn!("Vertex input '{name}' at location {location} has no vertex format"),
    }
}

fn vertex_format(ty: &TypeInner) -> Option<VertexFormat> {
    let (scalar, size) = match ty {
        TypeInner::Scalar(scalar) => (*scalar, None),
        TypeInner::Vector { size, scalar } => (*scalar, Some(*size)),
        _ => return None,
    };
    if scalar.width != 4 {
        return None;
    }
    match (scalar.kind, size) {
        (ScalarKind::Float, None) => Some(VertexFormat::Float32),
        (ScalarKind::Float, Some(VectorSize::Bi)) => Some(VertexFormat::Float32x2),
        (ScalarKind::Float, Some(VectorSize::Tri)) => Some(VertexFormat::Float32x3),
        (ScalarKind::Float, Some(VectorSize::Quad)) => Some(VertexFormat::Float32x4),
        (ScalarKind::Uint, None) => Some(VertexFormat::Uint32),
        (ScalarKind::Uint, Some(VectorSize::Bi)) => Some(VertexFormat::Uint32x2),
        (ScalarKind::Uint, Some(VectorSize::Quad)) => Some(VertexFormat::Uint32x4),
        (ScalarKind::Sint, None) => Some(VertexFormat::Sint32),
        (ScalarKind::Sint, Some(VectorSize::Quad)) => Some(VertexFormat::Sint32x4),
        _ => None,
    }
}
