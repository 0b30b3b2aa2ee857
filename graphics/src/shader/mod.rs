//! Shader objects and the shader build pipeline.
//!
//! A shader is written once in WGSL with one entry point per stage, named by
//! convention: `vs_main`, `ps_main`, `gs_main`, `hs_main`, `ds_main`, `cs_main`.
//! Building it runs the following steps:
//!
//! 1. [`preprocess`] - `#include`, `#define`, `#if` and friends
//! 2. [`cache`] - program cache lookup keyed by [`cache::program_name`]
//! 3. [`transpile`] - WGSL to the backend dialect through SPIR-V
//! 4. native compile via [`GpuBackend::compile_stage`](crate::backend::GpuBackend::compile_stage)
//!    plus [`reflect`]ion
//! 5. program cache store
//!
//! [`pipeline::ShaderBuilder`] drives these steps for every stage detected in the source.
//!
//! # Example
//!
//! ```ignore
//! let shader = device.create_shader(
//!     &ShaderDescriptor::new("sprite.wgsl", SPRITE_SOURCE).with_define("USE_ALPHA", "1"),
//! )?;
//! device.set_shader(Some(&shader));
//! ```

pub mod cache;
pub mod pipeline;
pub mod preprocess;
pub mod reflect;
pub mod sections;
pub mod transpile;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::backend::NativeHandle;
use crate::release::ReleaseQueue;
use crate::types::{ShaderStages, VertexFormat};

pub use cache::ProgramDescriptor;
pub use preprocess::IncludeHandler;
pub use sections::{SectionInfo, SectionRegistry};

/// Pipeline stage of a shader entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Geometry,
    Hull,
    Domain,
    Compute,
}

impl ShaderStage {
    /// Every stage in pipeline order.
    pub const ALL: [ShaderStage; 6] = [
        Self::Vertex,
        Self::Pixel,
        Self::Geometry,
        Self::Hull,
        Self::Domain,
        Self::Compute,
    ];

    /// Entry point symbol searched for in shader sources.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Vertex => "vs_main",
            Self::Pixel => "ps_main",
            Self::Geometry => "gs_main",
            Self::Hull => "hs_main",
            Self::Domain => "ds_main",
            Self::Compute => "cs_main",
        }
    }

    /// Lower-case name, used in program names and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Pixel => "pixel",
            Self::Geometry => "geometry",
            Self::Hull => "hull",
            Self::Domain => "domain",
            Self::Compute => "compute",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Single-stage mask.
    pub fn mask(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Pixel => ShaderStages::PIXEL,
            Self::Geometry => ShaderStages::GEOMETRY,
            Self::Hull => ShaderStages::HULL,
            Self::Domain => ShaderStages::DOMAIN,
            Self::Compute => ShaderStages::COMPUTE,
        }
    }

    /// naga's stage, `None` for stages naga cannot express.
    pub(crate) fn to_naga(self) -> Option<naga::ShaderStage> {
        match self {
            Self::Vertex => Some(naga::ShaderStage::Vertex),
            Self::Pixel => Some(naga::ShaderStage::Fragment),
            Self::Compute => Some(naga::ShaderStage::Compute),
            Self::Geometry | Self::Hull | Self::Domain => None,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shader language a backend's native compiler consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderDialect {
    #[default]
    Wgsl,
    /// Desktop GLSL 4.50.
    Glsl,
    /// GLSL ES 3.10.
    GlslEs,
    /// HLSL shader model 5.0.
    Hlsl,
    /// Metal shading language 2.1.
    Msl,
    /// SPIR-V words, little endian.
    SpirV,
}

impl ShaderDialect {
    /// File extension appended to program names.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wgsl => ".wgsl",
            Self::Glsl | Self::GlslEs => ".glsl",
            Self::Hlsl => ".hlsl",
            Self::Msl => ".msl",
            Self::SpirV => ".spv",
        }
    }

    /// Preprocessor define injected for sources built for this dialect.
    pub fn define(self) -> &'static str {
        match self {
            Self::Wgsl => "TARGET_WGSL",
            Self::Glsl | Self::GlslEs => "TARGET_GLSL",
            Self::Hlsl => "TARGET_HLSL",
            Self::Msl => "TARGET_MSL",
            Self::SpirV => "TARGET_SPIRV",
        }
    }

    /// Name written into program names (`&target=`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Wgsl => "wgsl",
            Self::Glsl => "glsl",
            Self::GlslEs => "glsles",
            Self::Hlsl => "hlsl",
            Self::Msl => "msl",
            Self::SpirV => "spirv",
        }
    }

    /// Whether sources need [`transpile`] before native compilation.
    pub fn needs_transpile(self) -> bool {
        self != Self::Wgsl
    }
}

bitflags! {
    /// Shader build flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFlags: u32 {
        /// Keep debug names in generated code.
        const DEBUG = 1 << 0;
        /// Skip backend optimization passes.
        const SKIP_OPTIMIZATION = 1 << 1;
        /// Bypass the program cache for both reads and writes.
        const NO_CACHE = 1 << 2;
    }
}

/// Kind of resource a shader binding expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ConstantBuffer,
    Texture,
    /// Texture with a cube view dimension.
    TextureCube,
    /// Texture with a 3D view dimension.
    Texture3d,
    Sampler,
    ComparisonSampler,
    /// Read-write storage buffer or texture.
    UnorderedAccess,
}

/// One reflected resource binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub name: String,
    pub kind: ResourceKind,
    /// Binding group, fixed per kind.
    pub group: u32,
    /// Binding number within the group.
    pub slot: u32,
}

/// One reflected vertex shader input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexInput {
    pub name: String,
    pub location: u32,
    pub format: VertexFormat,
}

/// A GLSL combined image-sampler produced by transpiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedSampler {
    /// Name of the generated `sampler2D` uniform.
    pub name: String,
    pub texture_slot: u32,
    pub sampler_slot: u32,
}

/// Reflection of one compiled stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageReflection {
    pub bindings: Vec<ResourceSlot>,
    /// Vertex inputs, only filled for the vertex stage.
    pub inputs: Vec<VertexInput>,
    pub combined_samplers: Vec<CombinedSampler>,
    /// Compute workgroup size, zero for other stages.
    pub workgroup_size: [u32; 3],
}

impl StageReflection {
    /// Slot of the named binding.
    pub fn slot(&self, name: &str) -> Option<&ResourceSlot> {
        self.bindings.iter().find(|b| b.name == name)
    }
}

/// Native binary of one stage as stored in the program cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBinary {
    pub stage: ShaderStage,
    /// Entry point in `code`. Writers may rename it.
    pub entry_point: String,
    pub code: Vec<u8>,
    pub reflection: StageReflection,
}

/// A compiled stage bound to a backend object.
#[derive(Debug)]
pub struct CompiledStage {
    handle: NativeHandle,
    entry_point: String,
    reflection: StageReflection,
}

impl CompiledStage {
    pub fn native(&self) -> NativeHandle {
        self.handle
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn reflection(&self) -> &StageReflection {
        &self.reflection
    }
}

/// Parameters for [`GraphicsDevice::create_shader`](crate::GraphicsDevice::create_shader).
#[derive(Clone, Default)]
pub struct ShaderDescriptor {
    /// File name, used for include diagnostics and the program name.
    pub name: String,
    pub source: String,
    /// `(NAME, VALUE)` pairs. An empty value defines a bare macro.
    pub defines: Vec<(String, String)>,
    pub flags: ShaderFlags,
    /// Tried before sections and the filesystem when resolving includes.
    pub include_handler: Option<Arc<dyn IncludeHandler>>,
}

impl fmt::Debug for ShaderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderDescriptor")
            .field("name", &self.name)
            .field("defines", &self.defines)
            .field("flags", &self.flags)
            .field("include_handler", &self.include_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl ShaderDescriptor {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    pub fn with_flags(mut self, flags: ShaderFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_include_handler(mut self, handler: Arc<dyn IncludeHandler>) -> Self {
        self.include_handler = Some(handler);
        self
    }
}

/// A compiled shader program with up to one object per stage.
///
/// Built by [`GraphicsDevice::create_shader`](crate::GraphicsDevice::create_shader).
/// A shader only exists if every stage detected in its source compiled.
pub struct Shader {
    id: u64,
    name: String,
    stages: [Option<CompiledStage>; 6],
    release: ReleaseQueue,
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<ShaderStage> = self.stages().map(|(s, _)| s).collect();
        f.debug_struct("Shader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stages", &stages)
            .finish()
    }
}

impl Shader {
    pub(crate) fn new(
        name: String,
        compiled: Vec<(ShaderStage, NativeHandle, StageBinary)>,
        release: ReleaseQueue,
    ) -> Self {
        let mut stages: [Option<CompiledStage>; 6] = Default::default();
        for (stage, handle, binary) in compiled {
            stages[stage.index()] = Some(CompiledStage {
                handle,
                entry_point: binary.entry_point,
                reflection: binary.reflection,
            });
        }
        Self {
            id: crate::resources::next_resource_id(),
            name,
            stages,
            release,
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when at least one stage compiled.
    pub fn is_valid(&self) -> bool {
        self.stages.iter().any(Option::is_some)
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&CompiledStage> {
        self.stages[stage.index()].as_ref()
    }

    pub fn has_stage(&self, stage: ShaderStage) -> bool {
        self.stages[stage.index()].is_some()
    }

    /// Present stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = (ShaderStage, &CompiledStage)> + '_ {
        ShaderStage::ALL
            .into_iter()
            .filter_map(|s| self.stage(s).map(|c| (s, c)))
    }

    /// Mask of present stages.
    pub fn stage_mask(&self) -> ShaderStages {
        self.stages()
            .fold(ShaderStages::empty(), |mask, (s, _)| mask | s.mask())
    }

    /// Vertex inputs of the vertex stage. Empty without one.
    pub fn signature(&self) -> &[VertexInput] {
        self.stage(ShaderStage::Vertex)
            .map(|s| s.reflection.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a named binding in any stage.
    pub fn slot(&self, name: &str) -> Option<&ResourceSlot> {
        self.stages().find_map(|(_, s)| s.reflection.slot(name))
    }

    pub(crate) fn is_compute(&self) -> bool {
        self.has_stage(ShaderStage::Compute)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        for stage in self.stages.iter().flatten() {
            self.release.defer(stage.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(ShaderStage::Pixel.entry_point(), "ps_main");
        assert_eq!(ShaderStage::Compute.to_string(), "compute");
        assert_eq!(ShaderStage::ALL[ShaderStage::Hull.index()], ShaderStage::Hull);
        assert!(ShaderStage::Geometry.to_naga().is_none());
    }

    #[test]
    fn test_dialect_extension() {
        assert_eq!(ShaderDialect::GlslEs.extension(), ".glsl");
        assert_eq!(ShaderDialect::SpirV.define(), "TARGET_SPIRV");
        assert!(!ShaderDialect::Wgsl.needs_transpile());
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = ShaderDescriptor::new("a.wgsl", "")
            .with_define("A", "")
            .with_flags(ShaderFlags::NO_CACHE);
        assert_eq!(desc.defines, vec![("A".to_string(), String::new())]);
        assert!(desc.flags.contains(ShaderFlags::NO_CACHE));
    }
}
