//! GPU backend abstraction layer.
//!
//! Every device operation funnels into the [`GpuBackend`] trait, one
//! implementation per native API. Backends hand out [`NativeHandle`]s and keep
//! the native objects in their own tables.
//!
//! # Available Backends
//!
//! - `dummy` (default): No GPU, counts every call. Used by tests.
//! - `wgpu-backend`: Cross-platform backend using wgpu
//!
//! # Binding model
//!
//! The trait is immediate-mode: state is bound slot by slot and consumed by
//! the next draw. The device's register cache sits in front of it and elides
//! redundant binds, so a backend may assume every `bind_*` call is a change.

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

#[cfg(feature = "dummy")]
pub mod dummy;

use std::any::Any;

use crate::device::DeviceDescriptor;
use crate::error::GraphicsError;
use crate::shader::{ShaderDialect, ShaderStage, StageBinary, VertexInput};
use crate::types::{
    BlendDescriptor, BufferDescriptor, Color, DepthStencilDescriptor, IndexFormat,
    InputLayoutDescriptor, PrimitiveTopology, QueryKind, RasterizerDescriptor, SamplerDescriptor,
    ScissorRect, ShaderStages, TextureDescriptor, Viewport,
};

/// Opaque id of one native object owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub(crate) u64);

impl NativeHandle {
    /// The raw id.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Backend selection for device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderBackend {
    /// First backend compiled into the binary that initializes.
    #[default]
    Automatic,
    /// wgpu (Vulkan, Metal, DX12 or GL underneath).
    Wgpu,
    /// No-op backend.
    Dummy,
    /// No backend. Device creation fails with [`GraphicsError::NoBackend`].
    None,
}

impl RenderBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Wgpu => "wgpu",
            Self::Dummy => "dummy",
            Self::None => "none",
        }
    }

    /// Preprocessor define injected into every shader built for this backend.
    pub fn target_define(self) -> &'static str {
        match self {
            Self::Wgpu => "TARGET_WGPU",
            Self::Dummy => "TARGET_DUMMY",
            Self::Automatic | Self::None => "TARGET_NONE",
        }
    }
}

/// Parameters of one draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    /// Non-indexed draw.
    Vertices {
        vertex_count: u32,
        first_vertex: u32,
        instance_count: u32,
        first_instance: u32,
    },
    /// Indexed draw using the bound index buffer.
    Indexed {
        index_count: u32,
        first_index: u32,
        base_vertex: i32,
        instance_count: u32,
        first_instance: u32,
    },
}

/// Trait implemented by every GPU backend.
pub trait GpuBackend: Send + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Which backend this is.
    fn kind(&self) -> RenderBackend;

    /// Downcast support for [`GraphicsDevice::backend_as`](crate::GraphicsDevice::backend_as).
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Shader dialect the native compiler consumes.
    fn shader_dialect(&self) -> ShaderDialect;

    /// Handle of the current back buffer.
    fn back_buffer(&self) -> NativeHandle;

    /// Describe a live texture, including externally owned ones like the back buffer.
    fn texture_info(&self, texture: NativeHandle) -> Option<TextureDescriptor>;

    /// Resize the swap chain or offscreen back buffer.
    fn resize(&mut self, width: u32, height: u32) -> Result<(), GraphicsError>;

    /// Submit pending work and present the back buffer.
    fn present(&mut self, vsync: bool) -> Result<(), GraphicsError>;

    // Resource creation

    fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError>;

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError>;

    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> Result<NativeHandle, GraphicsError>;

    fn create_rasterizer_state(
        &mut self,
        desc: &RasterizerDescriptor,
    ) -> Result<NativeHandle, GraphicsError>;

    fn create_blend_state(&mut self, desc: &BlendDescriptor)
    -> Result<NativeHandle, GraphicsError>;

    fn create_sampler_state(
        &mut self,
        desc: &SamplerDescriptor,
    ) -> Result<NativeHandle, GraphicsError>;

    /// Build a native input layout validated against a vertex shader's inputs.
    fn create_input_layout(
        &mut self,
        desc: &InputLayoutDescriptor,
        signature: &[VertexInput],
    ) -> Result<NativeHandle, GraphicsError>;

    /// Compile one stage of (possibly transpiled) source into native bytecode.
    fn compile_stage(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<Vec<u8>, GraphicsError>;

    /// Create a shader stage object from a compiled binary.
    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        binary: &StageBinary,
    ) -> Result<NativeHandle, GraphicsError>;

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeHandle, GraphicsError>;

    /// Destroy a native object. Unknown handles are ignored.
    fn release(&mut self, handle: NativeHandle);

    // State binding

    fn bind_depth_stencil_state(&mut self, state: Option<NativeHandle>, stencil_ref: u32);

    fn bind_rasterizer_state(&mut self, state: Option<NativeHandle>);

    fn bind_blend_state(&mut self, state: Option<NativeHandle>);

    fn bind_input_layout(&mut self, layout: Option<NativeHandle>);

    fn bind_shader_stage(&mut self, stage: ShaderStage, shader: Option<NativeHandle>);

    fn bind_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: Option<NativeHandle>,
        stride: u32,
        offset: u64,
    );

    fn bind_index_buffer(&mut self, buffer: Option<NativeHandle>, format: IndexFormat, offset: u64);

    fn bind_constant_buffer(
        &mut self,
        stages: ShaderStages,
        slot: u32,
        buffer: Option<NativeHandle>,
    );

    fn bind_texture(&mut self, stages: ShaderStages, slot: u32, texture: Option<NativeHandle>);

    fn bind_sampler(&mut self, stages: ShaderStages, slot: u32, sampler: Option<NativeHandle>);

    /// Bind a storage buffer or texture for read-write access.
    fn bind_unordered_access(&mut self, slot: u32, resource: Option<NativeHandle>);

    fn bind_render_targets(&mut self, colors: &[NativeHandle], depth: Option<NativeHandle>);

    fn set_viewport(&mut self, viewport: &Viewport);

    fn set_scissor(&mut self, rect: &ScissorRect);

    fn set_topology(&mut self, topology: PrimitiveTopology);

    /// Unbind everything and restore default pipeline state.
    fn clear_state(&mut self);

    // Commands

    fn clear_render_target(&mut self, target: NativeHandle, color: Color)
    -> Result<(), GraphicsError>;

    fn clear_depth_stencil(
        &mut self,
        target: NativeHandle,
        depth: f32,
        stencil: u8,
    ) -> Result<(), GraphicsError>;

    fn draw(&mut self, call: DrawCall) -> Result<(), GraphicsError>;

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), GraphicsError>;

    fn update_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError>;

    /// Read the whole buffer back. Blocks until the GPU has finished writing it.
    fn read_buffer(&mut self, buffer: NativeHandle) -> Result<Vec<u8>, GraphicsError>;

    fn update_texture(
        &mut self,
        texture: NativeHandle,
        mip_level: u32,
        layer: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError>;

    fn copy_buffer(
        &mut self,
        dst: NativeHandle,
        src: NativeHandle,
        size: u64,
    ) -> Result<(), GraphicsError>;

    fn copy_texture(&mut self, dst: NativeHandle, src: NativeHandle) -> Result<(), GraphicsError>;

    fn generate_mips(&mut self, texture: NativeHandle) -> Result<(), GraphicsError>;

    fn begin_query(&mut self, query: NativeHandle);

    fn end_query(&mut self, query: NativeHandle);

    /// Result of a finished query, `None` while it is still in flight.
    fn query_result(&mut self, query: NativeHandle) -> Result<Option<u64>, GraphicsError>;
}

/// Create the backend selected by `desc.backend`.
///
/// `Automatic` tries every compiled-in backend in order and logs each failure.
pub fn create_backend(desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    match desc.backend {
        RenderBackend::None => Err(GraphicsError::NoBackend),
        RenderBackend::Wgpu => create_wgpu(desc),
        RenderBackend::Dummy => create_dummy(desc),
        RenderBackend::Automatic => create_automatic(desc),
    }
}

fn create_automatic(desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    #[cfg(feature = "wgpu-backend")]
    {
        match create_wgpu(desc) {
            Ok(backend) => {
                log::info!("Using wgpu backend");
                return Ok(backend);
            }
            Err(e) => {
                log::warn!("Failed to create wgpu backend: {}", e);
            }
        }
    }

    if cfg!(feature = "dummy") {
        log::info!("Using dummy backend");
        return create_dummy(desc);
    }

    Err(GraphicsError::NoBackend)
}

#[cfg(feature = "wgpu-backend")]
fn create_wgpu(desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    Ok(Box::new(wgpu_backend::WgpuBackend::new(desc)?))
}

#[cfg(not(feature = "wgpu-backend"))]
fn create_wgpu(_desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::NoBackend)
}

#[cfg(feature = "dummy")]
fn create_dummy(desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    Ok(Box::new(dummy::DummyBackend::with_size(desc.width, desc.height)))
}

#[cfg(not(feature = "dummy"))]
fn create_dummy(_desc: &DeviceDescriptor) -> Result<Box<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::NoBackend)
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "wgpu-backend")
}
