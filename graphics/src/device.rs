//! Graphics device.
//!
//! The [`GraphicsDevice`] is the main interface for creating GPU resources,
//! binding state and submitting draws. It owns one backend and must be driven
//! from its render thread; other threads reach it through its [`WorkQueue`].
//!
//! # Example
//!
//! ```ignore
//! let mut device = GraphicsDevice::new(
//!     DeviceDescriptor::new()
//!         .with_backend(RenderBackend::Automatic)
//!         .with_size(1280, 720)
//!         .with_program_cache_dir("target/programs"),
//! )?;
//!
//! let vertices = device.create_mesh_buffer(&VERTICES)?;
//! let shader = device.load_shader("sprite", &[("USE_ALPHA", "1")])?;
//! let alpha = device.get_blend_state("alpha");
//!
//! device.set_shader(Some(&shader));
//! device.set_blend_state(alpha.as_deref());
//! device.set_vertex_buffer(0, Some(&vertices), 20, 0);
//! device.draw(3, 0)?;
//! device.present()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use bytemuck::Pod;

use crate::backend::{self, DrawCall, GpuBackend, NativeHandle, RenderBackend};
use crate::error::GraphicsError;
use crate::immediate::ImmediateDrawer;
use crate::queue::WorkQueue;
use crate::regs::{check_slot, RegisterCache, RegisterKey, RegisterKind, RegisterStats, RegisterValue};
use crate::release::ReleaseQueue;
use crate::resources::{
    BlendState, Buffer, DepthStencilState, InputLayout, Query, RasterizerState, ResourceRef,
    SamplerState, Texture,
};
use crate::shader::cache::{program_name, ProgramCache};
use crate::shader::pipeline::ShaderBuilder;
use crate::shader::{
    ProgramDescriptor, SectionInfo, SectionRegistry, Shader, ShaderDescriptor, ShaderStage,
};
use crate::types::{
    AddressMode, BindFlags, BlendDescriptor, BufferDescriptor, BufferKind, Color, CompareFunction,
    DepthStencilDescriptor, FillMode, IndexFormat, InputLayoutDescriptor, MapMode,
    PrimitiveTopology, QueryKind, RasterizerDescriptor, ResourceUsage, SamplerDescriptor,
    ScissorRect, ShaderStages, TextureDescriptor, TextureFormat, TextureKind, Viewport,
    MAX_RENDER_TARGETS,
};
use crate::window::WindowSource;

/// Parameters for [`GraphicsDevice::new`].
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub backend: RenderBackend,
    /// Window to present to. Without one the backend renders offscreen.
    pub window: Option<Arc<dyn WindowSource>>,
    /// Back buffer size.
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Program cache directory. `None` disables the cache.
    pub program_cache_dir: Option<PathBuf>,
    pub label: Option<String>,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            backend: RenderBackend::Automatic,
            window: None,
            width: 1280,
            height: 720,
            vsync: true,
            program_cache_dir: None,
            label: None,
        }
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("backend", &self.backend)
            .field("window", &self.window.is_some())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("vsync", &self.vsync)
            .field("program_cache_dir", &self.program_cache_dir)
            .field("label", &self.label)
            .finish()
    }
}

impl DeviceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: RenderBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Present to `window`. The back buffer takes the window's size.
    pub fn with_window(mut self, window: Arc<dyn WindowSource>) -> Self {
        let (width, height) = window.size();
        self.width = width;
        self.height = height;
        self.window = Some(window);
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_program_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.program_cache_dir = Some(dir.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Native input layout built for one (layout, shader) pair.
struct LayoutEntry {
    layout: Weak<InputLayout>,
    shader: Weak<Shader>,
    handle: NativeHandle,
}

/// A graphics device.
///
/// Created on, and afterwards bound to, the render thread. Every setter goes
/// through the register cache first and only reaches the backend when the
/// value changed.
///
/// # Built-in states
///
/// | Table | Names |
/// |-------|-------|
/// | depth-stencil | `default`, `disabled`, `read_only` |
/// | rasterizer | `default`, `no_cull`, `wireframe` |
/// | blend | `opaque`, `alpha`, `additive` |
/// | sampler | `linear`, `nearest`, `linear_wrap`, `shadow` |
pub struct GraphicsDevice {
    pub(crate) backend: Box<dyn GpuBackend>,
    label: String,
    vsync: bool,
    window: Option<Arc<dyn WindowSource>>,
    pub(crate) regs: RegisterCache,
    queue: WorkQueue,
    pub(crate) release: ReleaseQueue,
    sections: SectionRegistry,
    program_cache: ProgramCache,
    depth_stencil_states: HashMap<String, Arc<DepthStencilState>>,
    rasterizer_states: HashMap<String, Arc<RasterizerState>>,
    blend_states: HashMap<String, Arc<BlendState>>,
    sampler_states: HashMap<String, Arc<SamplerState>>,
    input_layouts: HashMap<String, Arc<InputLayout>>,
    layout_cache: HashMap<(u64, u64), LayoutEntry>,
    back_buffer: Arc<Texture>,
    color_targets: Vec<Arc<Texture>>,
    depth_target: Option<Arc<Texture>>,
    shader: Option<Arc<Shader>>,
    input_layout: Option<Arc<InputLayout>>,
    pub(crate) immediate: ImmediateDrawer,
    frame: u64,
}

static_assertions::assert_impl_all!(GraphicsDevice: Send);

impl fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("label", &self.label)
            .field("backend", &self.backend.name())
            .field("frame", &self.frame)
            .field("pending_jobs", &self.queue.pending())
            .finish_non_exhaustive()
    }
}

impl GraphicsDevice {
    /// Create a device with the backend selected by `desc.backend`.
    ///
    /// The calling thread becomes the render thread.
    pub fn new(desc: DeviceDescriptor) -> Result<Self, GraphicsError> {
        let backend = backend::create_backend(&desc)?;
        Self::with_backend(desc, backend)
    }

    /// Create a device around an existing backend. `desc.backend` is ignored.
    pub fn with_backend(
        desc: DeviceDescriptor,
        backend: Box<dyn GpuBackend>,
    ) -> Result<Self, GraphicsError> {
        let label = desc.label.clone().unwrap_or_else(|| "Graphics Device".into());
        log::info!("Creating graphics device '{}' on {}", label, backend.name());

        let back_handle = backend.back_buffer();
        let back_desc = backend
            .texture_info(back_handle)
            .ok_or_else(|| GraphicsError::Internal("backend has no back buffer".into()))?;

        let mut device = Self {
            backend,
            label,
            vsync: desc.vsync,
            window: desc.window,
            regs: RegisterCache::new(),
            queue: WorkQueue::new(),
            release: ReleaseQueue::new(),
            sections: SectionRegistry::builtin(),
            program_cache: ProgramCache::new(desc.program_cache_dir),
            depth_stencil_states: HashMap::new(),
            rasterizer_states: HashMap::new(),
            blend_states: HashMap::new(),
            sampler_states: HashMap::new(),
            input_layouts: HashMap::new(),
            layout_cache: HashMap::new(),
            back_buffer: Arc::new(Texture::external(back_handle, back_desc)),
            color_targets: Vec::new(),
            depth_target: None,
            shader: None,
            input_layout: None,
            immediate: ImmediateDrawer::new(),
            frame: 0,
        };
        device.create_default_states()?;
        device.bind_back_buffer();
        Ok(device)
    }

    fn create_default_states(&mut self) -> Result<(), GraphicsError> {
        self.create_depth_stencil_state("default", DepthStencilDescriptor::default())?;
        self.create_depth_stencil_state("disabled", DepthStencilDescriptor::disabled())?;
        self.create_depth_stencil_state(
            "read_only",
            DepthStencilDescriptor::read_only(CompareFunction::LessEqual),
        )?;

        self.create_rasterizer_state("default", RasterizerDescriptor::default())?;
        self.create_rasterizer_state("no_cull", RasterizerDescriptor::no_cull())?;
        self.create_rasterizer_state(
            "wireframe",
            RasterizerDescriptor {
                fill_mode: FillMode::Wireframe,
                ..RasterizerDescriptor::no_cull()
            },
        )?;

        self.create_blend_state("opaque", BlendDescriptor::default())?;
        self.create_blend_state("alpha", BlendDescriptor::alpha())?;
        self.create_blend_state("additive", BlendDescriptor::additive())?;

        self.create_sampler_state("linear", SamplerDescriptor::linear())?;
        self.create_sampler_state("nearest", SamplerDescriptor::nearest())?;
        self.create_sampler_state(
            "linear_wrap",
            SamplerDescriptor::linear().with_address_mode(AddressMode::Repeat),
        )?;
        self.create_sampler_state(
            "shadow",
            SamplerDescriptor::linear().with_compare(CompareFunction::LessEqual),
        )?;
        Ok(())
    }

    fn bind_back_buffer(&mut self) {
        let back_buffer = self.back_buffer.clone();
        self.set_render_target(Some(&back_buffer), None);
        self.set_viewport(&Viewport::from_dimensions(
            back_buffer.width(),
            back_buffer.height(),
        ));
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GpuBackend {
        self.backend.as_mut()
    }

    /// The backend as its concrete type.
    pub fn backend_as<T: GpuBackend>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    pub fn backend_as_mut<T: GpuBackend>(&mut self) -> Option<&mut T> {
        self.backend.as_any_mut().downcast_mut::<T>()
    }

    pub fn window(&self) -> Option<&Arc<dyn WindowSource>> {
        self.window.as_ref()
    }

    /// The swap chain or offscreen back buffer.
    pub fn back_buffer(&self) -> &Arc<Texture> {
        &self.back_buffer
    }

    pub fn width(&self) -> u32 {
        self.back_buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.back_buffer.height()
    }

    /// Number of presented frames.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn register_stats(&self) -> RegisterStats {
        self.regs.stats()
    }

    pub fn render_targets(&self) -> &[Arc<Texture>] {
        &self.color_targets
    }

    pub fn depth_target(&self) -> Option<&Arc<Texture>> {
        self.depth_target.as_ref()
    }

    pub fn current_shader(&self) -> Option<&Arc<Shader>> {
        self.shader.as_ref()
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Create a buffer, optionally initialized with `data`.
    pub fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> Result<Arc<Buffer>, GraphicsError> {
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".into(),
            ));
        }
        if let Some(data) = data {
            if data.len() as u64 > desc.size {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{} bytes of initial data exceed buffer size {}",
                    data.len(),
                    desc.size
                )));
            }
        }
        if desc.usage == ResourceUsage::Immutable && data.is_none() {
            return Err(GraphicsError::InvalidParameter(
                "immutable buffers need initial data".into(),
            ));
        }
        if desc.kind == BufferKind::Constant && desc.size % 16 != 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "constant buffer size {} is not a multiple of 16",
                desc.size
            )));
        }

        let handle = self.backend.create_buffer(desc, data)?;
        log::trace!("Created buffer {:?} ({} bytes)", desc.label, desc.size);
        Ok(Arc::new(Buffer::new(handle, desc.clone(), self.release.clone())))
    }

    fn create_typed_buffer<T: Pod>(
        &mut self,
        kind: BufferKind,
        items: &[T],
    ) -> Result<Arc<Buffer>, GraphicsError> {
        let bytes: &[u8] = bytemuck::cast_slice(items);
        let desc = BufferDescriptor::new(kind, bytes.len() as u64)
            .with_stride(std::mem::size_of::<T>() as u32);
        self.create_buffer(&desc, Some(bytes))
    }

    /// Create a 32-bit index buffer.
    pub fn create_element_buffer(&mut self, indices: &[u32]) -> Result<Arc<Buffer>, GraphicsError> {
        self.create_typed_buffer(BufferKind::Element, indices)
    }

    /// Create a 16-bit index buffer.
    pub fn create_element_buffer_u16(
        &mut self,
        indices: &[u16],
    ) -> Result<Arc<Buffer>, GraphicsError> {
        self.create_typed_buffer(BufferKind::Element, indices)
    }

    /// Create a vertex buffer of static geometry.
    pub fn create_mesh_buffer<V: Pod>(&mut self, vertices: &[V]) -> Result<Arc<Buffer>, GraphicsError> {
        self.create_typed_buffer(BufferKind::Mesh, vertices)
    }

    /// Create a vertex buffer of skinning data (bone indices and weights).
    pub fn create_skin_buffer<V: Pod>(&mut self, vertices: &[V]) -> Result<Arc<Buffer>, GraphicsError> {
        self.create_typed_buffer(BufferKind::Skin, vertices)
    }

    /// Create a per-instance vertex buffer.
    pub fn create_instance_buffer<V: Pod>(
        &mut self,
        instances: &[V],
    ) -> Result<Arc<Buffer>, GraphicsError> {
        self.create_typed_buffer(BufferKind::Instance, instances)
    }

    /// Create a dynamic constant buffer. `size` is rounded up to 16 bytes.
    pub fn create_constant_buffer(&mut self, size: u64) -> Result<Arc<Buffer>, GraphicsError> {
        let desc = BufferDescriptor::new(BufferKind::Constant, size.div_ceil(16) * 16)
            .with_usage(ResourceUsage::Dynamic);
        self.create_buffer(&desc, None)
    }

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    /// Create a texture. `mip_levels == 0` requests a full mip chain.
    ///
    /// Storage is always allocated. Mips are generated when `data` is given
    /// and the texture has more than one level.
    pub fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> Result<Arc<Texture>, GraphicsError> {
        let mut desc = desc.clone();
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "texture size {}x{} must be non-zero",
                desc.width, desc.height
            )));
        }
        if desc.kind == TextureKind::Cube && desc.width != desc.height {
            return Err(GraphicsError::InvalidParameter(
                "cube faces must be square".into(),
            ));
        }
        desc.depth = desc.depth.max(1);
        if desc.mip_levels == 0 {
            desc.mip_levels = desc.max_mip_levels();
        }
        if desc.mip_levels > desc.max_mip_levels() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} mip levels requested, at most {} possible",
                desc.mip_levels,
                desc.max_mip_levels()
            )));
        }
        if let Some(data) = data {
            if data.len() < desc.level0_size() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{} bytes of initial data, level 0 needs {}",
                    data.len(),
                    desc.level0_size()
                )));
            }
        }
        if desc.usage == ResourceUsage::Immutable && data.is_none() {
            return Err(GraphicsError::InvalidParameter(
                "immutable textures need initial data".into(),
            ));
        }

        let handle = self.backend.create_texture(&desc, data)?;
        if data.is_some() && desc.mip_levels > 1 {
            if let Err(e) = self.backend.generate_mips(handle) {
                self.backend.release(handle);
                return Err(e);
            }
        }
        log::trace!(
            "Created texture {:?} ({}x{}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.format
        );
        Ok(Arc::new(Texture::new(handle, desc, self.release.clone())))
    }

    pub fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        data: Option<&[u8]>,
    ) -> Result<Arc<Texture>, GraphicsError> {
        self.create_texture(&TextureDescriptor::new_2d(width, height, format), data)
    }

    pub fn create_texture_3d(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
        data: Option<&[u8]>,
    ) -> Result<Arc<Texture>, GraphicsError> {
        self.create_texture(
            &TextureDescriptor::new_3d(width, height, depth, format),
            data,
        )
    }

    /// Create a cube texture. `data` holds the six faces in +X, -X, +Y, -Y, +Z, -Z order.
    pub fn create_texture_cube(
        &mut self,
        size: u32,
        format: TextureFormat,
        data: Option<&[u8]>,
    ) -> Result<Arc<Texture>, GraphicsError> {
        self.create_texture(&TextureDescriptor::new_cube(size, format), data)
    }

    /// Create a color render target that can also be sampled.
    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Arc<Texture>, GraphicsError> {
        if format.is_depth_stencil() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{format:?} is not a color format"
            )));
        }
        let desc = TextureDescriptor::new_2d(width, height, format)
            .with_bind_flags(BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE);
        self.create_texture(&desc, None)
    }

    /// Create a depth-stencil target.
    pub fn create_depth_target(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Arc<Texture>, GraphicsError> {
        if !format.is_depth_stencil() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{format:?} is not a depth format"
            )));
        }
        let desc = TextureDescriptor::new_2d(width, height, format)
            .with_bind_flags(BindFlags::DEPTH_STENCIL);
        self.create_texture(&desc, None)
    }

    /// Create a cube render target.
    pub fn create_cubemap(
        &mut self,
        size: u32,
        format: TextureFormat,
    ) -> Result<Arc<Texture>, GraphicsError> {
        let desc = TextureDescriptor::new_cube(size, format)
            .with_bind_flags(BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE);
        self.create_texture(&desc, None)
    }

    /// Wrap a texture the backend owns, such as a swap chain image.
    ///
    /// The returned texture never releases the handle.
    pub fn create_texture_2d_from_native(
        &mut self,
        handle: NativeHandle,
    ) -> Result<Arc<Texture>, GraphicsError> {
        let desc = self.backend.texture_info(handle).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("{} is not a texture", handle.raw()))
        })?;
        Ok(Arc::new(Texture::external(handle, desc)))
    }

    /// Refresh a texture's metadata from the backend.
    pub fn generate_texture(&mut self, texture: &Texture) -> Result<(), GraphicsError> {
        let desc = self.backend.texture_info(texture.native()).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "{} is not a live texture",
                texture.native().raw()
            ))
        })?;
        texture.resync(desc);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn create_query(&mut self, kind: QueryKind) -> Result<Arc<Query>, GraphicsError> {
        let handle = self.backend.create_query(kind)?;
        Ok(Arc::new(Query::new(handle, kind, self.release.clone())))
    }

    pub fn begin_query(&mut self, query: &Query) {
        self.backend.begin_query(query.native());
    }

    pub fn end_query(&mut self, query: &Query) {
        self.backend.end_query(query.native());
    }

    /// Result of a finished query, `None` while the GPU has not produced it.
    pub fn get_query_data(&mut self, query: &Query) -> Result<Option<u64>, GraphicsError> {
        self.backend.query_result(query.native())
    }

    // ------------------------------------------------------------------
    // Named states
    // ------------------------------------------------------------------

    /// Create a depth-stencil state and register it under `name`, replacing any previous one.
    pub fn create_depth_stencil_state(
        &mut self,
        name: &str,
        desc: DepthStencilDescriptor,
    ) -> Result<Arc<DepthStencilState>, GraphicsError> {
        let handle = self.backend.create_depth_stencil_state(&desc)?;
        let state = Arc::new(DepthStencilState::new(name, desc, handle, self.release.clone()));
        if self
            .depth_stencil_states
            .insert(name.to_string(), state.clone())
            .is_some()
        {
            log::debug!("Replaced depth-stencil state '{name}'");
        }
        Ok(state)
    }

    pub fn get_depth_stencil_state(&self, name: &str) -> Option<Arc<DepthStencilState>> {
        self.depth_stencil_states.get(name).cloned()
    }

    pub fn create_rasterizer_state(
        &mut self,
        name: &str,
        desc: RasterizerDescriptor,
    ) -> Result<Arc<RasterizerState>, GraphicsError> {
        let handle = self.backend.create_rasterizer_state(&desc)?;
        let state = Arc::new(RasterizerState::new(name, desc, handle, self.release.clone()));
        if self
            .rasterizer_states
            .insert(name.to_string(), state.clone())
            .is_some()
        {
            log::debug!("Replaced rasterizer state '{name}'");
        }
        Ok(state)
    }

    pub fn get_rasterizer_state(&self, name: &str) -> Option<Arc<RasterizerState>> {
        self.rasterizer_states.get(name).cloned()
    }

    pub fn create_blend_state(
        &mut self,
        name: &str,
        desc: BlendDescriptor,
    ) -> Result<Arc<BlendState>, GraphicsError> {
        let handle = self.backend.create_blend_state(&desc)?;
        let state = Arc::new(BlendState::new(name, desc, handle, self.release.clone()));
        if self
            .blend_states
            .insert(name.to_string(), state.clone())
            .is_some()
        {
            log::debug!("Replaced blend state '{name}'");
        }
        Ok(state)
    }

    pub fn get_blend_state(&self, name: &str) -> Option<Arc<BlendState>> {
        self.blend_states.get(name).cloned()
    }

    pub fn create_sampler_state(
        &mut self,
        name: &str,
        desc: SamplerDescriptor,
    ) -> Result<Arc<SamplerState>, GraphicsError> {
        if desc.max_anisotropy == 0 || desc.lod_min > desc.lod_max {
            return Err(GraphicsError::InvalidParameter(format!(
                "sampler '{name}': invalid anisotropy or LOD range"
            )));
        }
        let handle = self.backend.create_sampler_state(&desc)?;
        let state = Arc::new(SamplerState::new(name, desc, handle, self.release.clone()));
        if self
            .sampler_states
            .insert(name.to_string(), state.clone())
            .is_some()
        {
            log::debug!("Replaced sampler state '{name}'");
        }
        Ok(state)
    }

    pub fn get_sampler_state(&self, name: &str) -> Option<Arc<SamplerState>> {
        self.sampler_states.get(name).cloned()
    }

    /// Register a vertex input layout.
    ///
    /// The native object is built lazily, once per shader it is drawn with.
    pub fn create_input_layout(
        &mut self,
        name: &str,
        desc: InputLayoutDescriptor,
    ) -> Result<Arc<InputLayout>, GraphicsError> {
        if desc.elements.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "input layout '{name}' has no elements"
            )));
        }
        let mut locations: Vec<u32> = desc.elements.iter().map(|e| e.location).collect();
        locations.sort_unstable();
        if locations.windows(2).any(|w| w[0] == w[1]) {
            return Err(GraphicsError::InvalidParameter(format!(
                "input layout '{name}' uses a location twice"
            )));
        }
        if let Some(slot) = desc.slots().into_iter().find(|slot| *slot >= crate::regs::MAX_SLOTS) {
            return Err(GraphicsError::InvalidParameter(format!(
                "input layout '{name}' reads vertex buffer slot {slot}"
            )));
        }

        let layout = Arc::new(InputLayout::new(name, desc));
        self.input_layouts.insert(name.to_string(), layout.clone());
        Ok(layout)
    }

    pub fn get_input_layout(&self, name: &str) -> Option<Arc<InputLayout>> {
        self.input_layouts.get(name).cloned()
    }

    // ------------------------------------------------------------------
    // Shaders, sections and the program cache
    // ------------------------------------------------------------------

    /// Build a shader from source. Fails unless every detected stage compiles.
    pub fn create_shader(&mut self, desc: &ShaderDescriptor) -> Result<Arc<Shader>, GraphicsError> {
        let shader = ShaderBuilder::new(
            self.backend.as_mut(),
            &self.sections,
            &self.program_cache,
            self.release.clone(),
        )
        .build(desc)?;
        Ok(Arc::new(shader))
    }

    /// Build a shader from a section, or from a file if no section matches.
    pub fn load_shader(
        &mut self,
        name: &str,
        defines: &[(&str, &str)],
    ) -> Result<Arc<Shader>, GraphicsError> {
        let (file, source) = match self.sections.resolve(name) {
            Some((key, source)) => (key.to_string(), source.to_string()),
            None => (name.to_string(), std::fs::read_to_string(name)?),
        };
        let desc = defines
            .iter()
            .fold(ShaderDescriptor::new(file, source), |desc, (k, v)| {
                desc.with_define(*k, *v)
            });
        self.create_shader(&desc)
    }

    pub fn get_section_info(&self, name: &str) -> Result<SectionInfo, GraphicsError> {
        self.sections.info(name)
    }

    pub fn get_section_data(&self, name: &str) -> Result<&str, GraphicsError> {
        self.sections.data(name)
    }

    /// Register or replace a section. Returns `true` if it replaced one.
    pub fn add_section(&mut self, name: impl Into<String>, source: impl Into<String>) -> bool {
        self.sections.add(name, source)
    }

    pub fn remove_section(&mut self, name: &str) -> bool {
        self.sections.remove(name)
    }

    pub fn sections(&self) -> &SectionRegistry {
        &self.sections
    }

    /// Cache name of a program. A descriptor left at
    /// [`RenderBackend::Automatic`] is named for this device's backend.
    pub fn get_program_name(&self, desc: &ProgramDescriptor) -> String {
        if desc.backend == RenderBackend::Automatic {
            program_name(&desc.clone().with_backend(self.backend.kind()))
        } else {
            program_name(desc)
        }
    }

    /// Raw program cache entry. `Ok(None)` on a miss or with the cache disabled.
    pub fn get_program_cache(&self, name: &str) -> Result<Option<Vec<u8>>, GraphicsError> {
        self.program_cache.read(name)
    }

    pub fn set_program_cache(&self, name: &str, bytes: &[u8]) -> Result<(), GraphicsError> {
        self.program_cache.write(name, bytes)
    }

    pub fn program_cache(&self) -> &ProgramCache {
        &self.program_cache
    }

    // ------------------------------------------------------------------
    // Cached setters
    // ------------------------------------------------------------------

    pub fn set_depth_stencil_state(&mut self, state: Option<&DepthStencilState>, stencil_ref: u32) {
        let handle = state.map(DepthStencilState::native);
        let value = RegisterValue::DepthStencil {
            state: handle,
            stencil_ref,
        };
        if self
            .regs
            .exchange(RegisterKey::global(RegisterKind::DepthStencilState), value)
        {
            self.backend.bind_depth_stencil_state(handle, stencil_ref);
        }
    }

    pub fn set_rasterizer_state(&mut self, state: Option<&RasterizerState>) {
        let handle = state.map(RasterizerState::native);
        if self.regs.exchange(
            RegisterKey::global(RegisterKind::RasterizerState),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_rasterizer_state(handle);
        }
    }

    pub fn set_blend_state(&mut self, state: Option<&BlendState>) {
        let handle = state.map(BlendState::native);
        if self.regs.exchange(
            RegisterKey::global(RegisterKind::BlendState),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_blend_state(handle);
        }
    }

    pub fn set_sampler(&mut self, stages: ShaderStages, slot: u32, sampler: Option<&SamplerState>) {
        if !check_slot("set_sampler", stages, slot) {
            return;
        }
        let handle = sampler.map(SamplerState::native);
        if self.regs.exchange(
            RegisterKey::slot(RegisterKind::Sampler, stages, slot),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_sampler(stages, slot, handle);
        }
    }

    /// Bind the input layout used by subsequent draws.
    pub fn set_input_layout(&mut self, layout: Option<&Arc<InputLayout>>) {
        self.input_layout = layout.cloned();
    }

    /// Bind every stage of `shader`, unbinding stages it lacks.
    pub fn set_shader(&mut self, shader: Option<&Arc<Shader>>) {
        for stage in ShaderStage::ALL {
            let handle = shader.and_then(|s| s.stage(stage)).map(|s| s.native());
            if self.regs.exchange(
                RegisterKey::global(RegisterKind::Shader(stage)),
                RegisterValue::Handle(handle),
            ) {
                self.backend.bind_shader_stage(stage, handle);
            }
        }
        self.shader = shader.cloned();
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: Option<&Buffer>, stride: u32, offset: u64) {
        if !check_slot("set_vertex_buffer", ShaderStages::VERTEX, slot) {
            return;
        }
        let handle = buffer.map(Buffer::native);
        let value = RegisterValue::VertexBuffer {
            buffer: handle,
            stride,
            offset,
        };
        if self.regs.exchange(
            RegisterKey::slot(RegisterKind::VertexBuffer, ShaderStages::VERTEX, slot),
            value,
        ) {
            self.backend.bind_vertex_buffer(slot, handle, stride, offset);
        }
    }

    pub fn set_index_buffer(&mut self, buffer: Option<&Buffer>, format: IndexFormat, offset: u64) {
        let handle = buffer.map(Buffer::native);
        let value = RegisterValue::IndexBuffer {
            buffer: handle,
            format,
            offset,
        };
        if self
            .regs
            .exchange(RegisterKey::global(RegisterKind::IndexBuffer), value)
        {
            self.backend.bind_index_buffer(handle, format, offset);
        }
    }

    pub fn set_constant_buffer(&mut self, stages: ShaderStages, slot: u32, buffer: Option<&Buffer>) {
        if !check_slot("set_constant_buffer", stages, slot) {
            return;
        }
        let handle = buffer.map(Buffer::native);
        if self.regs.exchange(
            RegisterKey::slot(RegisterKind::ConstantBuffer, stages, slot),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_constant_buffer(stages, slot, handle);
        }
    }

    pub fn set_texture(&mut self, stages: ShaderStages, slot: u32, texture: Option<&Texture>) {
        if !check_slot("set_texture", stages, slot) {
            return;
        }
        let handle = texture.map(Texture::native);
        if self.regs.exchange(
            RegisterKey::slot(RegisterKind::Texture, stages, slot),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_texture(stages, slot, handle);
        }
    }

    /// Bind a buffer or texture for read-write access.
    pub fn set_unordered_access(&mut self, slot: u32, resource: Option<ResourceRef<'_>>) {
        if !check_slot("set_unordered_access", ShaderStages::all(), slot) {
            return;
        }
        let handle = resource.map(|r| r.native());
        if self.regs.exchange(
            RegisterKey::slot(RegisterKind::UnorderedAccess, ShaderStages::all(), slot),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_unordered_access(slot, handle);
        }
    }

    /// Bind one color target and an optional depth target.
    pub fn set_render_target(&mut self, color: Option<&Arc<Texture>>, depth: Option<&Arc<Texture>>) {
        self.set_render_targets(color.as_slice(), depth);
    }

    /// Bind up to [`MAX_RENDER_TARGETS`] color targets and an optional depth target.
    pub fn set_render_targets(&mut self, colors: &[&Arc<Texture>], depth: Option<&Arc<Texture>>) {
        let valid = colors.len() <= MAX_RENDER_TARGETS
            && colors.iter().all(|t| t.is_render_target())
            && depth.is_none_or(|d| d.is_depth_target());
        debug_assert!(valid, "set_render_targets: invalid targets");
        if !valid {
            log::warn!("set_render_targets: ignoring invalid targets");
            return;
        }

        let color_handles: Vec<NativeHandle> = colors.iter().map(|t| t.native()).collect();
        let depth_handle = depth.map(|d| d.native());
        self.color_targets = colors.iter().map(|t| Arc::clone(t)).collect();
        self.depth_target = depth.cloned();

        let value = RegisterValue::Targets {
            colors: color_handles.clone(),
            depth: depth_handle,
        };
        if self
            .regs
            .exchange(RegisterKey::global(RegisterKind::RenderTargets), value)
        {
            self.backend.bind_render_targets(&color_handles, depth_handle);
        }
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) {
        if self
            .regs
            .exchange(RegisterKey::global(RegisterKind::Viewport), viewport.into())
        {
            self.backend.set_viewport(viewport);
        }
    }

    pub fn set_scissor(&mut self, rect: &ScissorRect) {
        if self.regs.exchange(
            RegisterKey::global(RegisterKind::Scissor),
            RegisterValue::Scissor(*rect),
        ) {
            self.backend.set_scissor(rect);
        }
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        if self.regs.exchange(
            RegisterKey::global(RegisterKind::Topology),
            RegisterValue::Topology(topology),
        ) {
            self.backend.set_topology(topology);
        }
    }

    /// Forget every cached binding and reset the backend's pipeline state.
    pub fn flush_state(&mut self) {
        self.regs.clear();
        self.backend.clear_state();
        self.shader = None;
        self.input_layout = None;
        self.color_targets.clear();
        self.depth_target = None;
        self.collect_garbage();
    }

    // ------------------------------------------------------------------
    // Draws and commands
    // ------------------------------------------------------------------

    /// Build (or reuse) the native input layout for the bound layout and shader.
    fn prepare_draw(&mut self) -> Result<(), GraphicsError> {
        let Some(shader) = self.shader.clone() else {
            return Err(GraphicsError::InvalidParameter("draw without a shader".into()));
        };
        if !shader.has_stage(ShaderStage::Vertex) {
            return Err(GraphicsError::InvalidParameter(format!(
                "shader '{}' has no vertex stage",
                shader.name()
            )));
        }

        let handle = match self.input_layout.clone() {
            Some(layout) => Some(self.native_input_layout(&layout, &shader)?),
            None if shader.signature().is_empty() => None,
            None => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "shader '{}' has vertex inputs but no input layout is bound",
                    shader.name()
                )));
            }
        };
        if self.regs.exchange(
            RegisterKey::global(RegisterKind::InputLayout),
            RegisterValue::Handle(handle),
        ) {
            self.backend.bind_input_layout(handle);
        }
        Ok(())
    }

    fn native_input_layout(
        &mut self,
        layout: &Arc<InputLayout>,
        shader: &Arc<Shader>,
    ) -> Result<NativeHandle, GraphicsError> {
        let key = (layout.id(), shader.id());
        if let Some(entry) = self.layout_cache.get(&key) {
            return Ok(entry.handle);
        }
        let handle = self
            .backend
            .create_input_layout(layout.descriptor(), shader.signature())?;
        log::debug!(
            "Created input layout '{}' for shader '{}'",
            layout.name(),
            shader.name()
        );
        self.layout_cache.insert(
            key,
            LayoutEntry {
                layout: Arc::downgrade(layout),
                shader: Arc::downgrade(shader),
                handle,
            },
        );
        Ok(handle)
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<(), GraphicsError> {
        self.draw_instanced(vertex_count, 1, first_vertex, 0)
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        if vertex_count == 0 || instance_count == 0 {
            return Ok(());
        }
        self.prepare_draw()?;
        self.backend.draw(DrawCall::Vertices {
            vertex_count,
            first_vertex,
            instance_count,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) -> Result<(), GraphicsError> {
        self.draw_indexed_instanced(index_count, 1, first_index, base_vertex, 0)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        if index_count == 0 || instance_count == 0 {
            return Ok(());
        }
        self.prepare_draw()?;
        self.backend.draw(DrawCall::Indexed {
            index_count,
            first_index,
            base_vertex,
            instance_count,
            first_instance,
        })
    }

    /// Run the bound compute shader.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), GraphicsError> {
        if !self.shader.as_ref().is_some_and(|s| s.is_compute()) {
            return Err(GraphicsError::InvalidParameter(
                "dispatch without a compute shader".into(),
            ));
        }
        if x == 0 || y == 0 || z == 0 {
            return Ok(());
        }
        self.backend.dispatch(x, y, z)
    }

    /// Clear every bound color target.
    pub fn clear(&mut self, color: Color) -> Result<(), GraphicsError> {
        for target in self.color_targets.clone() {
            self.backend.clear_render_target(target.native(), color)?;
        }
        Ok(())
    }

    pub fn clear_render_target(&mut self, target: &Texture, color: Color) -> Result<(), GraphicsError> {
        self.backend.clear_render_target(target.native(), color)
    }

    pub fn clear_depth_stencil(
        &mut self,
        target: &Texture,
        depth: f32,
        stencil: u8,
    ) -> Result<(), GraphicsError> {
        self.backend.clear_depth_stencil(target.native(), depth, stencil)
    }

    // ------------------------------------------------------------------
    // Resource updates
    // ------------------------------------------------------------------

    pub fn update_buffer(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        if buffer.usage() == ResourceUsage::Immutable {
            return Err(GraphicsError::InvalidParameter(
                "cannot update an immutable buffer".into(),
            ));
        }
        let in_bounds = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= buffer.size());
        if !in_bounds {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                buffer.size()
            )));
        }
        self.backend.update_buffer(buffer.native(), offset, data)
    }

    /// Map a buffer for the duration of `f`.
    ///
    /// `WriteDiscard` hands out zeroed memory and uploads it when `f`
    /// returns. `Read` blocks until the GPU contents are available.
    pub fn map_buffer<R>(
        &mut self,
        buffer: &Buffer,
        mode: MapMode,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, GraphicsError> {
        match mode {
            MapMode::WriteDiscard => {
                if buffer.usage() == ResourceUsage::Immutable {
                    return Err(GraphicsError::InvalidParameter(
                        "cannot map an immutable buffer for writing".into(),
                    ));
                }
                let mut staging = vec![0u8; buffer.size() as usize];
                let result = f(&mut staging);
                self.backend.update_buffer(buffer.native(), 0, &staging)?;
                Ok(result)
            }
            MapMode::Read => {
                let mut contents = self.backend.read_buffer(buffer.native())?;
                Ok(f(&mut contents))
            }
        }
    }

    /// Read a buffer back. Blocks until the GPU has finished writing it.
    pub fn read_buffer(&mut self, buffer: &Buffer) -> Result<Vec<u8>, GraphicsError> {
        self.backend.read_buffer(buffer.native())
    }

    /// Replace one mip level of one layer.
    pub fn update_texture(
        &mut self,
        texture: &Texture,
        mip_level: u32,
        layer: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let desc = texture.descriptor();
        if desc.usage == ResourceUsage::Immutable {
            return Err(GraphicsError::InvalidParameter(
                "cannot update an immutable texture".into(),
            ));
        }
        if mip_level >= desc.mip_levels || layer >= desc.layers() {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip {mip_level} layer {layer} out of range"
            )));
        }
        let width = (desc.width >> mip_level).max(1) as usize;
        let height = (desc.height >> mip_level).max(1) as usize;
        let slices = match desc.kind {
            TextureKind::D3 => (desc.depth >> mip_level).max(1) as usize,
            _ => 1,
        };
        let expected = width * height * slices * desc.format.block_size() as usize;
        if data.len() < expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} bytes for mip {mip_level}, {expected} needed",
                data.len()
            )));
        }
        self.backend
            .update_texture(texture.native(), mip_level, layer, data)
    }

    /// Copy a whole buffer into a buffer, or a texture into a matching texture.
    pub fn copy_resource<'a>(
        &mut self,
        dst: impl Into<ResourceRef<'a>>,
        src: impl Into<ResourceRef<'a>>,
    ) -> Result<(), GraphicsError> {
        match (dst.into(), src.into()) {
            (ResourceRef::Buffer(dst), ResourceRef::Buffer(src)) => {
                self.backend
                    .copy_buffer(dst.native(), src.native(), dst.size().min(src.size()))
            }
            (ResourceRef::Texture(dst), ResourceRef::Texture(src)) => {
                if dst.width() != src.width()
                    || dst.height() != src.height()
                    || dst.format() != src.format()
                {
                    return Err(GraphicsError::InvalidParameter(
                        "copy_resource needs textures of equal size and format".into(),
                    ));
                }
                self.backend.copy_texture(dst.native(), src.native())
            }
            _ => Err(GraphicsError::InvalidParameter(
                "copy_resource between a buffer and a texture".into(),
            )),
        }
    }

    /// Regenerate mip levels 1.. from level 0.
    pub fn generate_mips(&mut self, texture: &Texture) -> Result<(), GraphicsError> {
        if texture.mip_levels() <= 1 {
            return Ok(());
        }
        self.backend.generate_mips(texture.native())
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Present the back buffer and release dropped resources.
    pub fn present(&mut self) -> Result<(), GraphicsError> {
        debug_assert!(
            !self.immediate.is_recording(),
            "present between im_begin and im_end"
        );
        self.backend.present(self.vsync)?;
        self.frame += 1;
        self.collect_garbage();
        Ok(())
    }

    /// Resize the back buffer and re-synchronize its metadata.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GraphicsError> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        self.backend.resize(width, height)?;
        let back_buffer = self.back_buffer.clone();
        self.generate_texture(&back_buffer)?;
        log::info!("Resized back buffer to {width}x{height}");

        self.regs.invalidate_kind(RegisterKind::RenderTargets);
        let colors = self.color_targets.clone();
        let depth = self.depth_target.clone();
        let color_refs: Vec<&Arc<Texture>> = colors.iter().collect();
        self.set_render_targets(&color_refs, depth.as_ref());
        if colors.iter().any(|t| Arc::ptr_eq(t, &back_buffer)) {
            self.set_viewport(&Viewport::from_dimensions(width, height));
        }
        Ok(())
    }

    /// Release every native handle whose owner was dropped. Returns the count.
    pub fn collect_garbage(&mut self) -> usize {
        let released = self.release.drain();
        for handle in &released {
            self.regs.invalidate_handle(*handle);
            self.backend.release(*handle);
        }

        let dead: Vec<(u64, u64)> = self
            .layout_cache
            .iter()
            .filter(|(_, e)| e.layout.strong_count() == 0 || e.shader.strong_count() == 0)
            .map(|(key, _)| *key)
            .collect();
        for key in &dead {
            if let Some(entry) = self.layout_cache.remove(key) {
                self.regs.invalidate_handle(entry.handle);
                self.backend.release(entry.handle);
            }
        }

        let count = released.len() + dead.len();
        if count > 0 {
            log::trace!("Released {count} native objects");
        }
        count
    }

    // ------------------------------------------------------------------
    // Render thread
    // ------------------------------------------------------------------

    /// A handle other threads can submit jobs through.
    pub fn work_queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Run `job` now on the render thread, otherwise queue it.
    pub fn enqueue<F>(&mut self, job: F)
    where
        F: FnOnce(&mut GraphicsDevice) + Send + 'static,
    {
        if self.queue.is_render_thread() {
            job(self);
        } else {
            self.queue.enqueue(job);
        }
    }

    /// Run every queued job in submission order, then collect garbage.
    ///
    /// The calling thread becomes the render thread. Jobs queued while the
    /// drain runs wait for the next call. Returns the number of jobs run.
    pub fn dispatch_queue(&mut self) -> usize {
        self.queue.stamp_render_thread();
        let queue = self.queue.clone();
        let guard = queue.lock();
        let jobs = std::mem::take(&mut *guard.borrow_mut());
        let count = jobs.len();
        for job in jobs {
            job(self);
        }
        drop(guard);
        self.collect_garbage();
        count
    }

    /// Run `f` while producers are locked out of the queue.
    pub fn lockup<R>(&mut self, f: impl FnOnce(&mut GraphicsDevice) -> R) -> R {
        let queue = self.queue.clone();
        let _guard = queue.lock();
        f(self)
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        self.queue.close();
        self.immediate.release_resources();
        self.depth_stencil_states.clear();
        self.rasterizer_states.clear();
        self.blend_states.clear();
        self.sampler_states.clear();
        self.input_layouts.clear();
        self.shader = None;
        self.input_layout = None;
        self.color_targets.clear();
        self.depth_target = None;
        self.collect_garbage();
        for (_, entry) in self.layout_cache.drain() {
            self.backend.release(entry.handle);
        }
        log::debug!("Destroyed graphics device '{}'", self.label);
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::{BackendCall, DummyBackend};
    use crate::types::VertexFormat;

    const COLORED: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) color: vec4<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 1.0);
    out.color = color;
    return out;
}

@fragment
fn ps_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return in.color;
}
"#;

    fn device() -> GraphicsDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        GraphicsDevice::new(
            DeviceDescriptor::new()
                .with_backend(RenderBackend::Dummy)
                .with_size(320, 240),
        )
        .unwrap()
    }

    fn calls(device: &GraphicsDevice, call: BackendCall) -> u64 {
        device.backend_as::<DummyBackend>().unwrap().call_count(call)
    }

    #[test]
    fn test_default_states() {
        let device = device();
        assert!(device.get_blend_state("alpha").is_some());
        assert!(device.get_depth_stencil_state("disabled").is_some());
        assert!(device.get_rasterizer_state("wireframe").is_some());
        assert!(device.get_sampler_state("shadow").is_some());
        assert!(device.get_blend_state("missing").is_none());
        assert_eq!(device.width(), 320);
        assert_eq!(device.render_targets().len(), 1);
    }

    #[test]
    fn test_set_blend_state_twice_binds_once() {
        let mut device = device();
        let alpha = device.get_blend_state("alpha").unwrap();
        device.set_blend_state(Some(&alpha));
        device.set_blend_state(Some(&alpha));
        assert_eq!(calls(&device, BackendCall::BindBlendState), 1);

        device.set_blend_state(None);
        assert_eq!(calls(&device, BackendCall::BindBlendState), 2);

        device.flush_state();
        device.set_blend_state(None);
        assert_eq!(calls(&device, BackendCall::BindBlendState), 3);
    }

    #[test]
    fn test_texture_metadata() {
        let mut device = device();
        let texture = device
            .create_texture_2d(128, 128, TextureFormat::Rgba8Unorm, None)
            .unwrap();
        assert_eq!(texture.width(), 128);
        assert_eq!(texture.height(), 128);
        assert_eq!(texture.format(), TextureFormat::Rgba8Unorm);
        assert_eq!(texture.mip_levels(), 1);
    }

    #[test]
    fn test_mips_generated_only_with_data() {
        let mut device = device();
        let desc =
            TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm).with_mip_levels(0);
        let empty = device.create_texture(&desc, None).unwrap();
        assert_eq!(empty.mip_levels(), 5);
        assert_eq!(calls(&device, BackendCall::GenerateMips), 0);

        let pixels = vec![255u8; desc.level0_size()];
        device.create_texture(&desc, Some(&pixels)).unwrap();
        assert_eq!(calls(&device, BackendCall::GenerateMips), 1);
    }

    #[test]
    fn test_texture_validation() {
        let mut device = device();
        assert!(matches!(
            device.create_texture_2d(0, 4, TextureFormat::Rgba8Unorm, None),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert!(device
            .create_texture_2d(4, 4, TextureFormat::Rgba8Unorm, Some(&[0; 8]))
            .is_err());
        assert!(device
            .create_depth_target(4, 4, TextureFormat::Rgba8Unorm)
            .is_err());
        let cube = device.create_cubemap(32, TextureFormat::Rgba16Float).unwrap();
        assert_eq!(cube.kind(), TextureKind::Cube);
        assert_eq!(cube.descriptor().layers(), 6);
    }

    #[test]
    fn test_buffer_map_and_read() {
        let mut device = device();
        let buffer = device.create_constant_buffer(20).unwrap();
        assert_eq!(buffer.size(), 32);

        device
            .map_buffer(&buffer, MapMode::WriteDiscard, |bytes| {
                bytes[..4].copy_from_slice(&[1, 2, 3, 4]);
            })
            .unwrap();
        let first = device
            .map_buffer(&buffer, MapMode::Read, |bytes| bytes[3])
            .unwrap();
        assert_eq!(first, 4);

        device.update_buffer(&buffer, 28, &[9; 4]).unwrap();
        assert_eq!(device.read_buffer(&buffer).unwrap()[31], 9);
        assert!(device.update_buffer(&buffer, 30, &[0; 4]).is_err());
    }

    #[test]
    fn test_update_buffer_offset_overflow() {
        let mut device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor::new(BufferKind::Storage, 16), None)
            .unwrap();
        assert!(matches!(
            device.update_buffer(&buffer, u64::MAX, &[1, 2]),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert!(matches!(
            device.update_buffer(&buffer, u64::MAX - 1, &[]),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert_eq!(device.read_buffer(&buffer).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_typed_buffers() {
        let mut device = device();
        let indices = device.create_element_buffer(&[0, 1, 2]).unwrap();
        assert_eq!(indices.kind(), BufferKind::Element);
        assert_eq!(indices.stride(), 4);
        assert_eq!(indices.element_count(), 3);

        let vertices = device.create_mesh_buffer(&[[0.0f32; 3]; 4]).unwrap();
        assert_eq!(vertices.stride(), 12);
        assert!(device.create_mesh_buffer::<[f32; 3]>(&[]).is_err());
    }

    #[test]
    fn test_dropped_resources_are_released() {
        let mut device = device();
        let buffer = device.create_constant_buffer(16).unwrap();
        let handle = buffer.native();
        device.set_constant_buffer(ShaderStages::VERTEX, 0, Some(&buffer));
        drop(buffer);

        assert!(device.backend_as::<DummyBackend>().unwrap().is_live(handle));
        assert_eq!(device.collect_garbage(), 1);
        assert!(!device.backend_as::<DummyBackend>().unwrap().is_live(handle));
        assert!(device
            .regs
            .get(&RegisterKey::slot(
                RegisterKind::ConstantBuffer,
                ShaderStages::VERTEX,
                0
            ))
            .is_none());
    }

    #[test]
    fn test_input_layout_built_once_per_shader() {
        let mut device = device();
        let shader = device
            .create_shader(&ShaderDescriptor::new("colored.wgsl", COLORED))
            .unwrap();
        let layout = device
            .create_input_layout(
                "position_color",
                InputLayoutDescriptor::packed(&[VertexFormat::Float32x3, VertexFormat::Float32x4]),
            )
            .unwrap();
        let vertices = device.create_mesh_buffer(&[[0.0f32; 7]; 3]).unwrap();

        device.set_shader(Some(&shader));
        device.set_input_layout(Some(&layout));
        device.set_vertex_buffer(0, Some(&vertices), 28, 0);
        device.draw(3, 0).unwrap();
        device.draw(3, 0).unwrap();
        assert_eq!(calls(&device, BackendCall::CreateInputLayout), 1);
        assert_eq!(calls(&device, BackendCall::BindInputLayout), 1);
        assert_eq!(calls(&device, BackendCall::Draw), 2);

        device.set_shader(None);
        drop(shader);
        assert_eq!(device.collect_garbage(), 3);
    }

    #[test]
    fn test_draw_requires_layout_for_vertex_inputs() {
        let mut device = device();
        assert!(device.draw(3, 0).is_err());

        let shader = device
            .create_shader(&ShaderDescriptor::new("colored.wgsl", COLORED))
            .unwrap();
        device.set_shader(Some(&shader));
        assert!(matches!(
            device.draw(3, 0),
            Err(GraphicsError::InvalidParameter(_))
        ));
        device.draw(0, 0).unwrap();
    }

    #[test]
    fn test_resize_resyncs_back_buffer() {
        let mut device = device();
        let back_buffer = device.back_buffer().clone();
        device.resize(800, 600).unwrap();
        assert_eq!(back_buffer.width(), 800);
        assert_eq!(device.height(), 600);
        assert!(device.resize(0, 10).is_err());
    }

    #[test]
    fn test_immediate_draw_invalidates_cache() {
        let mut device = device();
        let alpha = device.get_blend_state("alpha").unwrap();
        device.set_blend_state(Some(&alpha));

        device.im_begin(PrimitiveTopology::LineList);
        device.im_color(Color::new(1.0, 0.0, 0.0, 1.0));
        device.im_vertex([0.0, 0.0, 0.0]);
        device.im_vertex([1.0, 1.0, 0.0]);
        device.im_end().unwrap();

        let dummy = device.backend_as::<DummyBackend>().unwrap();
        assert_eq!(
            dummy.last_draw(),
            Some(DrawCall::Vertices {
                vertex_count: 2,
                first_vertex: 0,
                instance_count: 1,
                first_instance: 0,
            })
        );
        let binds = dummy.call_count(BackendCall::BindBlendState);
        device.set_blend_state(Some(&alpha));
        assert_eq!(calls(&device, BackendCall::BindBlendState), binds + 1);
    }

    #[test]
    fn test_immediate_buffer_grows() {
        let mut device = device();
        device.im_begin(PrimitiveTopology::PointList);
        for i in 0..5000 {
            device.im_vertex([i as f32, 0.0, 0.0]);
        }
        device.im_end().unwrap();
        assert_eq!(calls(&device, BackendCall::CreateBuffer), 3);
    }

    #[test]
    fn test_enqueue_runs_inline_on_render_thread() {
        let mut device = device();
        device.enqueue(|device| {
            device.add_section("inline.wgsl", "// inline");
        });
        assert!(device.get_section_data("inline").is_ok());
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_dispatch_queue_runs_jobs_in_order() {
        let mut device = device();
        let queue = device.work_queue();
        std::thread::spawn(move || {
            for i in 0..3 {
                queue.enqueue(move |device| {
                    device.add_section(format!("job{i}"), i.to_string());
                });
            }
        })
        .join()
        .unwrap();

        assert_eq!(device.pending(), 3);
        assert_eq!(device.dispatch_queue(), 3);
        assert_eq!(device.get_section_data("job2").unwrap(), "2");
        assert_eq!(device.dispatch_queue(), 0);
    }

    #[test]
    fn test_jobs_enqueued_during_drain_wait() {
        let mut device = device();
        let queue = device.work_queue();
        let inner = queue.clone();
        let handle = std::thread::spawn(move || {
            queue.enqueue(move |_| {
                inner.enqueue(|device| {
                    device.add_section("second", "");
                });
            });
        });
        handle.join().unwrap();

        assert_eq!(device.dispatch_queue(), 1);
        assert!(device.get_section_info("second").is_err());
        assert_eq!(device.dispatch_queue(), 1);
        assert!(device.get_section_info("second").is_ok());
    }

    #[test]
    fn test_lockup_from_worker() {
        let mut device = device();
        let queue = device.work_queue();
        let worker = std::thread::spawn(move || queue.lockup(|device| device.width()));

        while device.pending() == 0 {
            std::thread::yield_now();
        }
        device.dispatch_queue();
        assert_eq!(worker.join().unwrap().unwrap(), 320);
    }

    #[test]
    fn test_drop_releases_blocked_lockup() {
        let device = device();
        let queue = device.work_queue();
        let probe = queue.clone();
        let worker = std::thread::spawn(move || queue.lockup(|device| device.width()));

        while probe.pending() == 0 {
            std::thread::yield_now();
        }
        drop(device);
        assert!(matches!(
            worker.join().unwrap(),
            Err(GraphicsError::QueueClosed)
        ));
        assert!(probe.is_closed());
    }

    #[test]
    fn test_device_lockup_is_reentrant() {
        let mut device = device();
        let width = device.lockup(|device| device.lockup(|device| device.width()));
        assert_eq!(width, 320);
    }

    #[test]
    fn test_program_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = GraphicsDevice::new(
            DeviceDescriptor::new()
                .with_backend(RenderBackend::Dummy)
                .with_program_cache_dir(dir.path()),
        )
        .unwrap();
        let name = device.get_program_name(&ProgramDescriptor::new(
            "a.wgsl",
            ShaderStage::Pixel,
            device.backend().shader_dialect(),
        ));
        device.set_program_cache(&name, b"binary").unwrap();
        assert_eq!(
            device.get_program_cache(&name).unwrap(),
            Some(b"binary".to_vec())
        );
    }

    #[test]
    fn test_load_shader_from_section() {
        let mut device = device();
        device.add_section("colored.wgsl", COLORED);
        let shader = device.load_shader("colored", &[("UNUSED", "")]).unwrap();
        assert_eq!(shader.name(), "colored.wgsl");
        assert_eq!(shader.signature().len(), 2);
    }

    #[test]
    fn test_none_backend() {
        assert!(matches!(
            GraphicsDevice::new(DeviceDescriptor::new().with_backend(RenderBackend::None)),
            Err(GraphicsError::NoBackend)
        ));
    }
}
