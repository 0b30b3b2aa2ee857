//! wgpu GPU backend implementation.
//!
//! This backend uses wgpu for cross-platform GPU access, supporting
//! Vulkan, Metal, DX12 and GL. Shaders are consumed as WGSL.
//!
//! The device binds state register by register, which wgpu has no notion of.
//! Bound registers are recorded here and turned into a cached pipeline, bind
//! groups and a one-draw render pass when a draw is issued. Passes load and
//! store their attachments, so consecutive draws compose like on an
//! immediate-mode API.
//!
//! Commands are recorded into one pending encoder, submitted on present and
//! before any queue write or read so CPU updates land in call order.

mod conversion;
mod mips;
mod pipelines;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::device::DeviceDescriptor;
use crate::error::GraphicsError;
use crate::regs::MAX_SLOTS;
use crate::shader::{
    ResourceKind, ResourceSlot, ShaderDialect, ShaderStage, StageBinary, StageReflection,
    VertexInput,
};
use crate::types::{
    AddressMode, BindFlags, BlendDescriptor, BufferDescriptor, Color, DepthStencilDescriptor,
    FilterMode, IndexFormat, InputLayoutDescriptor, PrimitiveTopology, QueryKind,
    RasterizerDescriptor, SamplerDescriptor, ScissorRect, ShaderStages, TextureDescriptor,
    TextureFormat, TextureKind, Viewport,
};

use super::{DrawCall, GpuBackend, NativeHandle, RenderBackend};

use conversion::{
    convert_address_mode, convert_buffer_usage, convert_color, convert_compare_function,
    convert_filter_mode, convert_index_format, convert_mipmap_filter_mode,
    convert_surface_format, convert_texture_dimension, convert_texture_format,
    convert_texture_usage,
};
use mips::MipGenerator;
use pipelines::{
    create_bind_groups, create_compute_pipeline, create_render_pipeline, BoundResource,
    PipelineCache, RenderPipelineInputs, RenderPipelineKey,
};

const SLOTS: usize = MAX_SLOTS as usize;
const STAGES: usize = ShaderStage::ALL.len();

/// Draws one occlusion query can count.
const OCCLUSION_CAPACITY: u32 = 256;

/// Size of one resolved query value.
const QUERY_SIZE: u64 = 8;

/// Features enabled when the adapter has them.
const OPTIONAL_FEATURES: wgpu::Features = wgpu::Features::TIMESTAMP_QUERY
    .union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS)
    .union(wgpu::Features::POLYGON_MODE_LINE)
    .union(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER)
    .union(wgpu::Features::DEPTH_CLIP_CONTROL)
    .union(wgpu::Features::FLOAT32_FILTERABLE);

struct TextureObject {
    texture: wgpu::Texture,
    /// Full view used for sampling, depth aspect only for depth formats.
    view: wgpu::TextureView,
    desc: TextureDescriptor,
}

pub(super) struct ShaderObject {
    pub module: wgpu::ShaderModule,
    pub entry_point: String,
    pub reflection: StageReflection,
}

enum QueryState {
    Idle,
    Active,
    /// Resolve recorded, not yet submitted or mapped.
    Resolved,
    Mapping(Receiver<Result<(), wgpu::BufferAsyncError>>),
    Ready(u64),
}

struct QueryObject {
    kind: QueryKind,
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    /// Query indices written since begin, one per draw for occlusion.
    used: u32,
    state: QueryState,
}

enum Object {
    Buffer {
        buffer: wgpu::Buffer,
        desc: BufferDescriptor,
    },
    Texture(TextureObject),
    /// Back buffer backed by the window surface.
    Surface(TextureDescriptor),
    DepthStencil(DepthStencilDescriptor),
    Rasterizer(RasterizerDescriptor),
    Blend(BlendDescriptor),
    Sampler(wgpu::Sampler),
    InputLayout(InputLayoutDescriptor),
    Shader(ShaderObject),
    Query(QueryObject),
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    present_modes: Vec<wgpu::PresentMode>,
    /// Frame acquired by the first draw or clear that targets the back buffer.
    frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
}

impl SurfaceState {
    fn present_mode(&self, vsync: bool) -> wgpu::PresentMode {
        if vsync {
            return wgpu::PresentMode::Fifo;
        }
        [wgpu::PresentMode::Immediate, wgpu::PresentMode::Mailbox]
            .into_iter()
            .find(|mode| self.present_modes.contains(mode))
            .unwrap_or(wgpu::PresentMode::Fifo)
    }

    fn acquire(&self, device: &wgpu::Device) -> Result<Option<wgpu::SurfaceTexture>, GraphicsError> {
        match self.surface.get_current_texture() {
            wgpu::CurrentSurfaceTexture::Success(frame) => Ok(Some(frame)),
            wgpu::CurrentSurfaceTexture::Suboptimal(frame) => {
                log::debug!("surface frame is suboptimal");
                Ok(Some(frame))
            }
            wgpu::CurrentSurfaceTexture::Outdated | wgpu::CurrentSurfaceTexture::Lost => {
                log::debug!("surface outdated, reconfiguring");
                self.surface.configure(device, &self.config);
                match self.surface.get_current_texture() {
                    wgpu::CurrentSurfaceTexture::Success(frame)
                    | wgpu::CurrentSurfaceTexture::Suboptimal(frame) => Ok(Some(frame)),
                    other => Err(GraphicsError::Backend(format!(
                        "surface unavailable after reconfigure: {other:?}"
                    ))),
                }
            }
            wgpu::CurrentSurfaceTexture::Timeout | wgpu::CurrentSurfaceTexture::Occluded => {
                log::warn!("surface frame unavailable, skipping");
                Ok(None)
            }
            wgpu::CurrentSurfaceTexture::Validation => Err(GraphicsError::Backend(
                "surface frame acquisition failed validation".into(),
            )),
        }
    }
}

/// Registers bound since the last [`GpuBackend::clear_state`].
#[derive(Default)]
struct BoundState {
    shaders: [Option<NativeHandle>; STAGES],
    input_layout: Option<NativeHandle>,
    /// Buffer, stride and offset per slot.
    vertex_buffers: [Option<(NativeHandle, u32, u64)>; SLOTS],
    index_buffer: Option<(NativeHandle, IndexFormat, u64)>,
    constant_buffers: [[Option<NativeHandle>; SLOTS]; STAGES],
    textures: [[Option<NativeHandle>; SLOTS]; STAGES],
    samplers: [[Option<NativeHandle>; SLOTS]; STAGES],
    unordered_access: [Option<NativeHandle>; SLOTS],
    colors: Vec<NativeHandle>,
    depth: Option<NativeHandle>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    topology: PrimitiveTopology,
    blend: Option<NativeHandle>,
    depth_stencil: Option<NativeHandle>,
    stencil_ref: u32,
    rasterizer: Option<NativeHandle>,
}

impl BoundState {
    fn bind_staged(
        table: &mut [[Option<NativeHandle>; SLOTS]; STAGES],
        stages: ShaderStages,
        slot: u32,
        handle: Option<NativeHandle>,
    ) {
        if slot as usize >= SLOTS {
            return;
        }
        for stage in ShaderStage::ALL {
            if stages.contains(stage.mask()) {
                table[stage.index()][slot as usize] = handle;
            }
        }
    }

    /// Unbind `handle` from every register.
    fn forget(&mut self, handle: NativeHandle) {
        let clear = |slot: &mut Option<NativeHandle>| {
            if *slot == Some(handle) {
                *slot = None;
            }
        };
        self.shaders.iter_mut().for_each(clear);
        self.unordered_access.iter_mut().for_each(clear);
        for table in [
            &mut self.constant_buffers,
            &mut self.textures,
            &mut self.samplers,
        ] {
            table.iter_mut().flatten().for_each(clear);
        }
        for slot in self.vertex_buffers.iter_mut() {
            if matches!(slot, Some((bound, ..)) if *bound == handle) {
                *slot = None;
            }
        }
        if matches!(self.index_buffer, Some((bound, ..)) if bound == handle) {
            self.index_buffer = None;
        }
        self.colors.retain(|color| *color != handle);
        for slot in [
            &mut self.input_layout,
            &mut self.depth,
            &mut self.blend,
            &mut self.depth_stencil,
            &mut self.rasterizer,
        ] {
            clear(slot);
        }
    }
}

/// A render target view resolved for one pass.
struct Attachment {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

fn pending_encoder<'a>(
    slot: &'a mut Option<wgpu::CommandEncoder>,
    device: &wgpu::Device,
) -> &'a mut wgpu::CommandEncoder {
    slot.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame encoder"),
        })
    })
}

fn not_live(handle: NativeHandle, what: &str) -> GraphicsError {
    GraphicsError::Backend(format!("{} is not a live {what}", handle.raw()))
}

fn attachment_view(texture: &wgpu::Texture) -> wgpu::TextureView {
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: None,
        dimension: Some(wgpu::TextureViewDimension::D2),
        base_mip_level: 0,
        mip_level_count: Some(1),
        base_array_layer: 0,
        array_layer_count: Some(1),
        ..Default::default()
    })
}

fn sample_dimension(desc: &TextureDescriptor) -> wgpu::TextureViewDimension {
    match desc.kind {
        TextureKind::D2 if desc.layers() > 1 => wgpu::TextureViewDimension::D2Array,
        TextureKind::D2 => wgpu::TextureViewDimension::D2,
        TextureKind::D3 => wgpu::TextureViewDimension::D3,
        TextureKind::Cube => wgpu::TextureViewDimension::Cube,
    }
}

fn storage_view(object: &TextureObject) -> wgpu::TextureView {
    let dimension = match object.desc.kind {
        TextureKind::Cube => wgpu::TextureViewDimension::D2Array,
        _ => sample_dimension(&object.desc),
    };
    object.texture.create_view(&wgpu::TextureViewDescriptor {
        label: None,
        dimension: Some(dimension),
        base_mip_level: 0,
        mip_level_count: Some(1),
        ..Default::default()
    })
}

fn align4(size: u64) -> u64 {
    size.div_ceil(4) * 4
}

/// wgpu-based GPU backend.
pub struct WgpuBackend {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: Option<SurfaceState>,
    objects: HashMap<NativeHandle, Object>,
    next_handle: u64,
    back_buffer: NativeHandle,
    state: BoundState,
    encoder: Option<wgpu::CommandEncoder>,
    pipelines: PipelineCache,
    mips: Option<MipGenerator>,
    /// Occlusion queries between begin and end, innermost last.
    occlusion: Vec<NativeHandle>,
    frame: u64,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter.get_info().name)
            .field("objects", &self.objects.len())
            .field("pipelines", &self.pipelines.len())
            .field("frame", &self.frame)
            .finish()
    }
}

impl WgpuBackend {
    /// Create a new wgpu backend.
    ///
    /// Presents to `desc.window` when set, otherwise renders into an
    /// offscreen back buffer of `desc.width` x `desc.height`.
    pub fn new(desc: &DeviceDescriptor) -> Result<Self, GraphicsError> {
        let instance = wgpu::Instance::new(
            wgpu::InstanceDescriptor::new_without_display_handle_from_env(),
        );

        let surface = match &desc.window {
            Some(window) => Some(
                instance
                    .create_surface(window.clone())
                    .map_err(|e| GraphicsError::creation(format!("surface creation failed: {e}")))?,
            ),
            None => None,
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            force_fallback_adapter: false,
        }))
        .map_err(|e| GraphicsError::creation(format!("no compatible GPU adapter: {e}")))?;

        log::info!("wgpu adapter: {:?}", adapter.get_info());

        let features = adapter.features() & OPTIONAL_FEATURES;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: desc.label.as_deref(),
            required_features: features,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| GraphicsError::creation(format!("device creation failed: {e}")))?;

        device.on_uncaptured_error(Arc::new(|error: wgpu::Error| {
            log::error!("wgpu: {error}");
        }));
        log::debug!("wgpu optional features: {features:?}");

        let mut backend = Self {
            adapter,
            device,
            queue,
            surface: None,
            objects: HashMap::new(),
            next_handle: 1,
            back_buffer: NativeHandle(0),
            state: BoundState::default(),
            encoder: None,
            pipelines: PipelineCache::default(),
            mips: None,
            occlusion: Vec::new(),
            frame: 0,
        };

        let (width, height) = (desc.width.max(1), desc.height.max(1));
        backend.back_buffer = match surface {
            Some(surface) => backend.configure_surface(surface, width, height, desc.vsync)?,
            None => {
                let desc = TextureDescriptor::new_2d(width, height, TextureFormat::Rgba8Unorm)
                    .with_label("back buffer")
                    .with_bind_flags(BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE);
                let object = backend.new_texture(&desc)?;
                backend.insert(Object::Texture(object))
            }
        };

        Ok(backend)
    }

    fn configure_surface(
        &mut self,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<NativeHandle, GraphicsError> {
        let caps = surface.get_capabilities(&self.adapter);
        let (format, back_format) = caps
            .formats
            .iter()
            .find_map(|format| convert_surface_format(*format).map(|ours| (*format, ours)))
            .ok_or_else(|| GraphicsError::creation("surface offers no supported format"))?;

        let mut state = SurfaceState {
            config: wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | (caps.usages & (wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST)),
                format,
                width,
                height,
                present_mode: wgpu::PresentMode::Fifo,
                desired_maximum_frame_latency: 2,
                alpha_mode: caps
                    .alpha_modes
                    .first()
                    .copied()
                    .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                view_formats: Vec::new(),
            },
            present_modes: caps.present_modes,
            surface,
            frame: None,
        };
        state.config.present_mode = state.present_mode(vsync);
        state.surface.configure(&self.device, &state.config);
        log::info!("surface configured: {width}x{height} {format:?}");

        self.surface = Some(state);
        let desc = TextureDescriptor::new_2d(width, height, back_format)
            .with_label("back buffer")
            .with_bind_flags(BindFlags::RENDER_TARGET);
        Ok(self.insert(Object::Surface(desc)))
    }

    /// Get the wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get the wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// The wgpu texture behind a handle, `None` for the surface back buffer.
    pub fn native_texture(&self, handle: NativeHandle) -> Option<&wgpu::Texture> {
        match self.objects.get(&handle) {
            Some(Object::Texture(object)) => Some(&object.texture),
            _ => None,
        }
    }

    pub fn native_buffer(&self, handle: NativeHandle) -> Option<&wgpu::Buffer> {
        match self.objects.get(&handle) {
            Some(Object::Buffer { buffer, .. }) => Some(buffer),
            _ => None,
        }
    }

    /// Number of render and compute pipelines built so far and still live.
    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    fn insert(&mut self, object: Object) -> NativeHandle {
        let handle = NativeHandle(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    /// Submit recorded commands.
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
    }

    fn buffer_object(&self, handle: NativeHandle) -> Result<(&wgpu::Buffer, &BufferDescriptor), GraphicsError> {
        match self.objects.get(&handle) {
            Some(Object::Buffer { buffer, desc }) => Ok((buffer, desc)),
            _ => Err(not_live(handle, "buffer")),
        }
    }

    fn texture_object(&self, handle: NativeHandle) -> Result<&TextureObject, GraphicsError> {
        match self.objects.get(&handle) {
            Some(Object::Texture(object)) => Ok(object),
            _ => Err(not_live(handle, "texture")),
        }
    }

    fn shader_object(&self, handle: NativeHandle) -> Result<&ShaderObject, GraphicsError> {
        match self.objects.get(&handle) {
            Some(Object::Shader(object)) => Ok(object),
            _ => Err(not_live(handle, "shader")),
        }
    }

    fn new_texture(&self, desc: &TextureDescriptor) -> Result<TextureObject, GraphicsError> {
        let format = convert_texture_format(desc.format);
        let features = self.device.features();
        let mut usage = convert_texture_usage(desc.bind_flags);
        if desc.mip_levels > 1 && MipGenerator::supports(desc, features) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        usage &= format.guaranteed_format_features(features).allowed_usages;
        if usage.is_empty() {
            return Err(GraphicsError::creation(format!(
                "{:?} supports none of the requested bind flags {:?}",
                desc.format, desc.bind_flags
            )));
        }

        let depth_or_array_layers = match desc.kind {
            TextureKind::D3 => desc.depth.max(1),
            _ => desc.layers(),
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers,
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: convert_texture_dimension(desc.kind),
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            dimension: Some(sample_dimension(desc)),
            aspect: if desc.format.is_depth_stencil() {
                wgpu::TextureAspect::DepthOnly
            } else {
                wgpu::TextureAspect::All
            },
            ..Default::default()
        });
        Ok(TextureObject {
            texture,
            view,
            desc: desc.clone(),
        })
    }

    fn write_level(
        &self,
        object: &TextureObject,
        mip_level: u32,
        layer: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let desc = &object.desc;
        if desc.format.is_depth_stencil() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{:?} textures cannot be written from the CPU",
                desc.format
            )));
        }
        let width = (desc.width >> mip_level).max(1);
        let height = (desc.height >> mip_level).max(1);
        let depth = match desc.kind {
            TextureKind::D3 => (desc.depth >> mip_level).max(1),
            _ => 1,
        };
        let row = width * desc.format.block_size();
        let expected = row as usize * height as usize * depth as usize;
        if data.len() < expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip {mip_level} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &object.texture,
                mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            &data[..expected],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: depth,
            },
        );
        Ok(())
    }

    /// Copy `size` bytes at `offset` of `buffer` back to the CPU. Blocks.
    fn read_range(
        &mut self,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        self.flush();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = crossbeam_channel::bounded(1);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| GraphicsError::Backend(format!("device poll failed: {e}")))?;
        receiver
            .recv()
            .map_err(|_| GraphicsError::Backend("buffer map callback dropped".into()))?
            .map_err(|e| GraphicsError::Backend(format!("buffer map failed: {e}")))?;

        let data = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Resolve a bound render target, `None` when the surface has no frame to give.
    fn attachment(&mut self, handle: NativeHandle) -> Result<Option<Attachment>, GraphicsError> {
        if !matches!(self.objects.get(&handle), Some(Object::Surface(_))) {
            let object = self.texture_object(handle)?;
            return Ok(Some(Attachment {
                view: attachment_view(&object.texture),
                format: object.texture.format(),
                width: object.desc.width,
                height: object.desc.height,
            }));
        }

        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| GraphicsError::Internal("surface back buffer without a surface".into()))?;
        if surface.frame.is_none() {
            let Some(frame) = surface.acquire(&self.device)? else {
                return Ok(None);
            };
            let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
            surface.frame = Some((frame, view));
        }
        Ok(surface.frame.as_ref().map(|(_, view)| Attachment {
            view: view.clone(),
            format: surface.config.format,
            width: surface.config.width,
            height: surface.config.height,
        }))
    }

    /// Resolve every bound target, `None` when the back buffer is unavailable.
    fn bound_attachments(
        &mut self,
    ) -> Result<Option<(Vec<Attachment>, Option<Attachment>)>, GraphicsError> {
        let mut colors = Vec::with_capacity(self.state.colors.len());
        for handle in self.state.colors.clone() {
            match self.attachment(handle)? {
                Some(attachment) => colors.push(attachment),
                None => return Ok(None),
            }
        }
        let depth = match self.state.depth {
            Some(handle) => match self.attachment(handle)? {
                Some(attachment) => Some(attachment),
                None => return Ok(None),
            },
            None => None,
        };
        if colors.is_empty() && depth.is_none() {
            return Err(GraphicsError::Backend("no render targets bound".into()));
        }
        Ok(Some((colors, depth)))
    }

    /// The wgpu texture to copy from or to, acquiring the surface frame if needed.
    fn copy_texture_object(
        &mut self,
        handle: NativeHandle,
    ) -> Result<Option<(wgpu::Texture, TextureDescriptor)>, GraphicsError> {
        if let Some(Object::Surface(desc)) = self.objects.get(&handle) {
            let desc = desc.clone();
            if self.attachment(handle)?.is_none() {
                return Ok(None);
            }
            let texture = self
                .surface
                .as_ref()
                .and_then(|surface| surface.frame.as_ref())
                .map(|(frame, _)| frame.texture.clone());
            return Ok(texture.map(|texture| (texture, desc)));
        }
        let object = self.texture_object(handle)?;
        Ok(Some((object.texture.clone(), object.desc.clone())))
    }

    fn resolve_binding(
        &self,
        stage: ShaderStage,
        binding: &ResourceSlot,
    ) -> Result<Option<BoundResource>, GraphicsError> {
        let slot = binding.slot as usize;
        if slot >= SLOTS {
            return Err(GraphicsError::Backend(format!(
                "{stage} binding '{}' uses slot {slot}, the limit is {MAX_SLOTS}",
                binding.name
            )));
        }
        let index = stage.index();
        let resource = match binding.kind {
            ResourceKind::ConstantBuffer => match self.state.constant_buffers[index][slot] {
                Some(handle) => Some(BoundResource::Buffer(self.buffer_object(handle)?.0.clone())),
                None => None,
            },
            ResourceKind::Texture | ResourceKind::TextureCube | ResourceKind::Texture3d => {
                match self.state.textures[index][slot] {
                    Some(handle) => Some(BoundResource::View(self.texture_object(handle)?.view.clone())),
                    None => None,
                }
            }
            ResourceKind::Sampler | ResourceKind::ComparisonSampler => {
                match self.state.samplers[index][slot] {
                    Some(handle) => match self.objects.get(&handle) {
                        Some(Object::Sampler(sampler)) => Some(BoundResource::Sampler(sampler.clone())),
                        _ => return Err(not_live(handle, "sampler")),
                    },
                    None => None,
                }
            }
            ResourceKind::UnorderedAccess => match self.state.unordered_access[slot] {
                Some(handle) => match self.objects.get(&handle) {
                    Some(Object::Buffer { buffer, .. }) => Some(BoundResource::Buffer(buffer.clone())),
                    Some(Object::Texture(object)) => Some(BoundResource::View(storage_view(object))),
                    _ => return Err(not_live(handle, "buffer or texture")),
                },
                None => None,
            },
        };
        Ok(resource)
    }

    /// Bind groups for the given stages, resolved from the bound registers.
    ///
    /// Stages share one binding namespace, the first stage with something
    /// bound at a slot provides it.
    fn bind_groups(
        &self,
        stages: &[(ShaderStage, NativeHandle)],
        layout_for: impl Fn(u32) -> wgpu::BindGroupLayout,
    ) -> Result<Vec<wgpu::BindGroup>, GraphicsError> {
        let mut resources = BTreeMap::new();
        for (stage, handle) in stages {
            for binding in &self.shader_object(*handle)?.reflection.bindings {
                let key = (binding.group, binding.slot);
                if resources.contains_key(&key) {
                    continue;
                }
                if let Some(resource) = self.resolve_binding(*stage, binding)? {
                    resources.insert(key, resource);
                }
            }
        }
        for (stage, handle) in stages {
            for binding in &self.shader_object(*handle)?.reflection.bindings {
                if !resources.contains_key(&(binding.group, binding.slot)) {
                    return Err(GraphicsError::Backend(format!(
                        "{stage} shader reads '{}' ({:?} slot {}) but nothing is bound",
                        binding.name, binding.kind, binding.slot
                    )));
                }
            }
        }
        Ok(create_bind_groups(&self.device, layout_for, &resources))
    }

    fn render_pipeline(
        &mut self,
        key: &RenderPipelineKey,
    ) -> Result<wgpu::RenderPipeline, GraphicsError> {
        if let Some(pipeline) = self.pipelines.render(key) {
            return Ok(pipeline.clone());
        }

        let default_blend = BlendDescriptor::default();
        let default_depth = DepthStencilDescriptor::default();
        let default_raster = RasterizerDescriptor::default();
        let blend = match key.blend.map(|h| (h, self.objects.get(&h))) {
            Some((_, Some(Object::Blend(desc)))) => desc,
            Some((h, _)) => return Err(not_live(h, "blend state")),
            None => &default_blend,
        };
        let depth_stencil = match key.depth_stencil.map(|h| (h, self.objects.get(&h))) {
            Some((_, Some(Object::DepthStencil(desc)))) => desc,
            Some((h, _)) => return Err(not_live(h, "depth-stencil state")),
            None => &default_depth,
        };
        let rasterizer = match key.rasterizer.map(|h| (h, self.objects.get(&h))) {
            Some((_, Some(Object::Rasterizer(desc)))) => desc,
            Some((h, _)) => return Err(not_live(h, "rasterizer state")),
            None => &default_raster,
        };
        let input_layout = match key.input_layout.map(|h| (h, self.objects.get(&h))) {
            Some((_, Some(Object::InputLayout(desc)))) => Some(desc),
            Some((h, _)) => return Err(not_live(h, "input layout")),
            None => None,
        };
        let inputs = RenderPipelineInputs {
            vertex: self.shader_object(key.vertex)?,
            pixel: key.pixel.map(|h| self.shader_object(h)).transpose()?,
            input_layout,
            blend,
            depth_stencil,
            rasterizer,
            features: self.device.features(),
        };

        let pipeline = create_render_pipeline(&self.device, key, &inputs)?;
        self.pipelines.insert_render(key.clone(), pipeline.clone());
        log::debug!("built render pipeline, {} cached", self.pipelines.len());
        Ok(pipeline)
    }

    /// Reserve the next draw index of the innermost active occlusion query.
    fn next_occlusion_index(&mut self) -> Option<(wgpu::QuerySet, u32)> {
        let handle = *self.occlusion.last()?;
        let Some(Object::Query(query)) = self.objects.get_mut(&handle) else {
            return None;
        };
        if query.used >= OCCLUSION_CAPACITY {
            log::warn!(
                "occlusion query {} is full, further draws are not counted",
                handle.raw()
            );
            return None;
        }
        let index = query.used;
        query.used += 1;
        Some((query.set.clone(), index))
    }

    fn vertex_buffers(
        &self,
        layout: Option<&InputLayoutDescriptor>,
        slot_count: usize,
    ) -> Result<Vec<(u32, wgpu::Buffer, u64)>, GraphicsError> {
        let used = layout.map(|l| l.slots()).unwrap_or_default();
        let mut buffers = Vec::with_capacity(slot_count);
        let mut filler = None;
        for slot in 0..slot_count {
            match self.state.vertex_buffers[slot] {
                Some((handle, _, offset)) => {
                    let buffer = self.buffer_object(handle)?.0;
                    if offset >= buffer.size() {
                        return Err(GraphicsError::InvalidParameter(format!(
                            "vertex buffer offset {offset} is past the end of slot {slot}"
                        )));
                    }
                    filler.get_or_insert_with(|| buffer.clone());
                    buffers.push((slot as u32, buffer.clone(), offset));
                }
                None if used.contains(&(slot as u32)) => {
                    return Err(GraphicsError::Backend(format!(
                        "input layout reads vertex buffer slot {slot} but nothing is bound"
                    )));
                }
                None => {}
            }
        }
        // Slots between used ones have no attributes and take any buffer.
        let filled: Vec<u32> = buffers.iter().map(|(slot, ..)| *slot).collect();
        if let Some(filler) = filler {
            for slot in (0..slot_count as u32).filter(|s| !filled.contains(s)) {
                buffers.push((slot, filler.clone(), 0));
            }
        }
        Ok(buffers)
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn kind(&self) -> RenderBackend {
        RenderBackend::Wgpu
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn shader_dialect(&self) -> ShaderDialect {
        ShaderDialect::Wgsl
    }

    fn back_buffer(&self) -> NativeHandle {
        self.back_buffer
    }

    fn texture_info(&self, texture: NativeHandle) -> Option<TextureDescriptor> {
        match self.objects.get(&texture) {
            Some(Object::Texture(object)) => Some(object.desc.clone()),
            Some(Object::Surface(desc)) => Some(desc.clone()),
            _ => None,
        }
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GraphicsError> {
        let (width, height) = (width.max(1), height.max(1));
        self.flush();

        if let Some(surface) = &mut self.surface {
            surface.frame = None;
            surface.config.width = width;
            surface.config.height = height;
            surface.surface.configure(&self.device, &surface.config);
            if let Some(Object::Surface(desc)) = self.objects.get_mut(&self.back_buffer) {
                desc.width = width;
                desc.height = height;
            }
        } else {
            let mut desc = self.texture_object(self.back_buffer)?.desc.clone();
            desc.width = width;
            desc.height = height;
            let object = self.new_texture(&desc)?;
            self.objects.insert(self.back_buffer, Object::Texture(object));
        }
        log::debug!("back buffer resized to {width}x{height}");
        Ok(())
    }

    fn present(&mut self, vsync: bool) -> Result<(), GraphicsError> {
        self.flush();
        if let Some(surface) = &mut self.surface {
            if let Some((frame, view)) = surface.frame.take() {
                drop(view);
                frame.present();
            }
            let mode = surface.present_mode(vsync);
            if mode != surface.config.present_mode {
                log::debug!("present mode changed to {mode:?}");
                surface.config.present_mode = mode;
                surface.surface.configure(&self.device, &surface.config);
            }
        }
        self.device
            .poll(wgpu::PollType::Poll)
            .map_err(|e| GraphicsError::Backend(format!("device poll failed: {e}")))?;
        self.frame += 1;
        Ok(())
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError> {
        log::trace!(
            "wgpu: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let size = align4(desc.size.max(4));
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size,
            usage: convert_buffer_usage(desc),
            mapped_at_creation: false,
        });
        if let Some(data) = data {
            let len = data.len().min(desc.size as usize);
            let mut padded = data[..len].to_vec();
            padded.resize(align4(len as u64) as usize, 0);
            self.queue.write_buffer(&buffer, 0, &padded);
        }
        Ok(self.insert(Object::Buffer {
            buffer,
            desc: desc.clone(),
        }))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError> {
        log::trace!(
            "wgpu: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth
        );
        let object = self.new_texture(desc)?;
        if let Some(data) = data {
            let level0 = desc.level0_size();
            if data.len() < level0 {
                return Err(GraphicsError::InvalidParameter(format!(
                    "initial data is {} bytes, level 0 needs {level0}",
                    data.len()
                )));
            }
            match desc.kind {
                TextureKind::D3 => self.write_level(&object, 0, 0, &data[..level0])?,
                _ => {
                    let layer_size = level0 / desc.layers() as usize;
                    for (layer, chunk) in data[..level0].chunks_exact(layer_size).enumerate() {
                        self.write_level(&object, 0, layer as u32, chunk)?;
                    }
                }
            }
        }
        Ok(self.insert(Object::Texture(object)))
    }

    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        Ok(self.insert(Object::DepthStencil(desc.clone())))
    }

    fn create_rasterizer_state(
        &mut self,
        desc: &RasterizerDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        Ok(self.insert(Object::Rasterizer(desc.clone())))
    }

    fn create_blend_state(
        &mut self,
        desc: &BlendDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        Ok(self.insert(Object::Blend(desc.clone())))
    }

    fn create_sampler_state(
        &mut self,
        desc: &SamplerDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        let features = self.device.features();
        let address = |mode: AddressMode| {
            if mode == AddressMode::ClampToBorder
                && !features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER)
            {
                log::warn!("clamp-to-border addressing is not supported, clamping to edge");
                return wgpu::AddressMode::ClampToEdge;
            }
            convert_address_mode(mode)
        };
        let modes = [
            address(desc.address_u),
            address(desc.address_v),
            address(desc.address_w),
        ];
        let all_linear = [desc.mag_filter, desc.min_filter, desc.mip_filter]
            .iter()
            .all(|f| *f == FilterMode::Linear);

        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: modes[0],
            address_mode_v: modes[1],
            address_mode_w: modes[2],
            mag_filter: convert_filter_mode(desc.mag_filter),
            min_filter: convert_filter_mode(desc.min_filter),
            mipmap_filter: convert_mipmap_filter_mode(desc.mip_filter),
            lod_min_clamp: desc.lod_min,
            lod_max_clamp: desc.lod_max,
            compare: desc.compare.map(convert_compare_function),
            anisotropy_clamp: if all_linear {
                desc.max_anisotropy.clamp(1, 16)
            } else {
                1
            },
            border_color: modes
                .contains(&wgpu::AddressMode::ClampToBorder)
                .then_some(wgpu::SamplerBorderColor::TransparentBlack),
        });
        Ok(self.insert(Object::Sampler(sampler)))
    }

    fn create_input_layout(
        &mut self,
        desc: &InputLayoutDescriptor,
        signature: &[VertexInput],
    ) -> Result<NativeHandle, GraphicsError> {
        for input in signature {
            match desc.elements.iter().find(|e| e.location == input.location) {
                None => {
                    return Err(GraphicsError::creation(format!(
                        "vertex input '{}' at location {} has no layout element",
                        input.name, input.location
                    )));
                }
                Some(element) if element.format.components() < input.format.components() => {
                    log::warn!(
                        "vertex input '{}' reads {:?} from a {:?} attribute",
                        input.name,
                        input.format,
                        element.format
                    );
                }
                Some(_) => {}
            }
        }
        Ok(self.insert(Object::InputLayout(desc.clone())))
    }

    fn compile_stage(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<Vec<u8>, GraphicsError> {
        if stage.to_naga().is_none() {
            return Err(GraphicsError::UnsupportedTarget(format!(
                "wgpu has no {stage} stage"
            )));
        }
        if !source.contains(entry_point) {
            return Err(GraphicsError::ShaderCompilation {
                stage,
                diagnostic: format!("entry point '{entry_point}' not found"),
            });
        }
        Ok(source.as_bytes().to_vec())
    }

    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        binary: &StageBinary,
    ) -> Result<NativeHandle, GraphicsError> {
        if stage.to_naga().is_none() {
            return Err(GraphicsError::UnsupportedTarget(format!(
                "wgpu has no {stage} stage"
            )));
        }
        let source =
            std::str::from_utf8(&binary.code).map_err(|e| GraphicsError::ShaderCompilation {
                stage,
                diagnostic: format!("stage binary is not WGSL text: {e}"),
            })?;

        let scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(binary.entry_point.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(GraphicsError::ShaderCompilation {
                stage,
                diagnostic: error.to_string(),
            });
        }

        Ok(self.insert(Object::Shader(ShaderObject {
            module,
            entry_point: binary.entry_point.clone(),
            reflection: binary.reflection.clone(),
        })))
    }

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeHandle, GraphicsError> {
        let (ty, count) = match kind {
            QueryKind::Occlusion => (wgpu::QueryType::Occlusion, OCCLUSION_CAPACITY),
            QueryKind::Timestamp => {
                let required = wgpu::Features::TIMESTAMP_QUERY
                    | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
                if !self.device.features().contains(required) {
                    return Err(GraphicsError::creation(
                        "timestamp queries are not supported by this adapter",
                    ));
                }
                (wgpu::QueryType::Timestamp, 1)
            }
        };
        let set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("query"),
            ty,
            count,
        });
        let size = count as u64 * QUERY_SIZE;
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("query resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("query readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.insert(Object::Query(QueryObject {
            kind,
            set,
            resolve,
            readback,
            used: 0,
            state: QueryState::Idle,
        })))
    }

    fn release(&mut self, handle: NativeHandle) {
        if handle == self.back_buffer {
            return;
        }
        let Some(object) = self.objects.remove(&handle) else {
            return;
        };
        self.state.forget(handle);
        self.occlusion.retain(|query| *query != handle);
        if matches!(
            object,
            Object::Shader(_)
                | Object::InputLayout(_)
                | Object::Blend(_)
                | Object::DepthStencil(_)
                | Object::Rasterizer(_)
        ) {
            self.pipelines.purge(handle);
        }
        log::trace!("wgpu: released {}", handle.raw());
    }

    fn bind_depth_stencil_state(&mut self, state: Option<NativeHandle>, stencil_ref: u32) {
        self.state.depth_stencil = state;
        self.state.stencil_ref = stencil_ref;
    }

    fn bind_rasterizer_state(&mut self, state: Option<NativeHandle>) {
        self.state.rasterizer = state;
    }

    fn bind_blend_state(&mut self, state: Option<NativeHandle>) {
        self.state.blend = state;
    }

    fn bind_input_layout(&mut self, layout: Option<NativeHandle>) {
        self.state.input_layout = layout;
    }

    fn bind_shader_stage(&mut self, stage: ShaderStage, shader: Option<NativeHandle>) {
        self.state.shaders[stage.index()] = shader;
    }

    fn bind_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: Option<NativeHandle>,
        stride: u32,
        offset: u64,
    ) {
        if let Some(entry) = self.state.vertex_buffers.get_mut(slot as usize) {
            *entry = buffer.map(|handle| (handle, stride, offset));
        }
    }

    fn bind_index_buffer(&mut self, buffer: Option<NativeHandle>, format: IndexFormat, offset: u64) {
        self.state.index_buffer = buffer.map(|handle| (handle, format, offset));
    }

    fn bind_constant_buffer(
        &mut self,
        stages: ShaderStages,
        slot: u32,
        buffer: Option<NativeHandle>,
    ) {
        BoundState::bind_staged(&mut self.state.constant_buffers, stages, slot, buffer);
    }

    fn bind_texture(&mut self, stages: ShaderStages, slot: u32, texture: Option<NativeHandle>) {
        BoundState::bind_staged(&mut self.state.textures, stages, slot, texture);
    }

    fn bind_sampler(&mut self, stages: ShaderStages, slot: u32, sampler: Option<NativeHandle>) {
        BoundState::bind_staged(&mut self.state.samplers, stages, slot, sampler);
    }

    fn bind_unordered_access(&mut self, slot: u32, resource: Option<NativeHandle>) {
        if let Some(entry) = self.state.unordered_access.get_mut(slot as usize) {
            *entry = resource;
        }
    }

    fn bind_render_targets(&mut self, colors: &[NativeHandle], depth: Option<NativeHandle>) {
        self.state.colors = colors.to_vec();
        self.state.depth = depth;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.state.viewport = Some(*viewport);
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        self.state.scissor = Some(*rect);
    }

    fn set_topology(&mut self, topology: PrimitiveTopology) {
        self.state.topology = topology;
    }

    fn clear_state(&mut self) {
        self.state = BoundState::default();
    }

    fn clear_render_target(
        &mut self,
        target: NativeHandle,
        color: Color,
    ) -> Result<(), GraphicsError> {
        let Some(attachment) = self.attachment(target)? else {
            return Ok(());
        };
        if attachment.format.has_depth_aspect() {
            return Err(GraphicsError::InvalidParameter(
                "clear_render_target on a depth target".into(),
            ));
        }
        let encoder = pending_encoder(&mut self.encoder, &self.device);
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear color"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &attachment.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(convert_color(color)),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        Ok(())
    }

    fn clear_depth_stencil(
        &mut self,
        target: NativeHandle,
        depth: f32,
        stencil: u8,
    ) -> Result<(), GraphicsError> {
        let Some(attachment) = self.attachment(target)? else {
            return Ok(());
        };
        if !attachment.format.has_depth_aspect() {
            return Err(GraphicsError::InvalidParameter(
                "clear_depth_stencil on a color target".into(),
            ));
        }
        let encoder = pending_encoder(&mut self.encoder, &self.device);
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear depth"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &attachment.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(depth.clamp(0.0, 1.0)),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: attachment.format.has_stencil_aspect().then_some(
                    wgpu::Operations {
                        load: wgpu::LoadOp::Clear(stencil as u32),
                        store: wgpu::StoreOp::Store,
                    },
                ),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        Ok(())
    }

    fn draw(&mut self, call: DrawCall) -> Result<(), GraphicsError> {
        let vertex = self.state.shaders[ShaderStage::Vertex.index()]
            .ok_or_else(|| GraphicsError::Backend("draw without a vertex shader".into()))?;
        let pixel = self.state.shaders[ShaderStage::Pixel.index()];

        let Some((colors, depth)) = self.bound_attachments()? else {
            log::debug!("draw skipped, back buffer unavailable");
            return Ok(());
        };

        let index = match call {
            DrawCall::Indexed { .. } => {
                let (handle, format, offset) = self.state.index_buffer.ok_or_else(|| {
                    GraphicsError::Backend("indexed draw without an index buffer".into())
                })?;
                Some((self.buffer_object(handle)?.0.clone(), convert_index_format(format), offset))
            }
            DrawCall::Vertices { .. } => None,
        };

        let layout = match self.state.input_layout {
            Some(handle) => match self.objects.get(&handle) {
                Some(Object::InputLayout(desc)) => Some(desc.clone()),
                _ => return Err(not_live(handle, "input layout")),
            },
            None => None,
        };
        let slot_count = layout
            .as_ref()
            .and_then(|l| l.slots().last().map(|slot| *slot as usize + 1))
            .unwrap_or(0)
            .min(SLOTS);
        let strides = (0..slot_count)
            .map(|slot| {
                self.state.vertex_buffers[slot]
                    .map(|(_, stride, _)| stride)
                    .filter(|stride| *stride > 0)
                    .or_else(|| layout.as_ref().map(|l| l.stride(slot as u32)))
                    .unwrap_or(0)
            })
            .collect();

        let key = RenderPipelineKey {
            vertex,
            pixel,
            input_layout: self.state.input_layout,
            strides,
            blend: self.state.blend,
            depth_stencil: self.state.depth_stencil,
            rasterizer: self.state.rasterizer,
            topology: self.state.topology,
            strip_index_format: index
                .as_ref()
                .filter(|_| self.state.topology.is_strip())
                .map(|(_, format, _)| *format),
            color_formats: colors.iter().map(|a| a.format).collect(),
            depth_format: depth.as_ref().map(|a| a.format),
        };
        let pipeline = self.render_pipeline(&key)?;

        let mut stages = vec![(ShaderStage::Vertex, vertex)];
        stages.extend(pixel.map(|pixel| (ShaderStage::Pixel, pixel)));
        let bind_groups = self.bind_groups(&stages, |group| pipeline.get_bind_group_layout(group))?;
        let vertex_buffers = self.vertex_buffers(layout.as_ref(), slot_count)?;

        let (width, height) = colors
            .first()
            .or(depth.as_ref())
            .map(|a| (a.width, a.height))
            .unwrap_or((1, 1));
        let viewport = self
            .state
            .viewport
            .unwrap_or_else(|| Viewport::from_dimensions(width, height));
        let x = viewport.x.clamp(0.0, width as f32);
        let y = viewport.y.clamp(0.0, height as f32);
        let w = viewport.width.min(width as f32 - x);
        let h = viewport.height.min(height as f32 - y);
        if w <= 0.0 || h <= 0.0 {
            log::trace!("draw skipped, empty viewport");
            return Ok(());
        }

        let scissor_enabled = match self.state.rasterizer.map(|h| self.objects.get(&h)) {
            Some(Some(Object::Rasterizer(desc))) => desc.scissor_enable,
            _ => false,
        };
        let scissor = match self.state.scissor {
            Some(rect) if scissor_enabled => {
                let sx = rect.x.min(width);
                let sy = rect.y.min(height);
                (sx, sy, rect.width.min(width - sx), rect.height.min(height - sy))
            }
            _ => (0, 0, width, height),
        };
        if scissor.2 == 0 || scissor.3 == 0 {
            log::trace!("draw skipped, empty scissor");
            return Ok(());
        }

        let blend_constant = match self.state.blend.map(|h| self.objects.get(&h)) {
            Some(Some(Object::Blend(desc))) => desc.blend_factor,
            _ => [1.0; 4],
        };
        let stencil_ref = self.state.stencil_ref;
        let occlusion = self.next_occlusion_index();

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = colors
            .iter()
            .map(|a| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &a.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_attachment = depth.as_ref().map(|a| wgpu::RenderPassDepthStencilAttachment {
            view: &a.view,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: a.format.has_stencil_aspect().then_some(wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            }),
        });

        let encoder = pending_encoder(&mut self.encoder, &self.device);
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("draw"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_attachment,
            timestamp_writes: None,
            occlusion_query_set: occlusion.as_ref().map(|(set, _)| set),
            multiview_mask: None,
        });
        pass.set_pipeline(&pipeline);
        for (group, bind_group) in bind_groups.iter().enumerate() {
            pass.set_bind_group(group as u32, bind_group, &[]);
        }
        for (slot, buffer, offset) in &vertex_buffers {
            pass.set_vertex_buffer(*slot, buffer.slice(*offset..));
        }
        if let Some((buffer, format, offset)) = &index {
            pass.set_index_buffer(buffer.slice(*offset..), *format);
        }
        pass.set_viewport(
            x,
            y,
            w,
            h,
            viewport.min_depth.clamp(0.0, 1.0),
            viewport.max_depth.clamp(0.0, 1.0),
        );
        pass.set_scissor_rect(scissor.0, scissor.1, scissor.2, scissor.3);
        pass.set_stencil_reference(stencil_ref);
        pass.set_blend_constant(wgpu::Color {
            r: blend_constant[0] as f64,
            g: blend_constant[1] as f64,
            b: blend_constant[2] as f64,
            a: blend_constant[3] as f64,
        });

        if let Some((_, query_index)) = &occlusion {
            pass.begin_occlusion_query(*query_index);
        }
        match call {
            DrawCall::Vertices {
                vertex_count,
                first_vertex,
                instance_count,
                first_instance,
            } => pass.draw(
                first_vertex..first_vertex + vertex_count,
                first_instance..first_instance + instance_count,
            ),
            DrawCall::Indexed {
                index_count,
                first_index,
                base_vertex,
                instance_count,
                first_instance,
            } => pass.draw_indexed(
                first_index..first_index + index_count,
                base_vertex,
                first_instance..first_instance + instance_count,
            ),
        }
        if occlusion.is_some() {
            pass.end_occlusion_query();
        }
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), GraphicsError> {
        let compute = self.state.shaders[ShaderStage::Compute.index()]
            .ok_or_else(|| GraphicsError::Backend("dispatch without a compute shader".into()))?;

        let cached = self.pipelines.compute(compute).cloned();
        let pipeline = match cached {
            Some(pipeline) => pipeline,
            None => {
                let pipeline = create_compute_pipeline(&self.device, self.shader_object(compute)?)?;
                self.pipelines.insert_compute(compute, pipeline.clone());
                pipeline
            }
        };
        let bind_groups = self.bind_groups(&[(ShaderStage::Compute, compute)], |group| {
            pipeline.get_bind_group_layout(group)
        })?;

        let encoder = pending_encoder(&mut self.encoder, &self.device);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("dispatch"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        for (group, bind_group) in bind_groups.iter().enumerate() {
            pass.set_bind_group(group as u32, bind_group, &[]);
        }
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn update_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let (native, desc) = self.buffer_object(buffer)?;
        let Some(end) = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= desc.size)
        else {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                desc.size
            )));
        };
        if data.is_empty() {
            return Ok(());
        }
        let native = native.clone();
        self.flush();

        let start = offset & !3;
        let aligned_end = align4(end);
        if start == offset && aligned_end == end {
            self.queue.write_buffer(&native, offset, data);
        } else {
            // Queue writes need 4-byte granularity, patch the covering words.
            let mut words = self.read_range(&native, start, aligned_end - start)?;
            let from = (offset - start) as usize;
            words[from..from + data.len()].copy_from_slice(data);
            self.queue.write_buffer(&native, start, &words);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: NativeHandle) -> Result<Vec<u8>, GraphicsError> {
        let (native, desc) = self.buffer_object(buffer)?;
        let (native, size) = (native.clone(), desc.size);
        let mut data = self.read_range(&native, 0, native.size())?;
        data.truncate(size as usize);
        Ok(data)
    }

    fn update_texture(
        &mut self,
        texture: NativeHandle,
        mip_level: u32,
        layer: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let desc = &self.texture_object(texture)?.desc;
        if mip_level >= desc.mip_levels.max(1) || layer >= desc.layers() {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip {mip_level} layer {layer} out of range"
            )));
        }
        self.flush();
        self.write_level(self.texture_object(texture)?, mip_level, layer, data)
    }

    fn copy_buffer(
        &mut self,
        dst: NativeHandle,
        src: NativeHandle,
        size: u64,
    ) -> Result<(), GraphicsError> {
        let (source, source_desc) = self.buffer_object(src)?;
        let (target, target_desc) = self.buffer_object(dst)?;
        let size = size.min(source_desc.size).min(target_desc.size);
        if size == 0 {
            return Ok(());
        }
        let (source, target) = (source.clone(), target.clone());
        let size = align4(size).min(source.size()).min(target.size());
        let encoder = pending_encoder(&mut self.encoder, &self.device);
        encoder.copy_buffer_to_buffer(&source, 0, &target, 0, size);
        Ok(())
    }

    fn copy_texture(&mut self, dst: NativeHandle, src: NativeHandle) -> Result<(), GraphicsError> {
        let Some((source, source_desc)) = self.copy_texture_object(src)? else {
            return Ok(());
        };
        let Some((target, target_desc)) = self.copy_texture_object(dst)? else {
            return Ok(());
        };
        if source_desc.width != target_desc.width
            || source_desc.height != target_desc.height
            || source_desc.format != target_desc.format
        {
            return Err(GraphicsError::InvalidParameter(
                "copy_texture requires matching size and format".into(),
            ));
        }

        let levels = source.mip_level_count().min(target.mip_level_count());
        let layers = source
            .depth_or_array_layers()
            .min(target.depth_or_array_layers());
        let encoder = pending_encoder(&mut self.encoder, &self.device);
        for mip_level in 0..levels {
            let depth_or_array_layers = match source_desc.kind {
                TextureKind::D3 => (layers >> mip_level).max(1),
                _ => layers,
            };
            encoder.copy_texture_to_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &source,
                    mip_level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyTextureInfo {
                    texture: &target,
                    mip_level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: (source_desc.width >> mip_level).max(1),
                    height: (source_desc.height >> mip_level).max(1),
                    depth_or_array_layers,
                },
            );
        }
        Ok(())
    }

    fn generate_mips(&mut self, texture: NativeHandle) -> Result<(), GraphicsError> {
        let object = self.texture_object(texture)?;
        if object.texture.mip_level_count() <= 1 {
            return Ok(());
        }
        let (native, desc) = (object.texture.clone(), object.desc.clone());
        let generator = self
            .mips
            .get_or_insert_with(|| MipGenerator::new(&self.device));
        let encoder = pending_encoder(&mut self.encoder, &self.device);
        generator.generate(&self.device, encoder, &native, &desc)
    }

    fn begin_query(&mut self, query: NativeHandle) {
        let Some(Object::Query(object)) = self.objects.get_mut(&query) else {
            log::warn!("begin_query on {} which is not a live query", query.raw());
            return;
        };
        if matches!(object.state, QueryState::Mapping(_)) {
            object.readback.unmap();
        }
        object.state = QueryState::Active;
        object.used = 0;
        if object.kind == QueryKind::Occlusion {
            self.occlusion.retain(|q| *q != query);
            self.occlusion.push(query);
        }
    }

    fn end_query(&mut self, query: NativeHandle) {
        let Some(Object::Query(object)) = self.objects.get_mut(&query) else {
            log::warn!("end_query on {} which is not a live query", query.raw());
            return;
        };
        self.occlusion.retain(|q| *q != query);

        let encoder = pending_encoder(&mut self.encoder, &self.device);
        match object.kind {
            QueryKind::Occlusion => {
                if !matches!(object.state, QueryState::Active) {
                    log::warn!("end_query on occlusion query {} that was not begun", query.raw());
                    return;
                }
                if object.used == 0 {
                    object.state = QueryState::Ready(0);
                    return;
                }
            }
            // Timestamps only have an end.
            QueryKind::Timestamp => {
                encoder.write_timestamp(&object.set, 0);
                object.used = 1;
            }
        }
        encoder.resolve_query_set(&object.set, 0..object.used, &object.resolve, 0);
        encoder.copy_buffer_to_buffer(
            &object.resolve,
            0,
            &object.readback,
            0,
            object.used as u64 * QUERY_SIZE,
        );
        object.state = QueryState::Resolved;
    }

    fn query_result(&mut self, query: NativeHandle) -> Result<Option<u64>, GraphicsError> {
        if matches!(
            self.objects.get(&query),
            Some(Object::Query(QueryObject {
                state: QueryState::Resolved,
                ..
            }))
        ) {
            self.flush();
        }
        let period = self.queue.get_timestamp_period() as f64;
        let Some(Object::Query(object)) = self.objects.get_mut(&query) else {
            return Err(not_live(query, "query"));
        };

        if matches!(object.state, QueryState::Resolved) {
            let (sender, receiver) = crossbeam_channel::bounded(1);
            object
                .readback
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = sender.send(result);
                });
            object.state = QueryState::Mapping(receiver);
        }

        if let QueryState::Mapping(receiver) = &object.state {
            let _ = self.device.poll(wgpu::PollType::Poll);
            match receiver.try_recv() {
                Ok(Ok(())) => {
                    let values: Vec<u64> = object
                        .readback
                        .slice(..)
                        .get_mapped_range()
                        .chunks_exact(QUERY_SIZE as usize)
                        .take(object.used as usize)
                        .map(bytemuck::pod_read_unaligned::<u64>)
                        .collect();
                    object.readback.unmap();
                    let value = match object.kind {
                        QueryKind::Occlusion => values.iter().sum(),
                        QueryKind::Timestamp => {
                            (values.first().copied().unwrap_or(0) as f64 * period) as u64
                        }
                    };
                    object.state = QueryState::Ready(value);
                }
                Ok(Err(e)) => {
                    object.state = QueryState::Idle;
                    return Err(GraphicsError::Backend(format!("query readback failed: {e}")));
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    object.state = QueryState::Idle;
                    return Err(GraphicsError::Backend("query readback was cancelled".into()));
                }
            }
        }

        match object.state {
            QueryState::Ready(value) => Ok(Some(value)),
            QueryState::Active => Ok(None),
            _ => Err(GraphicsError::InvalidParameter(format!(
                "query {} was never ended",
                query.raw()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferKind;

    fn backend() -> Option<WgpuBackend> {
        let desc = DeviceDescriptor::new().with_size(64, 64);
        match WgpuBackend::new(&desc) {
            Ok(backend) => Some(backend),
            Err(e) => {
                log::warn!("skipping wgpu test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_forget_clears_every_register() {
        let mut state = BoundState::default();
        let handle = NativeHandle(7);
        let other = NativeHandle(8);
        BoundState::bind_staged(&mut state.textures, ShaderStages::GRAPHICS, 3, Some(handle));
        state.vertex_buffers[0] = Some((handle, 16, 0));
        state.colors = vec![other, handle];
        state.blend = Some(handle);
        state.depth = Some(other);

        state.forget(handle);
        assert!(state.textures.iter().flatten().all(Option::is_none));
        assert_eq!(state.vertex_buffers[0], None);
        assert_eq!(state.colors, vec![other]);
        assert_eq!(state.blend, None);
        assert_eq!(state.depth, Some(other));
    }

    #[test]
    fn test_bind_staged_ignores_out_of_range_slots() {
        let mut state = BoundState::default();
        BoundState::bind_staged(
            &mut state.samplers,
            ShaderStages::PIXEL,
            MAX_SLOTS,
            Some(NativeHandle(1)),
        );
        assert!(state.samplers.iter().flatten().all(Option::is_none));

        BoundState::bind_staged(&mut state.samplers, ShaderStages::PIXEL, 2, Some(NativeHandle(1)));
        assert_eq!(state.samplers[ShaderStage::Pixel.index()][2], Some(NativeHandle(1)));
        assert_eq!(state.samplers[ShaderStage::Vertex.index()][2], None);
    }

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(16), 16);
        assert_eq!(align4(17), 20);
    }

    #[test]
    fn test_buffer_round_trip() {
        let Some(mut backend) = backend() else {
            return;
        };
        let desc = BufferDescriptor::new(BufferKind::Constant, 16);
        let buffer = backend
            .create_buffer(&desc, Some(&[1u8; 16]))
            .unwrap();
        backend.update_buffer(buffer, 5, &[9, 9]).unwrap();

        let data = backend.read_buffer(buffer).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[4..8], &[1, 9, 9, 1]);
    }

    #[test]
    fn test_offscreen_back_buffer_resizes() {
        let Some(mut backend) = backend() else {
            return;
        };
        let back = backend.back_buffer();
        assert_eq!(backend.texture_info(back).unwrap().width, 64);
        backend.resize(32, 16).unwrap();
        let info = backend.texture_info(back).unwrap();
        assert_eq!((info.width, info.height), (32, 16));
        backend.release(back);
        assert!(backend.texture_info(back).is_some());
    }
}
