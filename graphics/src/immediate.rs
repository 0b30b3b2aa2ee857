//! Immediate-mode debug drawing.
//!
//! ```ignore
//! device.im_set_transform(view_proj);
//! device.im_begin(PrimitiveTopology::LineList);
//! device.im_color(Color::new(1.0, 0.0, 0.0, 1.0));
//! device.im_vertex([0.0, 0.0, 0.0]);
//! device.im_vertex([1.0, 0.0, 0.0]);
//! device.im_end()?;
//! ```
//!
//! Vertices accumulate on the CPU between `im_begin` and `im_end`. `im_end`
//! uploads them into a dynamic vertex buffer that grows by doubling, binds
//! the built-in `immediate.wgsl` shader and draws straight through the
//! backend. The register cache slots it touched are invalidated afterwards
//! so the next cached setter rebinds, and the device's current shader is
//! bound again.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::backend::{DrawCall, NativeHandle};
use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::regs::{RegisterKey, RegisterKind};
use crate::release::ReleaseQueue;
use crate::resources::{
    BlendState, Buffer, DepthStencilState, RasterizerState, SamplerState, Texture,
};
use crate::shader::sections::IMMEDIATE_SECTION;
use crate::shader::{Shader, ShaderDescriptor, ShaderStage};
use crate::types::{
    BlendDescriptor, BufferDescriptor, BufferKind, Color, DepthStencilDescriptor,
    InputLayoutDescriptor, PrimitiveTopology, RasterizerDescriptor, ResourceUsage,
    SamplerDescriptor, ShaderStages, VertexFormat,
};

/// Initial vertex buffer capacity (number of vertices).
const DEFAULT_VERTEX_CAPACITY: u32 = 4096;

/// Column-major identity.
const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Vertex layout of the immediate shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct ImmediateVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

impl ImmediateVertex {
    pub fn layout() -> InputLayoutDescriptor {
        InputLayoutDescriptor::packed(&[
            VertexFormat::Float32x3,
            VertexFormat::Float32x4,
            VertexFormat::Float32x2,
        ])
    }
}

static_assertions::const_assert_eq!(std::mem::size_of::<ImmediateVertex>(), 36);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ImmediateConstants {
    transform: [[f32; 4]; 4],
}

/// One finished `im_begin`/`im_end` block.
pub(crate) struct ImmediateBatch {
    pub topology: PrimitiveTopology,
    pub vertices: Vec<ImmediateVertex>,
    pub transform: [[f32; 4]; 4],
    pub texture: Option<Arc<Texture>>,
}

/// GPU objects created on the first `im_end`.
struct ImmediateResources {
    shader: Arc<Shader>,
    textured_shader: Arc<Shader>,
    layout: NativeHandle,
    vertex_buffer: Arc<Buffer>,
    capacity: u32,
    constants: Arc<Buffer>,
    blend: BlendState,
    depth_stencil: DepthStencilState,
    rasterizer: RasterizerState,
    sampler: SamplerState,
    release: ReleaseQueue,
}

/// CPU side of the immediate path.
pub(crate) struct ImmediateDrawer {
    topology: Option<PrimitiveTopology>,
    vertices: Vec<ImmediateVertex>,
    color: [f32; 4],
    uv: [f32; 2],
    transform: [[f32; 4]; 4],
    texture: Option<Arc<Texture>>,
    resources: Option<ImmediateResources>,
}

impl Default for ImmediateDrawer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediateDrawer {
    pub fn new() -> Self {
        Self {
            topology: None,
            vertices: Vec::new(),
            color: Color::WHITE.to_array(),
            uv: [0.0; 2],
            transform: IDENTITY,
            texture: None,
            resources: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.topology.is_some()
    }

    pub fn begin(&mut self, topology: PrimitiveTopology) {
        debug_assert!(self.topology.is_none(), "im_begin called twice");
        if self.topology.is_some() {
            log::warn!(
                "im_begin while recording, discarding {} vertices",
                self.vertices.len()
            );
        }
        self.topology = Some(topology);
        self.vertices.clear();
    }

    pub fn vertex(&mut self, position: [f32; 3]) {
        debug_assert!(self.topology.is_some(), "im_vertex outside im_begin/im_end");
        if self.topology.is_none() {
            log::warn!("im_vertex outside im_begin/im_end");
            return;
        }
        self.vertices.push(ImmediateVertex {
            position,
            color: self.color,
            uv: self.uv,
        });
    }

    pub fn color(&mut self, color: Color) {
        self.color = color.to_array();
    }

    pub fn texcoord(&mut self, uv: [f32; 2]) {
        self.uv = uv;
    }

    pub fn set_transform(&mut self, transform: [[f32; 4]; 4]) {
        self.transform = transform;
    }

    pub fn set_texture(&mut self, texture: Option<Arc<Texture>>) {
        self.texture = texture;
    }

    /// Finish recording. `None` if nothing was being recorded.
    pub fn end(&mut self) -> Option<ImmediateBatch> {
        debug_assert!(self.topology.is_some(), "im_end without im_begin");
        let topology = self.topology.take()?;
        Some(ImmediateBatch {
            topology,
            vertices: std::mem::take(&mut self.vertices),
            transform: self.transform,
            texture: self.texture.clone(),
        })
    }

    /// Drop GPU objects, e.g. before the device goes away.
    pub fn release_resources(&mut self) {
        self.resources = None;
    }
}

/// Register slots driven by `im_end`.
fn touched_registers() -> Vec<RegisterKey> {
    let mut keys: Vec<RegisterKey> = ShaderStage::ALL
        .into_iter()
        .map(|stage| RegisterKey::global(RegisterKind::Shader(stage)))
        .collect();
    keys.extend([
        RegisterKey::global(RegisterKind::InputLayout),
        RegisterKey::slot(RegisterKind::VertexBuffer, ShaderStages::VERTEX, 0),
        RegisterKey::slot(RegisterKind::ConstantBuffer, ShaderStages::VERTEX, 0),
        RegisterKey::slot(RegisterKind::Texture, ShaderStages::PIXEL, 0),
        RegisterKey::slot(RegisterKind::Sampler, ShaderStages::PIXEL, 0),
        RegisterKey::global(RegisterKind::BlendState),
        RegisterKey::global(RegisterKind::DepthStencilState),
        RegisterKey::global(RegisterKind::RasterizerState),
        RegisterKey::global(RegisterKind::Topology),
    ]);
    keys
}

impl GraphicsDevice {
    /// Start recording primitives of `topology`.
    pub fn im_begin(&mut self, topology: PrimitiveTopology) {
        self.immediate.begin(topology);
    }

    /// Emit a vertex with the current color and texture coordinate.
    pub fn im_vertex(&mut self, position: [f32; 3]) {
        self.immediate.vertex(position);
    }

    /// Color of subsequent vertices.
    pub fn im_color(&mut self, color: Color) {
        self.immediate.color(color);
    }

    /// Texture coordinate of subsequent vertices.
    pub fn im_texcoord(&mut self, uv: [f32; 2]) {
        self.immediate.texcoord(uv);
    }

    /// Column-major view-projection applied to immediate vertices.
    pub fn im_set_transform(&mut self, view_proj: [[f32; 4]; 4]) {
        self.immediate.set_transform(view_proj);
    }

    /// Texture modulating immediate vertices, `None` for vertex colors only.
    pub fn im_set_texture(&mut self, texture: Option<&Arc<Texture>>) {
        self.immediate.set_texture(texture.cloned());
    }

    /// Finish the current block and draw it into the bound render targets.
    pub fn im_end(&mut self) -> Result<(), GraphicsError> {
        let Some(batch) = self.immediate.end() else {
            log::warn!("im_end without im_begin");
            return Ok(());
        };
        if batch.vertices.is_empty() {
            return Ok(());
        }

        let result = self.draw_immediate(&batch);
        for key in touched_registers() {
            self.regs.invalidate(&key);
        }
        let shader = self.current_shader().cloned();
        self.set_shader(shader.as_ref());
        result
    }

    fn draw_immediate(&mut self, batch: &ImmediateBatch) -> Result<(), GraphicsError> {
        if self.immediate.resources.is_none() {
            self.immediate.resources = Some(self.create_immediate_resources()?);
        }
        let vertex_count = batch.vertices.len() as u32;
        self.reserve_immediate_vertices(vertex_count)?;

        let Some(res) = self.immediate.resources.as_ref() else {
            return Err(GraphicsError::Internal("immediate resources missing".into()));
        };
        let shader = if batch.texture.is_some() {
            &res.textured_shader
        } else {
            &res.shader
        };
        let stride = std::mem::size_of::<ImmediateVertex>() as u32;
        let constants = ImmediateConstants {
            transform: batch.transform,
        };

        let backend = self.backend.as_mut();
        backend.update_buffer(
            res.vertex_buffer.native(),
            0,
            bytemuck::cast_slice(&batch.vertices),
        )?;
        backend.update_buffer(res.constants.native(), 0, bytemuck::bytes_of(&constants))?;

        for stage in ShaderStage::ALL {
            backend.bind_shader_stage(stage, shader.stage(stage).map(|s| s.native()));
        }
        backend.bind_input_layout(Some(res.layout));
        backend.bind_vertex_buffer(0, Some(res.vertex_buffer.native()), stride, 0);
        backend.bind_constant_buffer(ShaderStages::VERTEX, 0, Some(res.constants.native()));
        if let Some(texture) = &batch.texture {
            backend.bind_texture(ShaderStages::PIXEL, 0, Some(texture.native()));
            backend.bind_sampler(ShaderStages::PIXEL, 0, Some(res.sampler.native()));
        }
        backend.bind_blend_state(Some(res.blend.native()));
        backend.bind_depth_stencil_state(Some(res.depth_stencil.native()), 0);
        backend.bind_rasterizer_state(Some(res.rasterizer.native()));
        backend.set_topology(batch.topology);
        backend.draw(DrawCall::Vertices {
            vertex_count,
            first_vertex: 0,
            instance_count: 1,
            first_instance: 0,
        })
    }

    /// Grow the vertex buffer to hold `count` vertices, doubling its capacity.
    fn reserve_immediate_vertices(&mut self, count: u32) -> Result<(), GraphicsError> {
        let capacity = match &self.immediate.resources {
            Some(res) if res.capacity >= count => return Ok(()),
            Some(res) => res.capacity,
            None => return Ok(()),
        };
        let mut new_capacity = capacity.max(1);
        while new_capacity < count {
            new_capacity *= 2;
        }
        log::debug!("Growing immediate vertex buffer: {capacity} -> {new_capacity} vertices");
        let buffer = self.create_buffer(&immediate_vertex_buffer(new_capacity), None)?;
        if let Some(res) = self.immediate.resources.as_mut() {
            res.vertex_buffer = buffer;
            res.capacity = new_capacity;
        }
        Ok(())
    }

    fn create_immediate_resources(&mut self) -> Result<ImmediateResources, GraphicsError> {
        let shader = self.create_shader(&ShaderDescriptor::new(
            "immediate.wgsl",
            IMMEDIATE_SECTION,
        ))?;
        let textured_shader = self.create_shader(
            &ShaderDescriptor::new("immediate.wgsl", IMMEDIATE_SECTION)
                .with_define("IM_TEXTURED", ""),
        )?;
        let layout = self
            .backend
            .create_input_layout(&ImmediateVertex::layout(), shader.signature())?;

        let vertex_buffer =
            self.create_buffer(&immediate_vertex_buffer(DEFAULT_VERTEX_CAPACITY), None)?;
        let constants =
            self.create_constant_buffer(std::mem::size_of::<ImmediateConstants>() as u64)?;

        let release = self.release.clone();
        let blend_desc = BlendDescriptor::alpha();
        let blend = BlendState::new(
            "immediate",
            blend_desc,
            self.backend.create_blend_state(&blend_desc)?,
            release.clone(),
        );
        let depth_desc = DepthStencilDescriptor::disabled();
        let depth_stencil = DepthStencilState::new(
            "immediate",
            depth_desc,
            self.backend.create_depth_stencil_state(&depth_desc)?,
            release.clone(),
        );
        let raster_desc = RasterizerDescriptor::no_cull();
        let rasterizer = RasterizerState::new(
            "immediate",
            raster_desc,
            self.backend.create_rasterizer_state(&raster_desc)?,
            release.clone(),
        );
        let sampler_desc = SamplerDescriptor::linear();
        let sampler = SamplerState::new(
            "immediate",
            sampler_desc,
            self.backend.create_sampler_state(&sampler_desc)?,
            release.clone(),
        );

        log::debug!("Created immediate-mode resources");
        Ok(ImmediateResources {
            shader,
            textured_shader,
            layout,
            vertex_buffer,
            capacity: DEFAULT_VERTEX_CAPACITY,
            constants,
            blend,
            depth_stencil,
            rasterizer,
            sampler,
            release,
        })
    }
}

impl Drop for ImmediateResources {
    fn drop(&mut self) {
        self.release.defer(self.layout);
    }
}

fn immediate_vertex_buffer(capacity: u32) -> BufferDescriptor {
    BufferDescriptor::new(
        BufferKind::Mesh,
        capacity as u64 * std::mem::size_of::<ImmediateVertex>() as u64,
    )
    .with_label("immediate vertices")
    .with_stride(std::mem::size_of::<ImmediateVertex>() as u32)
    .with_usage(ResourceUsage::Dynamic)
}
