//! Pipeline and bind group construction.
//!
//! wgpu bakes blend, depth, raster, vertex layout and target formats into one
//! immutable pipeline, while the device binds them one register at a time.
//! Pipelines are therefore built at draw time from whatever is bound and
//! cached by the handles they were built from.

use std::collections::{BTreeMap, HashMap};

use crate::backend::NativeHandle;
use crate::error::GraphicsError;
use crate::types::{
    BlendDescriptor, DepthStencilDescriptor, FillMode, InputLayoutDescriptor, PrimitiveTopology,
    RasterizerDescriptor,
};

use super::conversion::{
    convert_color_target, convert_cull_mode, convert_depth_stencil, convert_step_mode,
    convert_topology, convert_vertex_format,
};
use super::ShaderObject;

/// Everything a render pipeline depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct RenderPipelineKey {
    pub vertex: NativeHandle,
    pub pixel: Option<NativeHandle>,
    pub input_layout: Option<NativeHandle>,
    /// Stride of every vertex buffer slot the layout uses, by slot.
    pub strides: Vec<u32>,
    pub blend: Option<NativeHandle>,
    pub depth_stencil: Option<NativeHandle>,
    pub rasterizer: Option<NativeHandle>,
    pub topology: PrimitiveTopology,
    pub strip_index_format: Option<wgpu::IndexFormat>,
    pub color_formats: Vec<wgpu::TextureFormat>,
    pub depth_format: Option<wgpu::TextureFormat>,
}

impl RenderPipelineKey {
    fn references(&self, handle: NativeHandle) -> bool {
        self.vertex == handle
            || self.pixel == Some(handle)
            || self.input_layout == Some(handle)
            || self.blend == Some(handle)
            || self.depth_stencil == Some(handle)
            || self.rasterizer == Some(handle)
    }
}

/// Built pipelines, keyed by the state they were built from.
#[derive(Default)]
pub(super) struct PipelineCache {
    render: HashMap<RenderPipelineKey, wgpu::RenderPipeline>,
    compute: HashMap<NativeHandle, wgpu::ComputePipeline>,
}

impl PipelineCache {
    pub fn render(&self, key: &RenderPipelineKey) -> Option<&wgpu::RenderPipeline> {
        self.render.get(key)
    }

    pub fn insert_render(&mut self, key: RenderPipelineKey, pipeline: wgpu::RenderPipeline) {
        self.render.insert(key, pipeline);
    }

    pub fn compute(&self, shader: NativeHandle) -> Option<&wgpu::ComputePipeline> {
        self.compute.get(&shader)
    }

    pub fn insert_compute(&mut self, shader: NativeHandle, pipeline: wgpu::ComputePipeline) {
        self.compute.insert(shader, pipeline);
    }

    /// Drop every pipeline built from `handle`.
    pub fn purge(&mut self, handle: NativeHandle) {
        let before = self.len();
        self.render.retain(|key, _| !key.references(handle));
        self.compute.remove(&handle);
        let purged = before - self.len();
        if purged > 0 {
            log::trace!("purged {purged} pipelines built from {}", handle.raw());
        }
    }

    pub fn len(&self) -> usize {
        self.render.len() + self.compute.len()
    }
}

/// Resolved inputs of one render pipeline build.
pub(super) struct RenderPipelineInputs<'a> {
    pub vertex: &'a ShaderObject,
    pub pixel: Option<&'a ShaderObject>,
    pub input_layout: Option<&'a InputLayoutDescriptor>,
    pub blend: &'a BlendDescriptor,
    pub depth_stencil: &'a DepthStencilDescriptor,
    pub rasterizer: &'a RasterizerDescriptor,
    pub features: wgpu::Features,
}

pub(super) fn create_render_pipeline(
    device: &wgpu::Device,
    key: &RenderPipelineKey,
    inputs: &RenderPipelineInputs<'_>,
) -> Result<wgpu::RenderPipeline, GraphicsError> {
    let empty = InputLayoutDescriptor::default();
    let layout = inputs.input_layout.unwrap_or(&empty);

    // One attribute list per slot, gaps stay empty with a zero stride.
    let attributes: Vec<Vec<wgpu::VertexAttribute>> = (0..key.strides.len() as u32)
        .map(|slot| {
            layout
                .elements
                .iter()
                .filter(|e| e.slot == slot)
                .map(|e| wgpu::VertexAttribute {
                    format: convert_vertex_format(e.format),
                    offset: e.offset as u64,
                    shader_location: e.location,
                })
                .collect()
        })
        .collect();
    let buffers: Vec<wgpu::VertexBufferLayout<'_>> = attributes
        .iter()
        .enumerate()
        .map(|(slot, attributes)| {
            let step = layout
                .elements
                .iter()
                .find(|e| e.slot == slot as u32)
                .map(|e| convert_step_mode(e.step))
                .unwrap_or(wgpu::VertexStepMode::Vertex);
            wgpu::VertexBufferLayout {
                array_stride: key.strides[slot] as u64,
                step_mode: step,
                attributes,
            }
        })
        .collect();

    let targets: Vec<Option<wgpu::ColorTargetState>> = key
        .color_formats
        .iter()
        .enumerate()
        .map(|(i, format)| Some(convert_color_target(inputs.blend.target(i), *format)))
        .collect();

    let raster = inputs.rasterizer;
    let polygon_mode = match raster.fill_mode {
        FillMode::Wireframe if inputs.features.contains(wgpu::Features::POLYGON_MODE_LINE) => {
            wgpu::PolygonMode::Line
        }
        FillMode::Wireframe => {
            log::warn!("wireframe fill is not supported by this adapter, drawing solid");
            wgpu::PolygonMode::Fill
        }
        FillMode::Solid => wgpu::PolygonMode::Fill,
    };
    let unclipped_depth =
        !raster.depth_clip && inputs.features.contains(wgpu::Features::DEPTH_CLIP_CONTROL);

    let label = format!(
        "pipeline vs={} ps={:?}",
        key.vertex.raw(),
        key.pixel.map(NativeHandle::raw)
    );
    let descriptor = wgpu::RenderPipelineDescriptor {
        label: Some(label.as_str()),
        layout: None,
        vertex: wgpu::VertexState {
            module: &inputs.vertex.module,
            entry_point: Some(inputs.vertex.entry_point.as_str()),
            compilation_options: Default::default(),
            buffers: &buffers,
        },
        primitive: wgpu::PrimitiveState {
            topology: convert_topology(key.topology),
            strip_index_format: key.strip_index_format,
            front_face: if raster.front_ccw {
                wgpu::FrontFace::Ccw
            } else {
                wgpu::FrontFace::Cw
            },
            cull_mode: convert_cull_mode(raster.cull_mode),
            unclipped_depth,
            polygon_mode,
            conservative: false,
        },
        depth_stencil: key
            .depth_format
            .map(|format| convert_depth_stencil(inputs.depth_stencil, raster, format)),
        multisample: wgpu::MultisampleState::default(),
        fragment: inputs.pixel.map(|pixel| wgpu::FragmentState {
            module: &pixel.module,
            entry_point: Some(pixel.entry_point.as_str()),
            compilation_options: Default::default(),
            targets: &targets,
        }),
        multiview_mask: None,
        cache: None,
    };

    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_render_pipeline(&descriptor);
    match pollster::block_on(scope.pop()) {
        Some(error) => Err(GraphicsError::Backend(format!(
            "render pipeline creation failed: {error}"
        ))),
        None => Ok(pipeline),
    }
}

pub(super) fn create_compute_pipeline(
    device: &wgpu::Device,
    shader: &ShaderObject,
) -> Result<wgpu::ComputePipeline, GraphicsError> {
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("compute pipeline"),
        layout: None,
        module: &shader.module,
        entry_point: Some(shader.entry_point.as_str()),
        compilation_options: Default::default(),
        cache: None,
    });
    match pollster::block_on(scope.pop()) {
        Some(error) => Err(GraphicsError::Backend(format!(
            "compute pipeline creation failed: {error}"
        ))),
        None => Ok(pipeline),
    }
}

/// A resource resolved from the bound registers for one binding.
pub(super) enum BoundResource {
    Buffer(wgpu::Buffer),
    View(wgpu::TextureView),
    Sampler(wgpu::Sampler),
}

impl BoundResource {
    fn binding(&self) -> wgpu::BindingResource<'_> {
        match self {
            Self::Buffer(buffer) => buffer.as_entire_binding(),
            Self::View(view) => wgpu::BindingResource::TextureView(view),
            Self::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
        }
    }
}

/// One bind group per group index up to the highest used one.
///
/// `resources` is keyed by `(group, binding)`. Groups without resources get an
/// empty bind group so the pipeline's auto layout is satisfied.
pub(super) fn create_bind_groups(
    device: &wgpu::Device,
    layout_for: impl Fn(u32) -> wgpu::BindGroupLayout,
    resources: &BTreeMap<(u32, u32), BoundResource>,
) -> Vec<wgpu::BindGroup> {
    let Some(max_group) = resources.keys().map(|(group, _)| *group).max() else {
        return Vec::new();
    };

    (0..=max_group)
        .map(|group| {
            let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
                .range((group, 0)..=(group, u32::MAX))
                .map(|((_, binding), resource)| wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: resource.binding(),
                })
                .collect();
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &layout_for(group),
                entries: &entries,
            })
        })
        .collect()
}
