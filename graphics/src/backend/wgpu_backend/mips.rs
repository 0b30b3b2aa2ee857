//! Mip chain generation by repeated linear downsampling.

use std::collections::HashMap;

use crate::error::GraphicsError;
use crate::shader::sections::BLIT_SECTION;
use crate::types::{TextureDescriptor, TextureKind};

use super::conversion::convert_texture_format;

/// Builds one blit pipeline per target format on first use.
pub(super) struct MipGenerator {
    module: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl MipGenerator {
    pub fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("mip blit"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SECTION.into()),
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("mip blit sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            module,
            sampler,
            pipelines: HashMap::new(),
        }
    }

    /// Whether mips of `desc` can be rendered by this generator.
    pub fn supports(desc: &TextureDescriptor, features: wgpu::Features) -> bool {
        let format = convert_texture_format(desc.format);
        let caps = format.guaranteed_format_features(features);
        desc.kind != TextureKind::D3
            && !desc.format.is_depth_stencil()
            && caps
                .flags
                .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
            && caps
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    }

    /// Record downsampling passes filling mips 1.. of every layer from mip 0.
    pub fn generate(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        desc: &TextureDescriptor,
    ) -> Result<(), GraphicsError> {
        if !Self::supports(desc, device.features()) {
            return Err(GraphicsError::InvalidParameter(format!(
                "cannot generate mips for {:?} {:?} texture",
                desc.kind, desc.format
            )));
        }

        let format = convert_texture_format(desc.format);
        let pipeline = self
            .pipelines
            .entry(format)
            .or_insert_with(|| create_pipeline(device, &self.module, format))
            .clone();

        let empty = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[],
        });
        let sampler_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(2),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            }],
        });
        let texture_layout = pipeline.get_bind_group_layout(1);

        let mip_levels = texture.mip_level_count();
        for layer in 0..desc.layers() {
            for mip in 1..mip_levels {
                let source = level_view(texture, mip - 1, layer);
                let target = level_view(texture, mip, layer);
                let source_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout: &texture_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&source),
                    }],
                });

                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("mip blit"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                    multiview_mask: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &empty, &[]);
                pass.set_bind_group(1, &source_group, &[]);
                pass.set_bind_group(2, &sampler_group, &[]);
                pass.draw(0..3, 0..1);
            }
        }
        log::trace!(
            "generated {} mips for {:?}",
            mip_levels.saturating_sub(1),
            desc.label
        );
        Ok(())
    }
}

fn level_view(texture: &wgpu::Texture, mip: u32, layer: u32) -> wgpu::TextureView {
    texture.create_view(&wgpu::TextureViewDescriptor {
        label: None,
        dimension: Some(wgpu::TextureViewDimension::D2),
        base_mip_level: mip,
        mip_level_count: Some(1),
        base_array_layer: layer,
        array_layer_count: Some(1),
        ..Default::default()
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("mip blit"),
        layout: None,
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some("ps_main"),
            compilation_options: Default::default(),
            targets: &[Some(format.into())],
        }),
        multiview_mask: None,
        cache: None,
    })
}
