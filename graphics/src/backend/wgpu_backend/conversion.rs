//! Type conversions between Rhodium types and wgpu types.

use crate::types::{
    AddressMode, BindFlags, BlendFactor, BlendOperation, BufferDescriptor, CompareFunction,
    CullMode, DepthStencilDescriptor, FilterMode, IndexFormat, PrimitiveTopology,
    RasterizerDescriptor, RenderTargetBlend, StencilFace, StencilOperation, StepMode,
    TextureFormat, TextureKind, VertexFormat,
};

/// Buffer usages for a buffer descriptor.
///
/// Every buffer can be copied in both directions so `update_buffer`,
/// `copy_resource` and read-back work regardless of kind.
pub fn convert_buffer_usage(desc: &BufferDescriptor) -> wgpu::BufferUsages {
    let mut result = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;

    if desc.bind_flags.contains(BindFlags::VERTEX_BUFFER) {
        result |= wgpu::BufferUsages::VERTEX;
    }
    if desc.bind_flags.contains(BindFlags::INDEX_BUFFER) {
        result |= wgpu::BufferUsages::INDEX;
    }
    if desc.bind_flags.contains(BindFlags::CONSTANT_BUFFER) {
        result |= wgpu::BufferUsages::UNIFORM;
    }
    if desc
        .bind_flags
        .intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS)
    {
        result |= wgpu::BufferUsages::STORAGE;
    }

    result
}

/// Texture usages for a texture's bind flags.
pub fn convert_texture_usage(flags: BindFlags) -> wgpu::TextureUsages {
    let mut result = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;

    if flags.contains(BindFlags::SHADER_RESOURCE) {
        result |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if flags.contains(BindFlags::UNORDERED_ACCESS) {
        result |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if flags.intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL) {
        result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }

    result
}

/// Convert TextureFormat to wgpu format.
pub fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgb10A2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

/// Surface format back to ours, `None` for formats the device cannot describe.
pub fn convert_surface_format(format: wgpu::TextureFormat) -> Option<TextureFormat> {
    match format {
        wgpu::TextureFormat::Bgra8Unorm => Some(TextureFormat::Bgra8Unorm),
        wgpu::TextureFormat::Bgra8UnormSrgb => Some(TextureFormat::Bgra8UnormSrgb),
        wgpu::TextureFormat::Rgba8Unorm => Some(TextureFormat::Rgba8Unorm),
        wgpu::TextureFormat::Rgba8UnormSrgb => Some(TextureFormat::Rgba8UnormSrgb),
        wgpu::TextureFormat::Rgb10a2Unorm => Some(TextureFormat::Rgb10A2Unorm),
        wgpu::TextureFormat::Rgba16Float => Some(TextureFormat::Rgba16Float),
        _ => None,
    }
}

pub fn convert_texture_dimension(kind: TextureKind) -> wgpu::TextureDimension {
    match kind {
        TextureKind::D2 | TextureKind::Cube => wgpu::TextureDimension::D2,
        TextureKind::D3 => wgpu::TextureDimension::D3,
    }
}

pub fn convert_view_dimension(kind: TextureKind) -> wgpu::TextureViewDimension {
    match kind {
        TextureKind::D2 => wgpu::TextureViewDimension::D2,
        TextureKind::D3 => wgpu::TextureViewDimension::D3,
        TextureKind::Cube => wgpu::TextureViewDimension::Cube,
    }
}

/// Convert AddressMode to wgpu address mode.
pub fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        AddressMode::ClampToBorder => wgpu::AddressMode::ClampToBorder,
    }
}

/// Convert FilterMode to wgpu filter mode.
pub fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

pub fn convert_mipmap_filter_mode(mode: FilterMode) -> wgpu::MipmapFilterMode {
    match mode {
        FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
        FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
    }
}

/// Convert CompareFunction to wgpu compare function.
pub fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn convert_stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
    match op {
        StencilOperation::Keep => wgpu::StencilOperation::Keep,
        StencilOperation::Zero => wgpu::StencilOperation::Zero,
        StencilOperation::Replace => wgpu::StencilOperation::Replace,
        StencilOperation::Invert => wgpu::StencilOperation::Invert,
        StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOperation::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOperation::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    }
}

fn convert_stencil_face(face: &StencilFace) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: convert_compare_function(face.compare),
        fail_op: convert_stencil_operation(face.fail_op),
        depth_fail_op: convert_stencil_operation(face.depth_fail_op),
        pass_op: convert_stencil_operation(face.pass_op),
    }
}

/// Depth-stencil pipeline state for a depth target of `format`.
pub fn convert_depth_stencil(
    desc: &DepthStencilDescriptor,
    raster: &RasterizerDescriptor,
    format: wgpu::TextureFormat,
) -> wgpu::DepthStencilState {
    let stencil = if desc.stencil_test && format.has_stencil_aspect() {
        wgpu::StencilState {
            front: convert_stencil_face(&desc.front),
            back: convert_stencil_face(&desc.back),
            read_mask: desc.stencil_read_mask as u32,
            write_mask: desc.stencil_write_mask as u32,
        }
    } else {
        wgpu::StencilState::default()
    };

    let (depth_write, depth_compare) = if desc.depth_test {
        (desc.depth_write, convert_compare_function(desc.depth_compare))
    } else {
        (false, wgpu::CompareFunction::Always)
    };

    wgpu::DepthStencilState {
        format,
        depth_write_enabled: Some(depth_write),
        depth_compare: Some(depth_compare),
        stencil,
        bias: wgpu::DepthBiasState {
            constant: raster.depth_bias,
            slope_scale: raster.slope_scaled_depth_bias,
            clamp: raster.depth_bias_clamp,
        },
    }
}

pub fn convert_cull_mode(mode: CullMode) -> Option<wgpu::Face> {
    match mode {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::BlendFactor => wgpu::BlendFactor::Constant,
        BlendFactor::OneMinusBlendFactor => wgpu::BlendFactor::OneMinusConstant,
    }
}

fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
    match op {
        BlendOperation::Add => wgpu::BlendOperation::Add,
        BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOperation::Min => wgpu::BlendOperation::Min,
        BlendOperation::Max => wgpu::BlendOperation::Max,
    }
}

/// Color target state for one render target.
pub fn convert_color_target(
    blend: &RenderTargetBlend,
    format: wgpu::TextureFormat,
) -> wgpu::ColorTargetState {
    let state = blend.enabled.then(|| wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: convert_blend_factor(blend.src_color),
            dst_factor: convert_blend_factor(blend.dst_color),
            operation: convert_blend_operation(blend.color_op),
        },
        alpha: wgpu::BlendComponent {
            src_factor: convert_blend_factor(blend.src_alpha),
            dst_factor: convert_blend_factor(blend.dst_alpha),
            operation: convert_blend_operation(blend.alpha_op),
        },
    });
    wgpu::ColorTargetState {
        format,
        blend: state,
        write_mask: wgpu::ColorWrites::from_bits_truncate(blend.write_mask as u32),
    }
}

/// Convert PrimitiveTopology to wgpu topology.
pub fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

pub fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

/// Convert VertexFormat to wgpu vertex format.
pub fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        VertexFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
        VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        VertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
        VertexFormat::Uint8x4 => wgpu::VertexFormat::Uint8x4,
    }
}

pub fn convert_step_mode(mode: StepMode) -> wgpu::VertexStepMode {
    match mode {
        StepMode::Vertex => wgpu::VertexStepMode::Vertex,
        StepMode::Instance => wgpu::VertexStepMode::Instance,
    }
}

pub fn convert_color(color: crate::types::Color) -> wgpu::Color {
    wgpu::Color {
        r: color.r as f64,
        g: color.g as f64,
        b: color.b as f64,
        a: color.a as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferKind;

    #[test]
    fn test_buffer_usage_follows_kind() {
        let usage = convert_buffer_usage(&BufferDescriptor::new(BufferKind::Constant, 16));
        assert!(usage.contains(wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST));
        assert!(!usage.contains(wgpu::BufferUsages::VERTEX));

        let usage = convert_buffer_usage(&BufferDescriptor::new(BufferKind::Element, 12));
        assert!(usage.contains(wgpu::BufferUsages::INDEX));
    }

    #[test]
    fn test_surface_format_round_trip() {
        for format in [TextureFormat::Bgra8Unorm, TextureFormat::Rgba8UnormSrgb] {
            assert_eq!(
                convert_surface_format(convert_texture_format(format)),
                Some(format)
            );
        }
        assert_eq!(convert_surface_format(wgpu::TextureFormat::R8Unorm), None);
    }

    #[test]
    fn test_disabled_blend_has_no_state() {
        let target = convert_color_target(
            &RenderTargetBlend::default(),
            wgpu::TextureFormat::Rgba8Unorm,
        );
        assert!(target.blend.is_none());
        assert_eq!(target.write_mask, wgpu::ColorWrites::ALL);
    }
}
