//! Fixed-function state descriptors.

/// Comparison function for depth, stencil and shadow sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Stencil buffer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOperation {
    #[default]
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
    IncrementWrap,
    DecrementWrap,
}

/// Stencil state for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub compare: CompareFunction,
    pub fail_op: StencilOperation,
    pub depth_fail_op: StencilOperation,
    pub pass_op: StencilOperation,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            compare: CompareFunction::Always,
            fail_op: StencilOperation::Keep,
            depth_fail_op: StencilOperation::Keep,
            pass_op: StencilOperation::Keep,
        }
    }
}

/// Depth-stencil state descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDescriptor {
    /// Whether depth testing is enabled.
    pub depth_test: bool,
    /// Whether depth writes are enabled.
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    /// Whether stencil testing is enabled.
    pub stencil_test: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl Default for DepthStencilDescriptor {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: CompareFunction::Less,
            stencil_test: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

impl DepthStencilDescriptor {
    /// Depth testing and writing disabled.
    pub fn disabled() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: CompareFunction::Always,
            ..Default::default()
        }
    }

    /// Depth test without writes.
    pub fn read_only(compare: CompareFunction) -> Self {
        Self {
            depth_write: false,
            depth_compare: compare,
            ..Default::default()
        }
    }
}

/// Polygon fill mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

/// Face culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

/// Rasterizer state descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerDescriptor {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    /// Counter-clockwise triangles are front-facing.
    pub front_ccw: bool,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub depth_clip: bool,
    pub scissor_enable: bool,
}

impl Default for RasterizerDescriptor {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_ccw: true,
            depth_bias: 0,
            slope_scaled_depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            depth_clip: true,
            scissor_enable: false,
        }
    }
}

impl RasterizerDescriptor {
    /// Solid fill with no culling.
    pub fn no_cull() -> Self {
        Self {
            cull_mode: CullMode::None,
            ..Default::default()
        }
    }
}

/// Blend factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
    BlendFactor,
    OneMinusBlendFactor,
}

/// Blend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOperation {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend equation for one color target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetBlend {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOperation,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOperation,
    /// RGBA write mask, bit 0 = red.
    pub write_mask: u8,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOperation::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOperation::Add,
            write_mask: 0xf,
        }
    }
}

/// Maximum number of simultaneously bound color targets.
pub const MAX_RENDER_TARGETS: usize = 8;

/// Blend state descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlendDescriptor {
    pub alpha_to_coverage: bool,
    /// Use `targets[i]` for target `i`; otherwise `targets[0]` applies to all.
    pub independent: bool,
    pub targets: [RenderTargetBlend; MAX_RENDER_TARGETS],
    /// Constant used by [`BlendFactor::BlendFactor`].
    pub blend_factor: [f32; 4],
}

impl BlendDescriptor {
    /// Standard premultiplied-free alpha blending.
    pub fn alpha() -> Self {
        Self::uniform(RenderTargetBlend {
            enabled: true,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        })
    }

    /// Additive blending.
    pub fn additive() -> Self {
        Self::uniform(RenderTargetBlend {
            enabled: true,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::One,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::One,
            ..Default::default()
        })
    }

    /// The same equation for every target.
    pub fn uniform(target: RenderTargetBlend) -> Self {
        Self {
            targets: [target; MAX_RENDER_TARGETS],
            ..Default::default()
        }
    }

    /// Equation for color target `index`.
    pub fn target(&self, index: usize) -> &RenderTargetBlend {
        if self.independent {
            &self.targets[index.min(MAX_RENDER_TARGETS - 1)]
        } else {
            &self.targets[0]
        }
    }
}

/// Texture filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Texture addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
    ClampToBorder,
}

/// Sampler state descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescriptor {
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub lod_min: f32,
    pub lod_max: f32,
    /// Comparison function for shadow sampling.
    pub compare: Option<CompareFunction>,
    /// 1 disables anisotropic filtering.
    pub max_anisotropy: u16,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            address_u: AddressMode::ClampToEdge,
            address_v: AddressMode::ClampToEdge,
            address_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mip_filter: FilterMode::Linear,
            lod_min: 0.0,
            lod_max: 32.0,
            compare: None,
            max_anisotropy: 1,
        }
    }
}

impl SamplerDescriptor {
    /// Create a linear filtering sampler.
    pub fn linear() -> Self {
        Self::default()
    }

    /// Create a nearest neighbor filtering sampler.
    pub fn nearest() -> Self {
        Self {
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mip_filter: FilterMode::Nearest,
            ..Default::default()
        }
    }

    /// Set every address mode.
    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_u = mode;
        self.address_v = mode;
        self.address_w = mode;
        self
    }

    /// Set the comparison function.
    pub fn with_compare(mut self, compare: CompareFunction) -> Self {
        self.compare = Some(compare);
        self
    }
}
