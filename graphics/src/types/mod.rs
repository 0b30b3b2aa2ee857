//! Common types and descriptors for graphics resources.
//!
//! This module contains format enums, bind flags, and the plain descriptor
//! structs every `create_*` call takes.

mod buffer;
mod common;
mod state;
mod texture;
mod vertex;

pub use buffer::{BindFlags, BufferDescriptor, BufferKind, IndexFormat, MapMode, ResourceUsage};
pub use common::{Color, PrimitiveTopology, QueryKind, ScissorRect, ShaderStages, Viewport};
pub use state::{
    AddressMode, BlendDescriptor, BlendFactor, BlendOperation, CompareFunction, CullMode,
    DepthStencilDescriptor, FillMode, FilterMode, MAX_RENDER_TARGETS, RasterizerDescriptor,
    RenderTargetBlend, SamplerDescriptor, StencilFace, StencilOperation,
};
pub use texture::{TextureDescriptor, TextureFormat, TextureKind};
pub use vertex::{InputLayoutDescriptor, StepMode, VertexElement, VertexFormat};
