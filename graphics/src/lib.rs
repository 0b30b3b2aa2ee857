//! # Rhodium Graphics
//!
//! Backend-agnostic GPU device with a register cache, a cross-compiling
//! shader pipeline and immediate-mode debug drawing.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsDevice`] - Resource creation, cached state binding and draws
//! - [`GpuBackend`] - Trait for native API implementations (wgpu, dummy)
//! - [`shader`] - Preprocessing, program cache, SPIR-V transpilation and reflection
//! - [`WorkQueue`] - Submitting work to the render thread from other threads
//!
//! ## Example
//!
//! ```ignore
//! use rhodium_graphics::{DeviceDescriptor, GraphicsDevice, PrimitiveTopology, RenderBackend};
//!
//! let mut device = GraphicsDevice::new(
//!     DeviceDescriptor::new().with_backend(RenderBackend::Automatic),
//! )?;
//!
//! device.im_begin(PrimitiveTopology::TriangleList);
//! device.im_vertex([0.0, 0.5, 0.0]);
//! device.im_vertex([-0.5, -0.5, 0.0]);
//! device.im_vertex([0.5, -0.5, 0.0]);
//! device.im_end()?;
//! device.present()?;
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod immediate;
pub mod queue;
pub mod regs;
pub mod release;
pub mod resources;
pub mod shader;
pub mod types;
pub mod window;

// Re-export main types for convenience
pub use backend::{DrawCall, GpuBackend, NativeHandle, RenderBackend};
pub use device::{DeviceDescriptor, GraphicsDevice};
pub use error::GraphicsError;
pub use immediate::ImmediateVertex;
pub use queue::{Job, WorkQueue};
pub use regs::{RegisterCache, RegisterKey, RegisterKind, RegisterStats, RegisterValue};
pub use resources::{
    BlendState, Buffer, DepthStencilState, InputLayout, Query, RasterizerState, ResourceRef,
    SamplerState, Texture,
};
pub use shader::{
    IncludeHandler, ProgramDescriptor, SectionInfo, Shader, ShaderDescriptor, ShaderDialect,
    ShaderFlags, ShaderStage,
};
pub use types::*;
pub use window::WindowSource;

#[cfg(feature = "dummy")]
pub use backend::dummy::DummyBackend;

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// Only logs the version and the compiled-in backends; devices work without it.
pub fn init() {
    log::info!(
        "Rhodium Graphics v{} initialized (gpu backend: {})",
        VERSION,
        backend::has_gpu_backend()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_dummy_device() {
        let device =
            GraphicsDevice::new(DeviceDescriptor::new().with_backend(RenderBackend::Dummy))
                .unwrap();
        assert_eq!(device.backend().name(), "Dummy Backend");
        assert_eq!(device.width(), 1280);
        assert!(device.backend_as::<DummyBackend>().is_some());
    }
}
