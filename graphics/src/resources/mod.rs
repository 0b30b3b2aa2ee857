//! GPU resources.
//!
//! This module contains the resource types created by [`GraphicsDevice`]:
//! - [`Buffer`] - GPU memory buffer
//! - [`Texture`] - 2D, 3D and cube textures, render and depth targets
//! - [`Query`] - occlusion and timestamp queries
//! - [`StateObject`] - named fixed-function states and [`InputLayout`]s
//!
//! Resources are reference-counted with [`Arc`] and can be shared across threads.
//! Each resource exclusively owns one backend [`NativeHandle`]; dropping the
//! last reference hands it to the device's [`ReleaseQueue`].
//!
//! [`GraphicsDevice`]: crate::GraphicsDevice
//! [`Arc`]: std::sync::Arc
//! [`NativeHandle`]: crate::backend::NativeHandle
//! [`ReleaseQueue`]: crate::release::ReleaseQueue

mod buffer;
mod query;
mod state;
mod texture;

use std::sync::atomic::{AtomicU64, Ordering};

pub use buffer::Buffer;
pub use query::Query;
pub use state::{
    BlendState, DepthStencilState, InputLayout, RasterizerState, SamplerState, StateObject,
};
pub use texture::Texture;

use crate::backend::NativeHandle;

/// A buffer or a texture, for operations that accept either.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Buffer(&'a Buffer),
    Texture(&'a Texture),
}

impl ResourceRef<'_> {
    pub fn native(&self) -> NativeHandle {
        match self {
            Self::Buffer(buffer) => buffer.native(),
            Self::Texture(texture) => texture.native(),
        }
    }
}

impl<'a> From<&'a Buffer> for ResourceRef<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl<'a> From<&'a Texture> for ResourceRef<'a> {
    fn from(texture: &'a Texture) -> Self {
        Self::Texture(texture)
    }
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique resource id.
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}
