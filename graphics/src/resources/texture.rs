//! GPU texture resource.

use parking_lot::RwLock;

use crate::backend::NativeHandle;
use crate::release::ReleaseQueue;
use crate::types::{BindFlags, TextureDescriptor, TextureFormat, TextureKind};

/// A GPU texture resource.
///
/// Covers 2D, 3D and cube textures as well as render targets, depth targets
/// and cubemaps. Textures are created by [`GraphicsDevice::create_texture`]
/// and its helpers, and are reference-counted.
///
/// The metadata mirrors the backend. A texture wrapping an external handle
/// (see [`GraphicsDevice::create_texture_2d_from_native`]) is re-synchronized
/// by [`GraphicsDevice::generate_texture`], e.g. after the swap chain resized.
///
/// # Example
///
/// ```ignore
/// let texture = device.create_texture_2d(128, 128, TextureFormat::Rgba8Unorm, None)?;
/// println!("Texture size: {}x{}", texture.width(), texture.height());
/// ```
///
/// [`GraphicsDevice::create_texture`]: crate::GraphicsDevice::create_texture
/// [`GraphicsDevice::create_texture_2d_from_native`]: crate::GraphicsDevice::create_texture_2d_from_native
/// [`GraphicsDevice::generate_texture`]: crate::GraphicsDevice::generate_texture
pub struct Texture {
    handle: NativeHandle,
    descriptor: RwLock<TextureDescriptor>,
    /// External textures are never released through this object.
    owned: bool,
    release: ReleaseQueue,
}

impl Texture {
    pub(crate) fn new(
        handle: NativeHandle,
        descriptor: TextureDescriptor,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            handle,
            descriptor: RwLock::new(descriptor),
            owned: true,
            release,
        }
    }

    /// Wrap a handle owned by someone else, like the back buffer.
    pub(crate) fn external(handle: NativeHandle, descriptor: TextureDescriptor) -> Self {
        Self {
            handle,
            descriptor: RwLock::new(descriptor),
            owned: false,
            release: ReleaseQueue::new(),
        }
    }

    /// Replace the metadata with what the backend reports.
    pub(crate) fn resync(&self, descriptor: TextureDescriptor) {
        *self.descriptor.write() = descriptor;
    }

    /// Backend handle of this texture.
    pub fn native(&self) -> NativeHandle {
        self.handle
    }

    /// Snapshot of the texture descriptor.
    pub fn descriptor(&self) -> TextureDescriptor {
        self.descriptor.read().clone()
    }

    pub fn kind(&self) -> TextureKind {
        self.descriptor.read().kind
    }

    /// Get the texture width.
    pub fn width(&self) -> u32 {
        self.descriptor.read().width
    }

    /// Get the texture height.
    pub fn height(&self) -> u32 {
        self.descriptor.read().height
    }

    /// Get the texture depth or array layer count.
    pub fn depth(&self) -> u32 {
        self.descriptor.read().depth
    }

    /// Get the texture format.
    pub fn format(&self) -> TextureFormat {
        self.descriptor.read().format
    }

    pub fn mip_levels(&self) -> u32 {
        self.descriptor.read().mip_levels
    }

    pub fn bind_flags(&self) -> BindFlags {
        self.descriptor.read().bind_flags
    }

    pub fn label(&self) -> Option<String> {
        self.descriptor.read().label.clone()
    }

    /// Whether this object owns its native handle.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub(crate) fn is_render_target(&self) -> bool {
        self.bind_flags().contains(BindFlags::RENDER_TARGET)
    }

    pub(crate) fn is_depth_target(&self) -> bool {
        self.bind_flags().contains(BindFlags::DEPTH_STENCIL)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.owned {
            self.release.defer(self.handle);
        }
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = self.descriptor.read();
        f.debug_struct("Texture")
            .field("handle", &self.handle)
            .field("kind", &desc.kind)
            .field("size", &(desc.width, desc.height, desc.depth))
            .field("format", &desc.format)
            .field("label", &desc.label)
            .finish()
    }
}

// Ensure Texture is Send + Sync
static_assertions::assert_impl_all!(Texture: Send, Sync);
