//! GPU buffer resource.

use crate::backend::NativeHandle;
use crate::release::ReleaseQueue;
use crate::types::{BindFlags, BufferDescriptor, BufferKind, ResourceUsage};

/// A GPU buffer resource.
///
/// Buffers are created by [`GraphicsDevice::create_buffer`] and its typed
/// helpers, and are reference-counted.
///
/// # Example
///
/// ```ignore
/// let vertices = device.create_mesh_buffer(&VERTS)?;
/// println!("{} vertices", vertices.element_count());
/// ```
///
/// [`GraphicsDevice::create_buffer`]: crate::GraphicsDevice::create_buffer
pub struct Buffer {
    handle: NativeHandle,
    descriptor: BufferDescriptor,
    release: ReleaseQueue,
}

impl Buffer {
    pub(crate) fn new(
        handle: NativeHandle,
        descriptor: BufferDescriptor,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            handle,
            descriptor,
            release,
        }
    }

    /// Backend handle of this buffer.
    pub fn native(&self) -> NativeHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn kind(&self) -> BufferKind {
        self.descriptor.kind
    }

    /// Bytes per element, 0 if unstructured.
    pub fn stride(&self) -> u32 {
        self.descriptor.stride
    }

    pub fn usage(&self) -> ResourceUsage {
        self.descriptor.usage
    }

    pub fn bind_flags(&self) -> BindFlags {
        self.descriptor.bind_flags
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Number of `stride`-sized elements.
    pub fn element_count(&self) -> u64 {
        match self.descriptor.stride {
            0 => 0,
            stride => self.descriptor.size / u64::from(stride),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release.defer(self.handle);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("kind", &self.descriptor.kind)
            .field("size", &self.descriptor.size)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

static_assertions::assert_impl_all!(Buffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count() {
        let desc = BufferDescriptor::new(BufferKind::Mesh, 240).with_stride(12);
        let buffer = Buffer::new(NativeHandle(1), desc, ReleaseQueue::new());
        assert_eq!(buffer.element_count(), 20);
        assert!(buffer.bind_flags().contains(BindFlags::VERTEX_BUFFER));
    }

    #[test]
    fn test_drop_defers_release() {
        let release = ReleaseQueue::new();
        let desc = BufferDescriptor::new(BufferKind::Constant, 64);
        drop(Buffer::new(NativeHandle(9), desc, release.clone()));
        assert_eq!(release.drain(), vec![NativeHandle(9)]);
    }
}
