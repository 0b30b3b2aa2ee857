//! Named fixed-function state objects.

use crate::backend::NativeHandle;
use crate::release::ReleaseQueue;
use crate::types::{
    BlendDescriptor, DepthStencilDescriptor, InputLayoutDescriptor, RasterizerDescriptor,
    SamplerDescriptor,
};

/// An immutable pipeline state registered under a name on the device.
///
/// Look states up with the device's `get_*_state(name)` methods. The device
/// keeps every named state alive until it is dropped.
pub struct StateObject<D> {
    name: String,
    descriptor: D,
    handle: NativeHandle,
    release: ReleaseQueue,
}

pub type DepthStencilState = StateObject<DepthStencilDescriptor>;
pub type RasterizerState = StateObject<RasterizerDescriptor>;
pub type BlendState = StateObject<BlendDescriptor>;
pub type SamplerState = StateObject<SamplerDescriptor>;

impl<D> StateObject<D> {
    pub(crate) fn new(
        name: impl Into<String>,
        descriptor: D,
        handle: NativeHandle,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor,
            handle,
            release,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &D {
        &self.descriptor
    }

    pub fn native(&self) -> NativeHandle {
        self.handle
    }
}

impl<D> Drop for StateObject<D> {
    fn drop(&mut self) {
        self.release.defer(self.handle);
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for StateObject<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObject")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// A vertex input layout.
///
/// The native object depends on the vertex shader it is paired with, so it is
/// built lazily by the device the first time a draw sees this layout together
/// with a shader.
#[derive(Debug)]
pub struct InputLayout {
    id: u64,
    name: String,
    descriptor: InputLayoutDescriptor,
}

impl InputLayout {
    pub(crate) fn new(name: impl Into<String>, descriptor: InputLayoutDescriptor) -> Self {
        Self {
            id: super::next_resource_id(),
            name: name.into(),
            descriptor,
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &InputLayoutDescriptor {
        &self.descriptor
    }

    /// Byte stride of vertex buffer `slot`.
    pub fn stride(&self, slot: u32) -> u32 {
        self.descriptor.stride(slot)
    }
}

static_assertions::assert_impl_all!(BlendState: Send, Sync);
static_assertions::assert_impl_all!(InputLayout: Send, Sync);
