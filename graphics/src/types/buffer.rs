//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages a resource can be bound to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        /// Vertex input.
        const VERTEX_BUFFER = 1 << 0;
        /// Index input.
        const INDEX_BUFFER = 1 << 1;
        /// Shader constants.
        const CONSTANT_BUFFER = 1 << 2;
        /// Sampled or read in shaders.
        const SHADER_RESOURCE = 1 << 3;
        /// Read-write access from shaders.
        const UNORDERED_ACCESS = 1 << 4;
        /// Color attachment.
        const RENDER_TARGET = 1 << 5;
        /// Depth/stencil attachment.
        const DEPTH_STENCIL = 1 << 6;
    }
}

impl Default for BindFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// How the CPU and GPU access a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceUsage {
    /// GPU read/write, CPU updates through `update_*`.
    #[default]
    Default,
    /// Initialized at creation, never written again.
    Immutable,
    /// Rewritten by the CPU frequently (`MapMode::WriteDiscard`).
    Dynamic,
    /// CPU readback.
    Staging,
}

/// Role of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferKind {
    /// Index data.
    Element,
    /// Static vertex data.
    #[default]
    Mesh,
    /// Skinning vertex stream (bone indices and weights).
    Skin,
    /// Per-instance vertex data.
    Instance,
    /// Shader constants.
    Constant,
    /// Structured read-write data.
    Storage,
}

impl BufferKind {
    /// Default bind flags for this kind of buffer.
    pub fn bind_flags(self) -> BindFlags {
        match self {
            Self::Element => BindFlags::INDEX_BUFFER,
            Self::Mesh | Self::Skin | Self::Instance => BindFlags::VERTEX_BUFFER,
            Self::Constant => BindFlags::CONSTANT_BUFFER,
            Self::Storage => BindFlags::UNORDERED_ACCESS | BindFlags::SHADER_RESOURCE,
        }
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Buffer role.
    pub kind: BufferKind,
    /// Size in bytes.
    pub size: u64,
    /// Element stride in bytes, `0` when not applicable.
    pub stride: u32,
    /// CPU/GPU access pattern.
    pub usage: ResourceUsage,
    /// Pipeline stages the buffer can be bound to.
    pub bind_flags: BindFlags,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor with the kind's default bind flags.
    pub fn new(kind: BufferKind, size: u64) -> Self {
        Self {
            label: None,
            kind,
            size,
            stride: 0,
            usage: ResourceUsage::Default,
            bind_flags: kind.bind_flags(),
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the element stride.
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Set the resource usage.
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Add bind flags on top of the kind's defaults.
    pub fn with_bind_flags(mut self, flags: BindFlags) -> Self {
        self.bind_flags |= flags;
        self
    }
}

/// Index element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    /// 16-bit indices.
    Uint16,
    /// 32-bit indices.
    #[default]
    Uint32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub fn size(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Buffer mapping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Read back the current contents. Blocks until the GPU copy completes.
    Read,
    /// Replace the whole contents. The previous data is discarded.
    WriteDiscard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bind_flags() {
        let desc = BufferDescriptor::new(BufferKind::Element, 64);
        assert_eq!(desc.bind_flags, BindFlags::INDEX_BUFFER);

        let desc = BufferDescriptor::new(BufferKind::Instance, 64)
            .with_bind_flags(BindFlags::SHADER_RESOURCE);
        assert!(desc.bind_flags.contains(BindFlags::VERTEX_BUFFER));
        assert!(desc.bind_flags.contains(BindFlags::SHADER_RESOURCE));
    }
}
