//! Vertex input layout descriptors.

use serde::{Deserialize, Serialize};

/// Format of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x4,
    Sint32,
    Sint32x4,
    /// Four normalized bytes, e.g. a packed color.
    Unorm8x4,
    /// Four unsigned bytes, e.g. bone indices.
    Uint8x4,
}

impl VertexFormat {
    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 | Self::Unorm8x4 | Self::Uint8x4 => 4,
            Self::Float32x2 | Self::Uint32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 | Self::Sint32x4 => 16,
        }
    }

    /// Number of components.
    pub fn components(self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 => 1,
            Self::Float32x2 | Self::Uint32x2 => 2,
            Self::Float32x3 => 3,
            Self::Float32x4 | Self::Uint32x4 | Self::Sint32x4 | Self::Unorm8x4 | Self::Uint8x4 => {
                4
            }
        }
    }
}

/// Vertex data advance rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StepMode {
    #[default]
    Vertex,
    Instance,
}

/// One attribute of a vertex layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexElement {
    /// Shader input location.
    pub location: u32,
    pub format: VertexFormat,
    /// Vertex buffer slot the attribute reads from.
    pub slot: u32,
    /// Byte offset within one vertex.
    pub offset: u32,
    pub step: StepMode,
}

impl VertexElement {
    pub fn new(location: u32, format: VertexFormat, offset: u32) -> Self {
        Self {
            location,
            format,
            slot: 0,
            offset,
            step: StepMode::Vertex,
        }
    }

    /// Read from vertex buffer `slot` instead of slot 0.
    pub fn in_slot(mut self, slot: u32) -> Self {
        self.slot = slot;
        self
    }

    /// Advance once per instance.
    pub fn per_instance(mut self) -> Self {
        self.step = StepMode::Instance;
        self
    }
}

/// Descriptor for an input layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputLayoutDescriptor {
    pub elements: Vec<VertexElement>,
}

impl InputLayoutDescriptor {
    /// Build a single-slot layout from consecutive formats at locations 0, 1, 2...
    pub fn packed(formats: &[VertexFormat]) -> Self {
        let mut offset = 0;
        let elements = formats
            .iter()
            .enumerate()
            .map(|(location, format)| {
                let element = VertexElement::new(location as u32, *format, offset);
                offset += format.size();
                element
            })
            .collect();
        Self { elements }
    }

    /// Byte stride of one vertex in `slot`, derived from the furthest attribute.
    pub fn stride(&self, slot: u32) -> u32 {
        self.elements
            .iter()
            .filter(|e| e.slot == slot)
            .map(|e| e.offset + e.format.size())
            .max()
            .unwrap_or(0)
    }

    /// Distinct vertex buffer slots, ascending.
    pub fn slots(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = self.elements.iter().map(|e| e.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_layout() {
        let layout = InputLayoutDescriptor::packed(&[
            VertexFormat::Float32x3,
            VertexFormat::Float32x2,
            VertexFormat::Unorm8x4,
        ]);
        assert_eq!(layout.elements[1].offset, 12);
        assert_eq!(layout.elements[2].location, 2);
        assert_eq!(layout.stride(0), 24);
        assert_eq!(layout.slots(), vec![0]);
    }
}
