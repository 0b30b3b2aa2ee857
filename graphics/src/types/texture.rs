//! Texture types and descriptors.

use super::{BindFlags, ResourceUsage};

/// Texture format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum TextureFormat {
    // 8-bit formats
    /// 8-bit red channel, unsigned normalized.
    R8Unorm,
    /// 8-bit RG channels, unsigned normalized.
    Rg8Unorm,

    // 32-bit formats
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit red channel, unsigned integer.
    R32Uint,
    /// 16-bit RG channels, float.
    Rg16Float,
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8UnormSrgb,
    /// Packed 10-bit RGB with 2-bit alpha.
    Rgb10A2Unorm,

    // 64-bit formats
    /// 16-bit RGBA channels, float.
    Rgba16Float,
    /// 32-bit RG channels, float.
    Rg32Float,

    // 128-bit formats
    /// 32-bit RGBA channels, float.
    Rgba32Float,

    // Depth/stencil formats
    /// 16-bit depth.
    Depth16Unorm,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
    /// 32-bit depth, float.
    Depth32Float,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24PlusStencil8 | Self::Depth32Float
        )
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24PlusStencil8)
    }

    /// Returns the size in bytes per pixel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::Depth16Unorm => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Rgb10A2Unorm
            | Self::Depth24PlusStencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Rg32Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Dimensionality of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    /// Two-dimensional texture, optionally an array.
    #[default]
    D2,
    /// Volume texture.
    D3,
    /// Cube map with six square faces.
    Cube,
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Texture dimensionality.
    pub kind: TextureKind,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth for volume textures, array layers for 2D textures. Ignored for cube maps.
    pub depth: u32,
    /// Mip level count, at least 1.
    pub mip_levels: u32,
    /// Texture format.
    pub format: TextureFormat,
    /// CPU/GPU access pattern.
    pub usage: ResourceUsage,
    /// Pipeline stages the texture can be bound to.
    pub bind_flags: BindFlags,
}

impl TextureDescriptor {
    /// Create a new 2D shader-resource texture descriptor.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Create a new volume texture descriptor.
    pub fn new_3d(width: u32, height: u32, depth: u32, format: TextureFormat) -> Self {
        Self {
            kind: TextureKind::D3,
            width,
            height,
            depth,
            format,
            ..Default::default()
        }
    }

    /// Create a new cube map descriptor.
    pub fn new_cube(size: u32, format: TextureFormat) -> Self {
        Self {
            kind: TextureKind::Cube,
            width: size,
            height: size,
            format,
            ..Default::default()
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_levels = count;
        self
    }

    /// Set the bind flags.
    pub fn with_bind_flags(mut self, flags: BindFlags) -> Self {
        self.bind_flags = flags;
        self
    }

    /// Set the resource usage.
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of array layers the backend allocates.
    pub fn layers(&self) -> u32 {
        match self.kind {
            TextureKind::D2 => self.depth.max(1),
            TextureKind::D3 => 1,
            TextureKind::Cube => 6,
        }
    }

    /// Byte size of mip level 0 across all layers and slices.
    pub fn level0_size(&self) -> usize {
        let slices = match self.kind {
            TextureKind::D3 => self.depth.max(1),
            _ => self.layers(),
        };
        self.width as usize
            * self.height as usize
            * slices as usize
            * self.format.block_size() as usize
    }

    /// Maximum mip count for this descriptor's extent.
    pub fn max_mip_levels(&self) -> u32 {
        let largest = self.width.max(self.height).max(1);
        32 - largest.leading_zeros()
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            kind: TextureKind::D2,
            width: 0,
            height: 0,
            depth: 1,
            mip_levels: 1,
            format: TextureFormat::default(),
            usage: ResourceUsage::Default,
            bind_flags: BindFlags::SHADER_RESOURCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_layers() {
        let desc = TextureDescriptor::new_cube(64, TextureFormat::Rgba16Float);
        assert_eq!(desc.layers(), 6);
        assert_eq!(desc.level0_size(), 64 * 64 * 6 * 8);
    }

    #[test]
    fn test_max_mip_levels() {
        let desc = TextureDescriptor::new_2d(128, 32, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.max_mip_levels(), 8);
        let desc = TextureDescriptor::new_2d(1, 1, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.max_mip_levels(), 1);
    }

    #[test]
    fn test_depth_formats() {
        assert!(TextureFormat::Depth24PlusStencil8.has_stencil());
        assert!(TextureFormat::Depth32Float.is_depth_stencil());
        assert!(!TextureFormat::Rgba8Unorm.is_depth_stencil());
    }
}
