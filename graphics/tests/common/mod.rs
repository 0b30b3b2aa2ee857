//! Common utilities for device integration tests.
//!
//! Tests are parameterized over [`Backend`] and skip backends that are not
//! compiled in or cannot create a device on this machine.

#![allow(dead_code)]

use rhodium_graphics::{
    Color, DeviceDescriptor, GraphicsDevice, ImmediateVertex, RenderBackend, ShaderDescriptor,
};

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Backends the integration tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Dummy backend (no GPU, records calls).
    Dummy,
    /// wgpu on whatever adapter the machine offers.
    Wgpu,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            #[cfg(feature = "dummy")]
            Backend::Dummy => true,
            #[cfg(not(feature = "dummy"))]
            Backend::Dummy => false,
            #[cfg(feature = "wgpu-backend")]
            Backend::Wgpu => true,
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::Wgpu => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Dummy => "dummy",
            Backend::Wgpu => "wgpu",
        }
    }

    pub fn render_backend(self) -> RenderBackend {
        match self {
            Backend::Dummy => RenderBackend::Dummy,
            Backend::Wgpu => RenderBackend::Wgpu,
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 64;

/// A device created for one test.
pub struct TestContext {
    pub backend: Backend,
    pub device: GraphicsDevice,
}

impl TestContext {
    /// Create a context, or `None` if the backend cannot run here.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_descriptor(backend, DeviceDescriptor::new())
    }

    pub fn with_descriptor(backend: Backend, desc: DeviceDescriptor) -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        if !backend.is_available() {
            return None;
        }
        let desc = desc
            .with_backend(backend.render_backend())
            .with_size(WIDTH, HEIGHT)
            .with_label(format!("{} test device", backend.name()));
        match GraphicsDevice::new(desc) {
            Ok(device) => Some(Self { backend, device }),
            Err(e) => {
                eprintln!("Backend {} failed to initialize: {e}", backend.name());
                None
            }
        }
    }

    /// Whether this context runs on the dummy backend.
    pub fn is_dummy(&self) -> bool {
        self.backend == Backend::Dummy
    }
}

// ============================================================================
// Shaders
// ============================================================================

/// Position and color in, color out.
pub const COLORED_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) color: vec4<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 1.0);
    out.color = color;
    return out;
}

@fragment
fn ps_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return in.color;
}
"#;

/// Doubles every element of a storage buffer in place.
pub const DOUBLE_SHADER: &str = r#"
@group(3) @binding(0) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(64)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&values)) {
        values[id.x] = values[id.x] * 2u;
    }
}
"#;

/// Tints a constant color, with the tint selected by a define.
pub const TINT_SHADER: &str = r#"
#include "common"

struct Tint {
    color: vec4<f32>,
};

@group(0) @binding(0) var<uniform> tint: Tint;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    let y = f32(i32(index & 1u) * 2 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}

@fragment
fn ps_main() -> @location(0) vec4<f32> {
#ifdef TINT_SCALE
    return tint.color * TINT_SCALE;
#else
    return tint.color;
#endif
}
"#;

pub fn colored_shader() -> ShaderDescriptor {
    ShaderDescriptor::new("colored.wgsl", COLORED_SHADER)
}

/// Vertices of a triangle covering the center of the target.
pub fn triangle(color: Color) -> [ImmediateVertex; 3] {
    let vertex = |position: [f32; 3]| ImmediateVertex {
        position,
        color: color.to_array(),
        uv: [0.0, 0.0],
    };
    [
        vertex([0.0, 0.5, 0.0]),
        vertex([-0.5, -0.5, 0.0]),
        vertex([0.5, -0.5, 0.0]),
    ]
}
