//! Device integration tests.
//!
//! Every test runs against each backend through `rstest` cases. Backends that
//! cannot create a device on the current machine are skipped.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test device_tests
//!
//! # Dummy backend only
//! cargo test --test device_tests --no-default-features --features dummy
//! ```

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::rstest;

use common::{
    colored_shader, triangle, Backend, TestContext, DOUBLE_SHADER, HEIGHT, TINT_SHADER, WIDTH,
};
use rhodium_graphics::{
    BufferDescriptor, BufferKind, Color, GraphicsError, ImmediateVertex, IndexFormat, MapMode,
    PrimitiveTopology, QueryKind, ResourceRef, ShaderDescriptor, ShaderStages, TextureFormat,
    Viewport,
};

#[cfg(feature = "dummy")]
use rhodium_graphics::{backend::dummy::BackendCall, DummyBackend};

// ============================================================================
// Buffers
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_buffer_update_and_read(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let device = &mut ctx.device;

    let data: Vec<u8> = (0..64).collect();
    let desc = BufferDescriptor::new(BufferKind::Storage, 64).with_label("roundtrip");
    let buffer = device.create_buffer(&desc, Some(&data)).unwrap();
    assert_eq!(device.read_buffer(&buffer).unwrap(), data);

    // Unaligned write in the middle.
    device.update_buffer(&buffer, 13, &[0xAA, 0xBB, 0xCC]).unwrap();
    let contents = device.read_buffer(&buffer).unwrap();
    assert_eq!(&contents[12..17], &[12, 0xAA, 0xBB, 0xCC, 16]);
    assert_eq!(contents.len(), 64);

    let overflow = device.update_buffer(&buffer, 62, &[0; 4]);
    assert!(matches!(overflow, Err(GraphicsError::InvalidParameter(_))));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_map_buffer_write_discard(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let buffer = device.create_constant_buffer(20).unwrap();
    assert_eq!(buffer.size(), 32);

    let written = device
        .map_buffer(&buffer, MapMode::WriteDiscard, |bytes| {
            bytes[..4].copy_from_slice(&7u32.to_le_bytes());
            bytes.len()
        })
        .unwrap();
    assert_eq!(written, 32);

    let first = device
        .map_buffer(&buffer, MapMode::Read, |bytes| {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        })
        .unwrap();
    assert_eq!(first, 7);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_copy_resource(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let source = device
        .create_buffer(
            &BufferDescriptor::new(BufferKind::Storage, 16),
            Some(&[5u8; 16]),
        )
        .unwrap();
    let target = device
        .create_buffer(&BufferDescriptor::new(BufferKind::Storage, 32), None)
        .unwrap();
    device.copy_resource(&*target, &*source).unwrap();

    let contents = device.read_buffer(&target).unwrap();
    assert_eq!(&contents[..16], &[5u8; 16]);
    assert_eq!(&contents[16..], &[0u8; 16]);

    let texture = device
        .create_render_target(16, 16, TextureFormat::Rgba8Unorm)
        .unwrap();
    let mixed = device.copy_resource(ResourceRef::from(&*texture), ResourceRef::from(&*source));
    assert!(matches!(mixed, Err(GraphicsError::InvalidParameter(_))));

    let smaller = device
        .create_render_target(8, 8, TextureFormat::Rgba8Unorm)
        .unwrap();
    assert!(device.copy_resource(&*smaller, &*texture).is_err());

    let twin = device
        .create_render_target(16, 16, TextureFormat::Rgba8Unorm)
        .unwrap();
    device.copy_resource(&*twin, &*texture).unwrap();
}

// ============================================================================
// Textures
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_texture_with_mip_chain(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let pixels = vec![0x80u8; 16 * 16 * 4];
    let desc = rhodium_graphics::TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm)
        .with_mip_levels(0);
    let texture = device.create_texture(&desc, Some(&pixels)).unwrap();
    assert_eq!(texture.mip_levels(), 5);

    device
        .update_texture(&texture, 1, 0, &vec![0xFFu8; 8 * 8 * 4])
        .unwrap();
    device.generate_mips(&texture).unwrap();

    let short = device.update_texture(&texture, 0, 0, &[0u8; 16]);
    assert!(matches!(short, Err(GraphicsError::InvalidParameter(_))));
    let missing = device.update_texture(&texture, 5, 0, &pixels);
    assert!(matches!(missing, Err(GraphicsError::InvalidParameter(_))));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_cube_and_volume_textures(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let faces = vec![0u8; 8 * 8 * 4 * 6];
    let cube = device
        .create_texture_cube(8, TextureFormat::Rgba8Unorm, Some(&faces))
        .unwrap();
    assert_eq!(cube.descriptor().layers(), 6);
    device
        .update_texture(&cube, 0, 5, &faces[..8 * 8 * 4])
        .unwrap();

    let volume = device
        .create_texture_3d(4, 4, 4, TextureFormat::R8Unorm, None)
        .unwrap();
    assert_eq!(volume.depth(), 4);
    device.update_texture(&volume, 0, 0, &[1u8; 64]).unwrap();
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_clear_targets(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let color = device
        .create_render_target(WIDTH, HEIGHT, TextureFormat::Rgba8Unorm)
        .unwrap();
    let depth = device
        .create_depth_target(WIDTH, HEIGHT, TextureFormat::Depth24PlusStencil8)
        .unwrap();
    device.set_render_target(Some(&color), Some(&depth));
    device.clear(Color::new(0.2, 0.4, 0.6, 1.0)).unwrap();
    device.clear_depth_stencil(&depth, 1.0, 0).unwrap();
    device.present().unwrap();
    assert_eq!(device.frame_count(), 1);
}

// ============================================================================
// Draws
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_draw_colored_triangle(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let shader = device.create_shader(&colored_shader()).unwrap();
    let layout = device
        .create_input_layout("immediate", ImmediateVertex::layout())
        .unwrap();
    let vertices = device.create_mesh_buffer(&triangle(Color::WHITE)).unwrap();
    let indices = device.create_element_buffer_u16(&[0, 1, 2]).unwrap();

    let target = device
        .create_render_target(WIDTH, HEIGHT, TextureFormat::Rgba8Unorm)
        .unwrap();
    device.set_render_target(Some(&target), None);
    device.clear(Color::BLACK).unwrap();
    device.set_shader(Some(&shader));
    device.set_input_layout(Some(&layout));
    device.set_vertex_buffer(0, Some(&vertices), layout.stride(0), 0);
    device.set_topology(PrimitiveTopology::TriangleList);
    device.draw(3, 0).unwrap();

    device.set_index_buffer(Some(&indices), IndexFormat::Uint16, 0);
    device.draw_indexed(3, 0, 0).unwrap();

    let alpha = device.get_blend_state("alpha");
    device.set_blend_state(alpha.as_deref());
    device.set_viewport(&Viewport::new(0.0, 0.0, 32.0, 32.0));
    device.draw_instanced(3, 2, 0, 0).unwrap();
    device.present().unwrap();

    #[cfg(feature = "dummy")]
    if let Some(dummy) = device.backend_as::<DummyBackend>() {
        assert_eq!(dummy.call_count(BackendCall::Draw), 3);
        assert_eq!(dummy.call_count(BackendCall::CreateInputLayout), 1);
    }
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_draw_with_constants_and_defines(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let desc = ShaderDescriptor::new("tint.wgsl", TINT_SHADER).with_define("TINT_SCALE", "0.5");
    let shader = device.create_shader(&desc).unwrap();
    let tint = shader.slot("tint").expect("tint reflected");
    assert_eq!(tint.slot, 0);

    let constants = device.create_constant_buffer(16).unwrap();
    device
        .update_buffer(&constants, 0, bytemuck::cast_slice(&[1.0f32, 0.5, 0.25, 1.0]))
        .unwrap();

    device.set_shader(Some(&shader));
    device.set_constant_buffer(ShaderStages::PIXEL, tint.slot, Some(&constants));
    device.draw(3, 0).unwrap();
    device.present().unwrap();
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_draw_errors(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    assert!(matches!(
        device.draw(3, 0),
        Err(GraphicsError::InvalidParameter(_))
    ));

    let shader = device.create_shader(&colored_shader()).unwrap();
    device.set_shader(Some(&shader));
    // Vertex inputs but no layout.
    assert!(device.draw(3, 0).is_err());
    // Empty draws are dropped before validation.
    assert!(device.draw(0, 0).is_ok());

    assert!(matches!(
        device.dispatch(1, 1, 1),
        Err(GraphicsError::InvalidParameter(_))
    ));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_compute_doubles_storage_buffer(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let is_dummy = ctx.is_dummy();
    let device = &mut ctx.device;

    let shader = device
        .create_shader(&ShaderDescriptor::new("double.wgsl", DOUBLE_SHADER))
        .unwrap();
    let values: Vec<u32> = (0..128).collect();
    let desc = BufferDescriptor::new(BufferKind::Storage, 512).with_stride(4);
    let buffer = device
        .create_buffer(&desc, Some(bytemuck::cast_slice(&values)))
        .unwrap();

    device.set_shader(Some(&shader));
    device.set_unordered_access(0, Some(ResourceRef::from(&*buffer)));
    device.dispatch(2, 1, 1).unwrap();

    let result = device.read_buffer(&buffer).unwrap();
    let result: &[u32] = bytemuck::cast_slice(&result);
    if is_dummy {
        assert_eq!(result, values.as_slice());
    } else {
        let doubled: Vec<u32> = values.iter().map(|v| v * 2).collect();
        assert_eq!(result, doubled.as_slice());
    }
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_immediate_mode(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    device.im_begin(PrimitiveTopology::TriangleList);
    device.im_color(Color::new(1.0, 0.0, 0.0, 1.0));
    device.im_vertex([0.0, 0.5, 0.0]);
    device.im_vertex([-0.5, -0.5, 0.0]);
    device.im_vertex([0.5, -0.5, 0.0]);
    device.im_end().unwrap();

    let texture = device
        .create_texture_2d(2, 2, TextureFormat::Rgba8Unorm, Some(&[0xFF; 16]))
        .unwrap();
    device.im_set_texture(Some(&texture));
    device.im_begin(PrimitiveTopology::LineStrip);
    device.im_texcoord([0.0, 0.0]);
    device.im_vertex([-1.0, -1.0, 0.0]);
    device.im_texcoord([1.0, 1.0]);
    device.im_vertex([1.0, 1.0, 0.0]);
    device.im_end().unwrap();
    device.im_set_texture(None);

    // An empty block draws nothing.
    device.im_begin(PrimitiveTopology::PointList);
    device.im_end().unwrap();

    device.present().unwrap();
}

// ============================================================================
// Queries
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_occlusion_query(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let is_dummy = ctx.is_dummy();
    let device = &mut ctx.device;

    let shader = device.create_shader(&colored_shader()).unwrap();
    let layout = device
        .create_input_layout("immediate", ImmediateVertex::layout())
        .unwrap();
    let vertices = device.create_mesh_buffer(&triangle(Color::WHITE)).unwrap();
    let query = device.create_query(QueryKind::Occlusion).unwrap();
    assert_eq!(query.kind(), QueryKind::Occlusion);

    device.set_shader(Some(&shader));
    device.set_input_layout(Some(&layout));
    device.set_vertex_buffer(0, Some(&vertices), layout.stride(0), 0);
    device.begin_query(&query);
    assert_eq!(device.get_query_data(&query).unwrap(), None);
    device.draw(3, 0).unwrap();
    device.end_query(&query);
    device.present().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let samples = loop {
        if let Some(samples) = device.get_query_data(&query).unwrap() {
            break samples;
        }
        assert!(Instant::now() < deadline, "query result never arrived");
        std::thread::sleep(Duration::from_millis(1));
    };
    if !is_dummy {
        assert!(samples > 0);
    }
}

// ============================================================================
// Lifetime
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_resize_keeps_back_buffer_bound(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let back_buffer = Arc::clone(device.back_buffer());
    device.resize(32, 16).unwrap();
    assert_eq!((device.width(), device.height()), (32, 16));
    assert_eq!(back_buffer.width(), 32);
    assert!(Arc::ptr_eq(&device.render_targets()[0], &back_buffer));
    assert!(device.resize(0, 16).is_err());

    device.clear(Color::WHITE).unwrap();
    device.present().unwrap();
}

#[cfg(feature = "dummy")]
#[test]
fn test_dropped_resources_release_at_present() {
    let Some(mut ctx) = TestContext::new(Backend::Dummy) else {
        return;
    };
    let device = &mut ctx.device;
    let live = |device: &rhodium_graphics::GraphicsDevice| {
        device
            .backend_as::<DummyBackend>()
            .map(DummyBackend::live_objects)
            .unwrap_or_default()
    };

    let before = live(device);
    let buffer = device.create_constant_buffer(64).unwrap();
    let texture = device
        .create_texture_2d(4, 4, TextureFormat::Rgba8Unorm, None)
        .unwrap();
    device.set_texture(ShaderStages::PIXEL, 0, Some(&texture));
    assert_eq!(live(device), before + 2);

    drop(buffer);
    drop(texture);
    // Still alive until the device collects.
    assert_eq!(live(device), before + 2);
    device.present().unwrap();
    assert_eq!(live(device), before);
}

#[cfg(feature = "dummy")]
#[test]
fn test_register_cache_elides_redundant_binds() {
    let Some(mut ctx) = TestContext::new(Backend::Dummy) else {
        return;
    };
    let device = &mut ctx.device;
    let texture = device
        .create_texture_2d(4, 4, TextureFormat::Rgba8Unorm, None)
        .unwrap();
    let sampler = device.get_sampler_state("linear").unwrap();

    for _ in 0..10 {
        device.set_texture(ShaderStages::PIXEL, 0, Some(&texture));
        device.set_sampler(ShaderStages::PIXEL, 0, Some(&sampler));
    }
    let dummy = device.backend_as::<DummyBackend>().unwrap();
    assert_eq!(dummy.call_count(BackendCall::BindTexture), 1);
    assert_eq!(dummy.call_count(BackendCall::BindSampler), 1);
    assert!(device.register_stats().hits >= 18);

    device.flush_state();
    device.set_texture(ShaderStages::PIXEL, 0, Some(&texture));
    let dummy = device.backend_as::<DummyBackend>().unwrap();
    assert_eq!(dummy.call_count(BackendCall::BindTexture), 2);
}
