//! Shader pipeline integration tests: preprocessing, sections, the program
//! cache and per-backend stage creation through a device.

mod common;

use std::sync::Arc;

use rstest::rstest;

use common::{Backend, TestContext, COLORED_SHADER, TINT_SHADER};
use rhodium_graphics::{
    DeviceDescriptor, GraphicsError, ProgramDescriptor, ShaderDescriptor, ShaderDialect,
    ShaderFlags, ShaderStage,
};

#[cfg(feature = "dummy")]
use rhodium_graphics::{
    backend::dummy::BackendCall, DummyBackend, GraphicsDevice, RenderBackend,
};

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_load_builtin_immediate_shader(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let shader = device.load_shader("immediate", &[]).unwrap();
    assert!(shader.has_stage(ShaderStage::Vertex));
    assert!(shader.has_stage(ShaderStage::Pixel));
    assert!(!shader.has_stage(ShaderStage::Compute));
    assert_eq!(shader.signature().len(), 3);
    assert_eq!(shader.slot("im").map(|s| s.slot), Some(0));
    assert!(shader.slot("im_texture").is_none());

    let textured = device
        .load_shader("immediate", &[("IM_TEXTURED", "1")])
        .unwrap();
    let texture = textured.slot("im_texture").expect("textured variant binds a texture");
    assert_eq!(texture.group, 1);
    assert_eq!(textured.slot("im_sampler").map(|s| s.group), Some(2));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_invalid_source_reports_diagnostic(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let broken = COLORED_SHADER.replace("return in.color;", "return in.colour;");
    let result = device.create_shader(&ShaderDescriptor::new("broken.wgsl", broken));
    match result {
        Err(GraphicsError::ShaderCompilation { diagnostic, .. }) => {
            assert!(diagnostic.contains("colour"), "diagnostic: {diagnostic}");
        }
        other => panic!("expected a compilation error, got {other:?}"),
    }

    let none = device.create_shader(&ShaderDescriptor::new("empty.wgsl", "const X: f32 = 1.0;"));
    assert!(matches!(none, Err(GraphicsError::InvalidParameter(_))));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_sections_and_includes(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let info = device.get_section_info("common").unwrap();
    assert_eq!(info.name, "common.wgsl");
    assert!(info.builtin);
    assert!(device.get_section_data("common.wgsl").unwrap().contains("clamp01"));
    assert!(matches!(
        device.get_section_info("missing"),
        Err(GraphicsError::SectionNotFound(_))
    ));

    assert!(!device.add_section(
        "palette.wgsl",
        "const ACCENT: vec4<f32> = vec4<f32>(1.0, 0.5, 0.0, 1.0);\n"
    ));
    let source = r#"
#include "palette"

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index), 0.0, 0.0, 1.0);
}

@fragment
fn ps_main() -> @location(0) vec4<f32> {
    return ACCENT;
}
"#;
    device
        .create_shader(&ShaderDescriptor::new("accent.wgsl", source))
        .unwrap();

    assert!(device.remove_section("palette.wgsl"));
    let missing = device.create_shader(&ShaderDescriptor::new("accent.wgsl", source));
    assert!(matches!(missing, Err(GraphicsError::IncludeNotFound { .. })));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_include_handler_takes_precedence(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let source = r#"
#include "common"

@fragment
fn ps_main() -> @location(0) vec4<f32> {
    return vec4<f32>(HANDLER_GRAY, HANDLER_GRAY, HANDLER_GRAY, 1.0);
}
"#;
    // The builtin `common` section has no HANDLER_GRAY.
    let builtin = device.create_shader(&ShaderDescriptor::new("gray.wgsl", source));
    assert!(matches!(builtin, Err(GraphicsError::ShaderCompilation { .. })));

    let handler = Arc::new(|name: &str, _from: &str| {
        (name == "common").then(|| "const HANDLER_GRAY: f32 = 0.5;\n".to_string())
    });
    let desc = ShaderDescriptor::new("gray.wgsl", source).with_include_handler(handler);
    let shader = device.create_shader(&desc).unwrap();
    assert!(shader.has_stage(ShaderStage::Pixel));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::wgpu(Backend::Wgpu)]
fn test_preprocessor_errors_surface(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let device = &mut ctx.device;

    let source = "#if TARGET_NONE\n#error no backend\n#endif\n#if defined(REQUIRE_FEATURE)\n#error feature required\n#endif\n";
    let desc = ShaderDescriptor::new("guard.wgsl", format!("{source}{COLORED_SHADER}"))
        .with_define("REQUIRE_FEATURE", "");
    match device.create_shader(&desc) {
        Err(GraphicsError::Preprocess { file, line, message }) => {
            assert_eq!(file, "guard.wgsl");
            assert_eq!(line, 5);
            assert!(message.contains("feature required"));
        }
        other => panic!("expected a preprocess error, got {other:?}"),
    }
}

#[cfg(feature = "dummy")]
fn cached_device(dir: &std::path::Path) -> GraphicsDevice {
    GraphicsDevice::with_backend(
        DeviceDescriptor::new().with_program_cache_dir(dir),
        Box::new(DummyBackend::new()),
    )
    .unwrap()
}

#[cfg(feature = "dummy")]
fn compile_count(device: &GraphicsDevice) -> u64 {
    device
        .backend_as::<DummyBackend>()
        .map(|dummy| dummy.call_count(BackendCall::CompileStage))
        .unwrap_or_default()
}

#[cfg(feature = "dummy")]
#[test]
fn test_program_cache_persists_across_devices() {
    let dir = tempfile::tempdir().unwrap();
    let desc = ShaderDescriptor::new("tint.wgsl", TINT_SHADER).with_define("TINT_SCALE", "2.0");

    let mut first = cached_device(dir.path());
    let shader = first.create_shader(&desc).unwrap();
    assert_eq!(compile_count(&first), 2);

    let name = first.get_program_name(
        &ProgramDescriptor::new("tint.wgsl", ShaderStage::Pixel, ShaderDialect::Wgsl)
            .with_define("TINT_SCALE", "2.0"),
    );
    assert!(name.ends_with(".wgsl"));
    assert!(first.get_program_cache(&name).unwrap().is_some());
    drop(shader);
    drop(first);

    let mut second = cached_device(dir.path());
    let cached = second.create_shader(&desc).unwrap();
    assert_eq!(compile_count(&second), 0);
    assert_eq!(cached.slot("tint").map(|s| s.slot), Some(0));

    // Other defines are a different program.
    second
        .create_shader(&ShaderDescriptor::new("tint.wgsl", TINT_SHADER))
        .unwrap();
    assert_eq!(compile_count(&second), 2);
}

#[cfg(feature = "dummy")]
#[test]
fn test_cached_programs_are_per_backend() {
    let dir = tempfile::tempdir().unwrap();
    let source = format!("#ifdef TARGET_DUMMY\n#define TINT_SCALE 3.0\n#endif\n{TINT_SHADER}");
    let mut device = cached_device(dir.path());
    device
        .create_shader(&ShaderDescriptor::new("target.wgsl", source))
        .unwrap();

    let program = ProgramDescriptor::new("target.wgsl", ShaderStage::Vertex, ShaderDialect::Wgsl);
    let own = device.get_program_name(&program);
    let dummy = device.get_program_name(&program.clone().with_backend(RenderBackend::Dummy));
    let wgpu = device.get_program_name(&program.with_backend(RenderBackend::Wgpu));
    assert_eq!(own, dummy);
    assert_ne!(dummy, wgpu);
    assert!(device.get_program_cache(&dummy).unwrap().is_some());
    assert!(device.get_program_cache(&wgpu).unwrap().is_none());
}

#[cfg(feature = "dummy")]
#[test]
fn test_corrupt_cache_entry_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let desc = ShaderDescriptor::new("tint.wgsl", TINT_SHADER);
    let mut device = cached_device(dir.path());

    let name = device.get_program_name(&ProgramDescriptor::new(
        "tint.wgsl",
        ShaderStage::Vertex,
        ShaderDialect::Wgsl,
    ));
    device.set_program_cache(&name, b"not a program").unwrap();
    assert_eq!(
        device.get_program_cache(&name).unwrap().as_deref(),
        Some(&b"not a program"[..])
    );

    device.create_shader(&desc).unwrap();
    assert_eq!(compile_count(&device), 2);
    // The rebuilt stage replaced the garbage.
    assert_ne!(
        device.get_program_cache(&name).unwrap().as_deref(),
        Some(&b"not a program"[..])
    );
}

#[cfg(feature = "dummy")]
#[test]
fn test_no_cache_flag_bypasses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let desc = ShaderDescriptor::new("tint.wgsl", TINT_SHADER).with_flags(ShaderFlags::NO_CACHE);
    let mut device = cached_device(dir.path());

    device.create_shader(&desc).unwrap();
    device.create_shader(&desc).unwrap();
    assert_eq!(compile_count(&device), 4);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[cfg(feature = "dummy")]
#[rstest]
#[case::glsl(ShaderDialect::Glsl)]
#[case::hlsl(ShaderDialect::Hlsl)]
#[case::msl(ShaderDialect::Msl)]
#[case::spirv(ShaderDialect::SpirV)]
fn test_transpiled_dialects_keep_reflection(#[case] dialect: ShaderDialect) {
    let mut device = GraphicsDevice::with_backend(
        DeviceDescriptor::new(),
        Box::new(DummyBackend::with_dialect(dialect)),
    )
    .unwrap();

    let shader = device.load_shader("immediate", &[("IM_TEXTURED", "")]).unwrap();
    assert_eq!(shader.signature().len(), 3);
    assert!(shader.slot("im").is_some());
    assert!(shader.slot("im_texture").is_some());
    let pixel = shader.stage(ShaderStage::Pixel).unwrap();
    assert!(!pixel.entry_point().is_empty());
}
