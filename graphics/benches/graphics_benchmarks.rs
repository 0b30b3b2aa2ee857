use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use rhodium_graphics::shader::cache::program_name;
use rhodium_graphics::shader::preprocess::Preprocessor;
use rhodium_graphics::shader::sections::SectionRegistry;
use rhodium_graphics::{
    DeviceDescriptor, GraphicsDevice, ProgramDescriptor, RenderBackend, ShaderDialect,
    ShaderStage, ShaderStages, TextureDescriptor, TextureFormat,
};

fn dummy_device() -> GraphicsDevice {
    GraphicsDevice::new(DeviceDescriptor::new().with_backend(RenderBackend::Dummy)).unwrap()
}

// ---------------------------------------------------------------------------
// Register cache
// ---------------------------------------------------------------------------

fn bench_redundant_texture_binds(c: &mut Criterion) {
    let mut device = dummy_device();
    let texture = device
        .create_texture(&TextureDescriptor::new_2d(64, 64, TextureFormat::Rgba8Unorm), None)
        .unwrap();

    c.bench_function("set_texture_16_slots_cached", |b| {
        b.iter(|| {
            for slot in 0..16 {
                device.set_texture(ShaderStages::PIXEL, black_box(slot), Some(&texture));
            }
        });
    });
}

fn bench_alternating_texture_binds(c: &mut Criterion) {
    let mut device = dummy_device();
    let desc = TextureDescriptor::new_2d(64, 64, TextureFormat::Rgba8Unorm);
    let first = device.create_texture(&desc, None).unwrap();
    let second = device.create_texture(&desc, None).unwrap();

    c.bench_function("set_texture_alternating", |b| {
        b.iter(|| {
            device.set_texture(ShaderStages::PIXEL, 0, Some(&first));
            device.set_texture(ShaderStages::PIXEL, 0, Some(&second));
        });
    });
}

// ---------------------------------------------------------------------------
// Shader pipeline
// ---------------------------------------------------------------------------

const LIT_SOURCE: &str = r#"
#include "common"

#if LIGHTS > 4 && defined(SHADOWS)
const LIGHT_COUNT: u32 = LIGHTS;
#elif LIGHTS > 0
const LIGHT_COUNT: u32 = 4u;
#else
const LIGHT_COUNT: u32 = 0u;
#endif

@fragment
fn ps_main() -> @location(0) vec4<f32> {
    return vec4<f32>(f32(LIGHT_COUNT) / 8.0, 0.0, 0.0, 1.0);
}
"#;

fn bench_preprocess(c: &mut Criterion) {
    let sections = SectionRegistry::builtin();

    c.bench_function("preprocess_with_include", |b| {
        b.iter(|| {
            let mut preprocessor = Preprocessor::new().with_sections(&sections);
            preprocessor.define("LIGHTS", "8");
            preprocessor.define("SHADOWS", "1");
            black_box(preprocessor.process("lit.wgsl", black_box(LIT_SOURCE)).unwrap());
        });
    });
}

fn bench_program_name(c: &mut Criterion) {
    let desc = ProgramDescriptor::new("lit.wgsl", ShaderStage::Pixel, ShaderDialect::Glsl)
        .with_define("SHADOWS", "1")
        .with_define("LIGHTS", "8")
        .with_define("QUALITY", "high");

    c.bench_function("program_name_3_defines", |b| {
        b.iter(|| black_box(program_name(black_box(&desc))));
    });
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

fn bench_dispatch_queue(c: &mut Criterion) {
    let mut device = dummy_device();
    let queue = device.work_queue();

    c.bench_function("dispatch_queue_256_jobs", |b| {
        b.iter_batched(
            || {
                let producer = queue.clone();
                std::thread::spawn(move || {
                    for _ in 0..256 {
                        producer.enqueue(|device| {
                            black_box(device.frame_count());
                        });
                    }
                })
                .join()
                .unwrap();
            },
            |()| black_box(device.dispatch_queue()),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_redundant_texture_binds,
    bench_alternating_texture_binds,
    bench_preprocess,
    bench_program_name,
    bench_dispatch_queue,
);
criterion_main!(benches);
