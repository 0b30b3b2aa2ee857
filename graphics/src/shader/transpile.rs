//! WGSL to backend dialect translation.
//!
//! Every translation goes through SPIR-V so that all dialects see the same
//! lowered module:
//!
//! ```text
//! WGSL ──parse+validate──▶ naga IR ──spv-out──▶ SPIR-V ──spv-in+validate──▶ naga IR ──▶ GLSL / HLSL / MSL / SPIR-V
//! ```

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};

use crate::error::GraphicsError;

use super::{CombinedSampler, ShaderDialect, ShaderStage};

/// A validated WGSL module.
pub struct ParsedModule {
    pub module: naga::Module,
    pub info: ModuleInfo,
}

impl ParsedModule {
    /// Index of the entry point implementing `stage`, if the module has one.
    pub fn entry_point_index(&self, stage: ShaderStage) -> Option<usize> {
        let naga_stage = stage.to_naga()?;
        self.module
            .entry_points
            .iter()
            .position(|ep| ep.name == stage.entry_point() && ep.stage == naga_stage)
    }
}

/// Output of [`transpile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranspiledStage {
    pub code: Vec<u8>,
    /// Entry point in `code`. GLSL always uses `main`; other writers may rename.
    pub entry_point: String,
    pub combined_samplers: Vec<CombinedSampler>,
}

fn validator() -> Validator {
    Validator::new(ValidationFlags::all(), Capabilities::all())
}

/// Parse and validate WGSL. Diagnostics are reported verbatim against `stage`.
pub fn parse_wgsl(source: &str, stage: ShaderStage) -> Result<ParsedModule, GraphicsError> {
    let module =
        naga::front::wgsl::parse_str(source).map_err(|e| GraphicsError::ShaderCompilation {
            stage,
            diagnostic: e.emit_to_string(source),
        })?;

    let info = validator()
        .validate(&module)
        .map_err(|e| GraphicsError::ShaderCompilation {
            stage,
            diagnostic: e.emit_to_string(source),
        })?;

    Ok(ParsedModule { module, info })
}

/// Translate one stage of a parsed module into `dialect`.
pub fn transpile(
    parsed: &ParsedModule,
    source: &str,
    stage: ShaderStage,
    dialect: ShaderDialect,
) -> Result<TranspiledStage, GraphicsError> {
    match dialect {
        ShaderDialect::Wgsl => Ok(TranspiledStage {
            code: source.as_bytes().to_vec(),
            entry_point: stage.entry_point().to_string(),
            combined_samplers: Vec::new(),
        }),
        ShaderDialect::SpirV => {
            let (_, words) = stage_spirv(parsed, stage)?;
            Ok(TranspiledStage {
                code: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
                entry_point: stage.entry_point().to_string(),
                combined_samplers: Vec::new(),
            })
        }
        ShaderDialect::Glsl | ShaderDialect::GlslEs => {
            let (naga_stage, words) = stage_spirv(parsed, stage)?;
            write_glsl(&read_spirv(&words)?, naga_stage, stage, dialect)
        }
        ShaderDialect::Hlsl => {
            let (_, words) = stage_spirv(parsed, stage)?;
            write_hlsl(&read_spirv(&words)?, stage)
        }
        ShaderDialect::Msl => {
            let (_, words) = stage_spirv(parsed, stage)?;
            write_msl(&read_spirv(&words)?, stage)
        }
    }
}

/// SPIR-V for the entry point of `stage`.
fn stage_spirv(
    parsed: &ParsedModule,
    stage: ShaderStage,
) -> Result<(naga::ShaderStage, Vec<u32>), GraphicsError> {
    let naga_stage = stage.to_naga().ok_or_else(|| {
        GraphicsError::UnsupportedTarget(format!("{stage} shaders cannot be translated"))
    })?;
    if parsed.entry_point_index(stage).is_none() {
        return Err(GraphicsError::ShaderCompilation {
            stage,
            diagnostic: format!("entry point '{}' not found", stage.entry_point()),
        });
    }
    let words = write_spirv(parsed, naga_stage, stage.entry_point())?;
    Ok((naga_stage, words))
}

fn write_spirv(
    parsed: &ParsedModule,
    naga_stage: naga::ShaderStage,
    entry_point: &str,
) -> Result<Vec<u32>, GraphicsError> {
    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };
    naga::back::spv::write_vec(
        &parsed.module,
        &parsed.info,
        &options,
        Some(&pipeline_options),
    )
    .map_err(|e| GraphicsError::Internal(format!("SPIR-V generation error: {e}")))
}

fn read_spirv(words: &[u32]) -> Result<ParsedModule, GraphicsError> {
    let module = naga::front::spv::parse_u8_slice(
        bytemuck::cast_slice(words),
        &naga::front::spv::Options::default(),
    )
    .map_err(|e| GraphicsError::Internal(format!("SPIR-V parse error: {e}")))?;
    let info = validator()
        .validate(&module)
        .map_err(|e| GraphicsError::Internal(format!("SPIR-V validation error: {e}")))?;
    Ok(ParsedModule { module, info })
}

fn lowered_entry_index(lowered: &ParsedModule, stage: ShaderStage) -> Result<usize, GraphicsError> {
    lowered.entry_point_index(stage).ok_or_else(|| {
        GraphicsError::Internal(format!(
            "entry point '{}' lost in SPIR-V round trip",
            stage.entry_point()
        ))
    })
}

#[cfg(feature = "glsl-out")]
fn write_glsl(
    lowered: &ParsedModule,
    naga_stage: naga::ShaderStage,
    stage: ShaderStage,
    dialect: ShaderDialect,
) -> Result<TranspiledStage, GraphicsError> {
    use naga::back::glsl;

    let version = match dialect {
        ShaderDialect::GlslEs => glsl::Version::Embedded {
            version: 310,
            is_webgl: false,
        },
        _ => glsl::Version::Desktop(450),
    };
    let options = glsl::Options {
        version,
        ..Default::default()
    };
    let pipeline_options = glsl::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: stage.entry_point().to_string(),
        multiview: None,
    };

    let mut code = String::new();
    let reflection = {
        let mut writer = glsl::Writer::new(
            &mut code,
            &lowered.module,
            &lowered.info,
            &options,
            &pipeline_options,
            naga::proc::BoundsCheckPolicies::default(),
        )
        .map_err(|e| GraphicsError::Internal(format!("GLSL generation error: {e}")))?;
        writer
            .write()
            .map_err(|e| GraphicsError::Internal(format!("GLSL generation error: {e}")))?
    };

    let globals = &lowered.module.global_variables;
    let slot_of = |handle: naga::Handle<naga::GlobalVariable>| {
        globals[handle]
            .binding
            .as_ref()
            .map(|b| b.binding)
            .unwrap_or(0)
    };
    let mut combined_samplers: Vec<CombinedSampler> = reflection
        .texture_mapping
        .iter()
        .map(|(name, mapping)| CombinedSampler {
            name: name.clone(),
            texture_slot: slot_of(mapping.texture),
            sampler_slot: mapping.sampler.map(slot_of).unwrap_or(0),
        })
        .collect();
    combined_samplers.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(TranspiledStage {
        code: code.into_bytes(),
        entry_point: "main".to_string(),
        combined_samplers,
    })
}

#[cfg(not(feature = "glsl-out"))]
fn write_glsl(
    _lowered: &ParsedModule,
    _naga_stage: naga::ShaderStage,
    _stage: ShaderStage,
    dialect: ShaderDialect,
) -> Result<TranspiledStage, GraphicsError> {
    Err(GraphicsError::UnsupportedTarget(format!(
        "{} output requires the glsl-out feature",
        dialect.name()
    )))
}

#[cfg(feature = "hlsl-out")]
fn write_hlsl(lowered: &ParsedModule, stage: ShaderStage) -> Result<TranspiledStage, GraphicsError> {
    use naga::back::hlsl;

    let index = lowered_entry_index(lowered, stage)?;
    let options = hlsl::Options {
        shader_model: hlsl::ShaderModel::V5_0,
        ..Default::default()
    };
    let pipeline_options = hlsl::PipelineOptions::default();

    let mut code = String::new();
    let reflection = {
        let mut writer = hlsl::Writer::new(&mut code, &options, &pipeline_options);
        writer
            .write(&lowered.module, &lowered.info, None)
            .map_err(|e| GraphicsError::Internal(format!("HLSL generation error: {e}")))?
    };
    let entry_point = match reflection.entry_point_names.get(index) {
        Some(Ok(name)) => name.clone(),
        Some(Err(e)) => {
            return Err(GraphicsError::ShaderCompilation {
                stage,
                diagnostic: e.to_string(),
            });
        }
        None => stage.entry_point().to_string(),
    };

    Ok(TranspiledStage {
        code: code.into_bytes(),
        entry_point,
        combined_samplers: Vec::new(),
    })
}

#[cfg(not(feature = "hlsl-out"))]
fn write_hlsl(_lowered: &ParsedModule, _stage: ShaderStage) -> Result<TranspiledStage, GraphicsError> {
    Err(GraphicsError::UnsupportedTarget(
        "hlsl output requires the hlsl-out feature".into(),
    ))
}

#[cfg(feature = "msl-out")]
fn write_msl(lowered: &ParsedModule, stage: ShaderStage) -> Result<TranspiledStage, GraphicsError> {
    use naga::back::msl;

    let index = lowered_entry_index(lowered, stage)?;
    let options = msl::Options {
        lang_version: (2, 1),
        ..Default::default()
    };
    let (code, translation) = msl::write_string(
        &lowered.module,
        &lowered.info,
        &options,
        &msl::PipelineOptions::default(),
    )
    .map_err(|e| GraphicsError::Internal(format!("MSL generation error: {e}")))?;

    let entry_point = match translation.entry_point_names.get(index) {
        Some(Ok(name)) => name.clone(),
        Some(Err(e)) => {
            return Err(GraphicsError::ShaderCompilation {
                stage,
                diagnostic: e.to_string(),
            });
        }
        None => stage.entry_point().to_string(),
    };

    Ok(TranspiledStage {
        code: code.into_bytes(),
        entry_point,
        combined_samplers: Vec::new(),
    })
}

#[cfg(not(feature = "msl-out"))]
fn write_msl(_lowered: &ParsedModule, _stage: ShaderStage) -> Result<TranspiledStage, GraphicsError> {
    Err(GraphicsError::UnsupportedTarget(
        "msl output requires the msl-out feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXTURED: &str = r#"
@group(1) @binding(0) var color_texture: texture_2d<f32>;
@group(2) @binding(0) var color_sampler: sampler;

@fragment
fn ps_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(color_texture, color_sampler, uv);
}
"#;

    #[test]
    fn test_parse_error_is_verbatim() {
        match parse_wgsl("fn broken( {", ShaderStage::Pixel) {
            Err(GraphicsError::ShaderCompilation { stage, diagnostic }) => {
                assert_eq!(stage, ShaderStage::Pixel);
                assert!(diagnostic.contains("error"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("broken source parsed"),
        }
    }

    #[test]
    fn test_wgsl_passthrough() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Pixel).unwrap();
        let out = transpile(&parsed, TEXTURED, ShaderStage::Pixel, ShaderDialect::Wgsl).unwrap();
        assert_eq!(out.code, TEXTURED.as_bytes());
        assert_eq!(out.entry_point, "ps_main");
    }

    #[test]
    fn test_spirv_output() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Pixel).unwrap();
        let out = transpile(&parsed, TEXTURED, ShaderStage::Pixel, ShaderDialect::SpirV).unwrap();
        // SPIR-V magic number, little endian.
        assert_eq!(&out.code[..4], &[0x03, 0x02, 0x23, 0x07]);
    }

    #[cfg(feature = "glsl-out")]
    #[test]
    fn test_glsl_combined_sampler() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Pixel).unwrap();
        let out = transpile(&parsed, TEXTURED, ShaderStage::Pixel, ShaderDialect::Glsl).unwrap();
        let code = String::from_utf8(out.code).unwrap();
        assert!(code.starts_with("#version 450"));
        assert_eq!(out.entry_point, "main");
        assert_eq!(out.combined_samplers.len(), 1);
        assert_eq!(out.combined_samplers[0].texture_slot, 0);
        assert_eq!(out.combined_samplers[0].sampler_slot, 0);
    }

    #[cfg(feature = "hlsl-out")]
    #[test]
    fn test_hlsl_output() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Pixel).unwrap();
        let out = transpile(&parsed, TEXTURED, ShaderStage::Pixel, ShaderDialect::Hlsl).unwrap();
        assert!(!out.code.is_empty());
        assert!(!out.entry_point.is_empty());
    }

    #[test]
    fn test_missing_entry_point() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Vertex).unwrap();
        assert!(matches!(
            transpile(&parsed, TEXTURED, ShaderStage::Vertex, ShaderDialect::SpirV),
            Err(GraphicsError::ShaderCompilation { .. })
        ));
    }

    #[test]
    fn test_geometry_stage_unsupported() {
        let parsed = parse_wgsl(TEXTURED, ShaderStage::Geometry).unwrap();
        assert!(matches!(
            transpile(&parsed, TEXTURED, ShaderStage::Geometry, ShaderDialect::Glsl),
            Err(GraphicsError::UnsupportedTarget(_))
        ));
    }
}
