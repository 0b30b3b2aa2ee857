//! Shader build driver.

use crate::backend::{GpuBackend, NativeHandle};
use crate::error::GraphicsError;
use crate::release::ReleaseQueue;

use super::cache::{program_name, ProgramCache, ProgramDescriptor};
use super::preprocess::Preprocessor;
use super::reflect::reflect;
use super::sections::SectionRegistry;
use super::transpile::{parse_wgsl, transpile, ParsedModule};
use super::{Shader, ShaderDescriptor, ShaderDialect, ShaderFlags, ShaderStage, StageBinary};

/// Stages whose entry point appears in `source`.
///
/// Detection is textual: an entry point name inside a comment counts too.
pub fn detect_stages(source: &str) -> Vec<ShaderStage> {
    ShaderStage::ALL
        .into_iter()
        .filter(|stage| source.contains(stage.entry_point()))
        .collect()
}

/// Builds [`Shader`]s against one backend.
pub struct ShaderBuilder<'a> {
    backend: &'a mut dyn GpuBackend,
    sections: &'a SectionRegistry,
    cache: &'a ProgramCache,
    release: ReleaseQueue,
}

impl<'a> ShaderBuilder<'a> {
    pub fn new(
        backend: &'a mut dyn GpuBackend,
        sections: &'a SectionRegistry,
        cache: &'a ProgramCache,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            backend,
            sections,
            cache,
            release,
        }
    }

    /// Preprocess `desc.source` with the backend's target defines injected.
    pub fn preprocess(&self, desc: &ShaderDescriptor) -> Result<String, GraphicsError> {
        let dialect = self.backend.shader_dialect();
        let mut preprocessor = Preprocessor::new().with_sections(self.sections);
        if let Some(handler) = &desc.include_handler {
            preprocessor = preprocessor.with_include_handler(handler.as_ref());
        }
        preprocessor.define(self.backend.kind().target_define(), "1");
        preprocessor.define(dialect.define(), "1");
        for (name, value) in &desc.defines {
            preprocessor.define(name.as_str(), value.as_str());
        }
        preprocessor.process(&desc.name, &desc.source)
    }

    /// Build every stage detected in the source.
    ///
    /// Fails if any detected stage fails; stage objects created before the
    /// failure are released.
    pub fn build(&mut self, desc: &ShaderDescriptor) -> Result<Shader, GraphicsError> {
        let source = self.preprocess(desc)?;
        let stages = detect_stages(&source);
        if stages.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{}: no shader entry points found",
                desc.name
            )));
        }

        let mut compiled: Vec<(ShaderStage, NativeHandle, StageBinary)> = Vec::new();
        let mut parsed = None;
        for stage in stages {
            let result = self
                .stage_binary(desc, &source, stage, &mut parsed)
                .and_then(|binary| {
                    let handle = self.backend.create_shader_stage(stage, &binary)?;
                    Ok((stage, handle, binary))
                });
            match result {
                Ok(entry) => compiled.push(entry),
                Err(e) => {
                    for (_, handle, _) in compiled {
                        self.backend.release(handle);
                    }
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Created shader '{}' with {} stage(s)",
            desc.name,
            compiled.len()
        );
        Ok(Shader::new(desc.name.clone(), compiled, self.release.clone()))
    }

    fn stage_binary(
        &mut self,
        desc: &ShaderDescriptor,
        source: &str,
        stage: ShaderStage,
        parsed: &mut Option<ParsedModule>,
    ) -> Result<StageBinary, GraphicsError> {
        let dialect = self.backend.shader_dialect();
        let use_cache = self.cache.is_enabled() && !desc.flags.contains(ShaderFlags::NO_CACHE);
        let program = ProgramDescriptor::new(desc.name.clone(), stage, dialect)
            .with_backend(self.backend.kind())
            .with_defines(&desc.defines)
            .with_flags(desc.flags);
        let name = program_name(&program);

        if use_cache {
            if let Some(binary) = self.cache.load_stage(&name) {
                log::debug!("Program cache hit: {} {stage} ({name})", desc.name);
                return Ok(binary);
            }
            log::debug!("Program cache miss: {} {stage} ({name})", desc.name);
        }

        if parsed.is_none() {
            *parsed = Some(parse_wgsl(source, stage)?);
        }
        let Some(module) = parsed.as_ref() else {
            return Err(GraphicsError::Internal("shader module missing".into()));
        };

        let transpiled = transpile(module, source, stage, dialect)?;
        let code = if dialect == ShaderDialect::SpirV {
            transpiled.code
        } else {
            let text = std::str::from_utf8(&transpiled.code)
                .map_err(|e| GraphicsError::Internal(format!("generated source: {e}")))?;
            self.backend
                .compile_stage(stage, text, &transpiled.entry_point)?
        };

        let mut reflection = reflect(module, stage);
        reflection.combined_samplers = transpiled.combined_samplers;
        let binary = StageBinary {
            stage,
            entry_point: transpiled.entry_point,
            code,
            reflection,
        };

        if use_cache {
            if let Err(e) = self.cache.store_stage(&name, &binary) {
                log::warn!("Failed to store program {name}: {e}");
            }
        }
        Ok(binary)
    }
}
