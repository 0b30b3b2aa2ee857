//! Program cache.
//!
//! Compiled stages are stored on disk under a name derived from everything
//! that influences the output. Each file is an LZ4 frame wrapping a
//! bincode-encoded [`StageBinary`], so a hit skips transpiling, compiling and
//! reflection entirely.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::backend::RenderBackend;
use crate::error::GraphicsError;

use super::{ShaderDialect, ShaderFlags, ShaderStage, StageBinary};

/// Inputs that identify one compiled stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub filename: String,
    /// `(NAME, VALUE)` pairs. Order does not matter; an empty value counts as `1`.
    pub defines: Vec<(String, String)>,
    pub stage: ShaderStage,
    pub dialect: ShaderDialect,
    /// Backend the stage is built for. Its target define changes the preprocessed source.
    pub backend: RenderBackend,
    pub flags: ShaderFlags,
}

impl ProgramDescriptor {
    pub fn new(filename: impl Into<String>, stage: ShaderStage, dialect: ShaderDialect) -> Self {
        Self {
            filename: filename.into(),
            defines: Vec::new(),
            stage,
            dialect,
            backend: RenderBackend::Automatic,
            flags: ShaderFlags::empty(),
        }
    }

    pub fn with_backend(mut self, backend: RenderBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    pub fn with_defines(mut self, defines: &[(String, String)]) -> Self {
        self.defines.extend_from_slice(defines);
        self
    }

    pub fn with_flags(mut self, flags: ShaderFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The string hashed into the program name.
    pub fn key(&self) -> String {
        let mut defines: Vec<(&str, &str)> = self
            .defines
            .iter()
            .map(|(name, value)| {
                let value = if value.is_empty() { "1" } else { value.as_str() };
                (name.as_str(), value)
            })
            .collect();
        // Later definitions of the same name win.
        defines.reverse();
        defines.sort_by(|a, b| a.0.cmp(b.0));
        defines.dedup_by(|a, b| a.0 == b.0);

        let mut key = self.filename.clone();
        for (name, value) in defines {
            key.push('&');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key.push_str("&stage=");
        key.push_str(self.stage.name());
        key.push_str("&backend=");
        key.push_str(self.backend.name());
        key.push_str("&target=");
        key.push_str(self.dialect.name());
        if !self.flags.is_empty() {
            key.push_str(&format!("&flags={}", self.flags.bits()));
        }
        key
    }
}

/// Cache file name for a program: MD5 hex digest of its key plus the dialect extension.
pub fn program_name(desc: &ProgramDescriptor) -> String {
    format!(
        "{:x}{}",
        md5::compute(desc.key().as_bytes()),
        desc.dialect.extension()
    )
}

/// Directory of compressed program binaries.
#[derive(Debug, Clone, Default)]
pub struct ProgramCache {
    dir: Option<PathBuf>,
}

impl ProgramCache {
    /// A cache rooted at `dir`, or a disabled cache for `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Read and decompress a cache entry. A missing entry is `Ok(None)`.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, GraphicsError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }

        let mut decoder = FrameDecoder::new(BufReader::new(File::open(&path)?));
        let mut bytes = Vec::new();
        decoder
            .read_to_end(&mut bytes)
            .map_err(|e| GraphicsError::CacheCorrupted(format!("{}: {e}", path.display())))?;
        Ok(Some(bytes))
    }

    /// Compress and write a cache entry, replacing any existing one.
    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<(), GraphicsError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;

        // Write beside the target and rename so readers never see a partial file.
        let path = dir.join(name);
        let partial = dir.join(format!("{name}.partial"));
        {
            let mut encoder = FrameEncoder::new(BufWriter::new(File::create(&partial)?));
            encoder.write_all(bytes)?;
            let mut writer = encoder
                .finish()
                .map_err(|e| GraphicsError::Internal(format!("lz4 frame: {e}")))?;
            writer.flush()?;
        }
        fs::rename(&partial, &path)?;
        Ok(())
    }

    /// Load a compiled stage. Corrupted entries are logged and treated as misses.
    pub fn load_stage(&self, name: &str) -> Option<StageBinary> {
        let bytes = match self.read(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Ignoring program cache entry {name}: {e}");
                return None;
            }
        };
        match decode_stage(&bytes) {
            Ok(binary) => Some(binary),
            Err(e) => {
                log::warn!("Ignoring program cache entry {name}: {e}");
                None
            }
        }
    }

    /// Store a compiled stage.
    pub fn store_stage(&self, name: &str, binary: &StageBinary) -> Result<(), GraphicsError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let bytes = encode_stage(binary)?;
        self.write(name, &bytes)
    }
}

pub(crate) fn encode_stage(binary: &StageBinary) -> Result<Vec<u8>, GraphicsError> {
    bincode::serde::encode_to_vec(binary, bincode::config::standard())
        .map_err(|e| GraphicsError::Internal(format!("encode program binary: {e}")))
}

pub(crate) fn decode_stage(bytes: &[u8]) -> Result<StageBinary, GraphicsError> {
    let (binary, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| GraphicsError::CacheCorrupted(e.to_string()))?;
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::StageReflection;

    fn descriptor() -> ProgramDescriptor {
        ProgramDescriptor::new("shaders/mesh.wgsl", ShaderStage::Pixel, ShaderDialect::Glsl)
            .with_backend(RenderBackend::Dummy)
    }

    #[test]
    fn test_key_layout() {
        let desc = descriptor()
            .with_define("SKINNED", "")
            .with_define("LIGHTS", "4")
            .with_flags(ShaderFlags::DEBUG);
        assert_eq!(
            desc.key(),
            "shaders/mesh.wgsl&LIGHTS=4&SKINNED=1&stage=pixel&backend=dummy&target=glsl&flags=1"
        );
    }

    #[test]
    fn test_program_name_ignores_define_order() {
        let a = descriptor().with_define("A", "1").with_define("B", "2");
        let b = descriptor().with_define("B", "2").with_define("A", "");
        assert_eq!(program_name(&a), program_name(&b));

        let name = program_name(&a);
        assert!(name.ends_with(".glsl"));
        assert_eq!(name.len(), 32 + ".glsl".len());
    }

    #[test]
    fn test_program_name_distinguishes_inputs() {
        let base = program_name(&descriptor());
        let vertex = ProgramDescriptor {
            stage: ShaderStage::Vertex,
            ..descriptor()
        };
        let define = descriptor().with_define("A", "2");
        assert_ne!(base, program_name(&vertex));
        assert_ne!(base, program_name(&define));
    }

    #[test]
    fn test_program_name_separates_backends() {
        // Same dialect, but each backend injects its own target define.
        let wgsl = |backend| {
            ProgramDescriptor::new("shaders/mesh.wgsl", ShaderStage::Vertex, ShaderDialect::Wgsl)
                .with_backend(backend)
        };
        let dummy = program_name(&wgsl(RenderBackend::Dummy));
        let wgpu = program_name(&wgsl(RenderBackend::Wgpu));
        assert_ne!(dummy, wgpu);
        assert!(dummy.ends_with(".wgsl") && wgpu.ends_with(".wgsl"));
    }

    #[test]
    fn test_later_define_wins() {
        let desc = descriptor().with_define("A", "1").with_define("A", "2");
        assert!(desc.key().contains("&A=2&"));
        assert!(!desc.key().contains("A=1"));
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProgramCache::new(Some(dir.path().join("programs")));
        let name = program_name(&descriptor());

        assert_eq!(cache.read(&name).unwrap(), None);
        let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        cache.write(&name, &bytes).unwrap();
        assert_eq!(cache.read(&name).unwrap(), Some(bytes));
    }

    #[test]
    fn test_stage_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProgramCache::new(Some(dir.path().to_path_buf()));
        let binary = StageBinary {
            stage: ShaderStage::Vertex,
            entry_point: "main".into(),
            code: b"#version 450\nvoid main() {}".to_vec(),
            reflection: StageReflection::default(),
        };

        cache.store_stage("a.glsl", &binary).unwrap();
        assert_eq!(cache.load_stage("a.glsl"), Some(binary));

        std::fs::write(dir.path().join("b.glsl"), b"not an lz4 frame").unwrap();
        assert!(matches!(
            cache.read("b.glsl"),
            Err(GraphicsError::CacheCorrupted(_))
        ));
        assert_eq!(cache.load_stage("b.glsl"), None);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ProgramCache::disabled();
        cache.write("x", b"data").unwrap();
        assert_eq!(cache.read("x").unwrap(), None);
    }
}
