//! Graphics error types.

use thiserror::Error;

use crate::shader::ShaderStage;

/// Errors that can occur in the graphics system.
#[derive(Error, Debug)]
pub enum GraphicsError {
    /// The backend refused to create a resource.
    #[error("creation failed ({code:#x}): {message}")]
    CreationFailed {
        /// Backend-native error code, `0` when the backend has none.
        code: u32,
        /// Human-readable message built from the backend's own description.
        message: String,
    },
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A shader stage failed to parse, validate or compile.
    ///
    /// The diagnostic is the compiler's text, unmodified.
    #[error("{stage} shader compilation failed:\n{diagnostic}")]
    ShaderCompilation {
        stage: ShaderStage,
        diagnostic: String,
    },
    /// A preprocessor directive could not be evaluated.
    #[error("{file}:{line}: {message}")]
    Preprocess {
        file: String,
        line: usize,
        message: String,
    },
    /// An `#include` target was found neither by the callback, the sections nor the filesystem.
    #[error("include not found: \"{name}\" (from {from})")]
    IncludeNotFound { name: String, from: String },
    /// A named shader section does not exist.
    #[error("section not found: {0}")]
    SectionNotFound(String),
    /// The requested shader dialect has no writer compiled in.
    #[error("unsupported shader target: {0}")]
    UnsupportedTarget(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// No render backend is available.
    #[error("no render backend available")]
    NoBackend,
    /// A backend call failed outside of resource creation.
    #[error("backend error: {0}")]
    Backend(String),
    /// A program cache file could not be decoded.
    #[error("program cache corrupted: {0}")]
    CacheCorrupted(String),
    /// The work queue was closed because its device was dropped.
    #[error("work queue closed")]
    QueueClosed,
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GraphicsError {
    /// Shorthand for a creation failure without a native code.
    pub fn creation(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            code: 0,
            message: message.into(),
        }
    }
}
