//! Named shader sources available to `#include`.
//!
//! The registry starts with the sources bundled in `graphics/shaders/`:
//!
//! | Section | Description |
//! |---------|-------------|
//! | `common.wgsl` | Constants and color helpers |
//! | `immediate.wgsl` | Shader behind the `im_*` debug drawing API |
//! | `blit.wgsl` | Fullscreen copy used for mip generation |
//!
//! Lookups try the exact name, then the name with each of
//! [`SECTION_SUFFIXES`] appended, so `#include "common"` finds `common.wgsl`.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::GraphicsError;

/// Suffixes tried, in order, when a section or include name has no exact match.
pub const SECTION_SUFFIXES: [&str; 5] = [".hlsl", ".glsl", ".msl", ".spv", ".wgsl"];

/// Constants and color helpers.
const COMMON_SECTION: &str = include_str!("../../shaders/common.wgsl");

/// Immediate-mode debug drawing shader.
pub(crate) const IMMEDIATE_SECTION: &str = include_str!("../../shaders/immediate.wgsl");

/// Fullscreen blit shader.
pub(crate) const BLIT_SECTION: &str = include_str!("../../shaders/blit.wgsl");

const BUILTIN_SECTIONS: [(&str, &str); 3] = [
    ("common.wgsl", COMMON_SECTION),
    ("immediate.wgsl", IMMEDIATE_SECTION),
    ("blit.wgsl", BLIT_SECTION),
];

/// Metadata about a registered section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Registered name the lookup resolved to.
    pub name: String,
    /// Source length in bytes.
    pub size: usize,
    /// Bundled with the crate rather than added at runtime.
    pub builtin: bool,
}

#[derive(Debug, Clone)]
struct Section {
    source: Cow<'static, str>,
    builtin: bool,
}

/// Name to source map consulted by the preprocessor.
#[derive(Debug, Clone, Default)]
pub struct SectionRegistry {
    sections: HashMap<String, Section>,
}

impl SectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the bundled sections.
    pub fn builtin() -> Self {
        let sections = BUILTIN_SECTIONS
            .iter()
            .map(|(name, source)| {
                (
                    name.to_string(),
                    Section {
                        source: Cow::Borrowed(*source),
                        builtin: true,
                    },
                )
            })
            .collect();
        Self { sections }
    }

    /// Register or replace a section. Returns `true` if it replaced one.
    pub fn add(&mut self, name: impl Into<String>, source: impl Into<String>) -> bool {
        self.sections
            .insert(
                name.into(),
                Section {
                    source: Cow::Owned(source.into()),
                    builtin: false,
                },
            )
            .is_some()
    }

    /// Remove the section `name` resolves to. Returns `true` if one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(key) = self.resolve_key(name).map(str::to_string) else {
            return false;
        };
        self.sections.remove(&key).is_some()
    }

    /// Find a section, returning its registered name and source.
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        let key = self.resolve_key(name)?;
        self.sections
            .get_key_value(key)
            .map(|(key, section)| (key.as_str(), section.source.as_ref()))
    }

    fn resolve_key(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.sections.get_key_value(name) {
            return Some(key);
        }
        SECTION_SUFFIXES.iter().find_map(|suffix| {
            self.sections
                .get_key_value(format!("{name}{suffix}").as_str())
                .map(|(key, _)| key.as_str())
        })
    }

    /// Metadata of the section `name` resolves to.
    pub fn info(&self, name: &str) -> Result<SectionInfo, GraphicsError> {
        let key = self
            .resolve_key(name)
            .ok_or_else(|| GraphicsError::SectionNotFound(name.to_string()))?;
        let section = &self.sections[key];
        Ok(SectionInfo {
            name: key.to_string(),
            size: section.source.len(),
            builtin: section.builtin,
        })
    }

    /// Source of the section `name` resolves to.
    pub fn data(&self, name: &str) -> Result<&str, GraphicsError> {
        self.resolve(name)
            .map(|(_, source)| source)
            .ok_or_else(|| GraphicsError::SectionNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve_key(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
