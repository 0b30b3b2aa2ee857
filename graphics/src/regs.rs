//! Register cache.
//!
//! Mirrors the last value handed to the backend for every binding point so
//! that cached setters can skip redundant calls. The cache never decides what
//! is bound; on any doubt it is cleared with [`RegisterCache::clear`] and the
//! next setter goes through again.

use std::collections::HashMap;

use crate::backend::NativeHandle;
use crate::shader::ShaderStage;
use crate::types::{IndexFormat, PrimitiveTopology, ScissorRect, ShaderStages, Viewport};

/// Number of slots per slotted binding kind.
pub const MAX_SLOTS: u32 = 16;

/// Binding point category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    DepthStencilState,
    RasterizerState,
    BlendState,
    InputLayout,
    Shader(ShaderStage),
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    Texture,
    Sampler,
    UnorderedAccess,
    RenderTargets,
    Viewport,
    Scissor,
    Topology,
}

/// A single binding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterKey {
    pub kind: RegisterKind,
    pub stages: ShaderStages,
    pub slot: u32,
}

impl RegisterKey {
    /// Unslotted binding point.
    pub fn global(kind: RegisterKind) -> Self {
        Self {
            kind,
            stages: ShaderStages::empty(),
            slot: 0,
        }
    }

    /// Slotted binding point visible to `stages`.
    pub fn slot(kind: RegisterKind, stages: ShaderStages, slot: u32) -> Self {
        Self { kind, stages, slot }
    }
}

/// Last value bound to a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    Handle(Option<NativeHandle>),
    DepthStencil {
        state: Option<NativeHandle>,
        stencil_ref: u32,
    },
    VertexBuffer {
        buffer: Option<NativeHandle>,
        stride: u32,
        offset: u64,
    },
    IndexBuffer {
        buffer: Option<NativeHandle>,
        format: IndexFormat,
        offset: u64,
    },
    Targets {
        colors: Vec<NativeHandle>,
        depth: Option<NativeHandle>,
    },
    Viewport([u32; 6]),
    Scissor(ScissorRect),
    Topology(PrimitiveTopology),
}

impl RegisterValue {
    /// Whether this value keeps `handle` bound.
    pub fn references(&self, handle: NativeHandle) -> bool {
        let target = Some(handle);
        match self {
            Self::Handle(h) => *h == target,
            Self::DepthStencil { state, .. } => *state == target,
            Self::VertexBuffer { buffer, .. } | Self::IndexBuffer { buffer, .. } => {
                *buffer == target
            }
            Self::Targets { colors, depth } => colors.contains(&handle) || *depth == target,
            Self::Viewport(_) | Self::Scissor(_) | Self::Topology(_) => false,
        }
    }
}

impl From<&Viewport> for RegisterValue {
    fn from(viewport: &Viewport) -> Self {
        Self::Viewport(viewport.bits())
    }
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterStats {
    pub hits: u64,
    pub misses: u64,
}

/// Map from binding point to the last bound value.
#[derive(Debug, Default)]
pub struct RegisterCache {
    registers: HashMap<RegisterKey, RegisterValue>,
    stats: RegisterStats,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`. Returns `true` if it differs from the
    /// cached value, meaning the caller must forward it to the backend.
    pub fn exchange(&mut self, key: RegisterKey, value: RegisterValue) -> bool {
        match self.registers.get(&key) {
            Some(current) if *current == value => {
                self.stats.hits += 1;
                false
            }
            _ => {
                self.stats.misses += 1;
                self.registers.insert(key, value);
                true
            }
        }
    }

    pub fn get(&self, key: &RegisterKey) -> Option<&RegisterValue> {
        self.registers.get(key)
    }

    /// Forget one binding point.
    pub fn invalidate(&mut self, key: &RegisterKey) {
        self.registers.remove(key);
    }

    /// Forget every binding point of `kind`.
    pub fn invalidate_kind(&mut self, kind: RegisterKind) {
        self.registers.retain(|key, _| key.kind != kind);
    }

    /// Forget every binding point that references `handle`.
    pub fn invalidate_handle(&mut self, handle: NativeHandle) {
        self.registers.retain(|_, value| !value.references(handle));
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.registers.clear();
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn stats(&self) -> RegisterStats {
        self.stats
    }
}

/// Check a slotted binding point. Panics in debug builds, logs in release.
pub(crate) fn check_slot(what: &str, stages: ShaderStages, slot: u32) -> bool {
    debug_assert!(slot < MAX_SLOTS, "{what}: slot {slot} out of range");
    debug_assert!(!stages.is_empty(), "{what}: empty stage mask");
    if slot >= MAX_SLOTS || stages.is_empty() {
        log::warn!("{what}: ignoring bind to slot {slot} with stages {stages:?}");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tex(slot: u32) -> RegisterKey {
        RegisterKey::slot(RegisterKind::Texture, ShaderStages::PIXEL, slot)
    }

    #[test]
    fn test_exchange_elides_repeat() {
        let mut cache = RegisterCache::new();
        let value = RegisterValue::Handle(Some(NativeHandle(1)));

        assert!(cache.exchange(tex(0), value.clone()));
        assert!(!cache.exchange(tex(0), value.clone()));
        assert!(cache.exchange(tex(1), value));
        assert_eq!(cache.stats(), RegisterStats { hits: 1, misses: 2 });
    }

    #[test]
    fn test_unbind_is_a_change() {
        let mut cache = RegisterCache::new();
        assert!(cache.exchange(tex(0), RegisterValue::Handle(Some(NativeHandle(1)))));
        assert!(cache.exchange(tex(0), RegisterValue::Handle(None)));
        assert!(!cache.exchange(tex(0), RegisterValue::Handle(None)));
    }

    #[test]
    fn test_stage_mask_is_part_of_key() {
        let mut cache = RegisterCache::new();
        let value = RegisterValue::Handle(Some(NativeHandle(1)));
        let vs = RegisterKey::slot(RegisterKind::ConstantBuffer, ShaderStages::VERTEX, 0);
        let ps = RegisterKey::slot(RegisterKind::ConstantBuffer, ShaderStages::PIXEL, 0);
        assert!(cache.exchange(vs, value.clone()));
        assert!(cache.exchange(ps, value));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = RegisterCache::new();
        let value = RegisterValue::Handle(Some(NativeHandle(1)));
        cache.exchange(tex(0), value.clone());
        cache.exchange(tex(1), value.clone());
        cache.exchange(
            RegisterKey::global(RegisterKind::Topology),
            RegisterValue::Topology(PrimitiveTopology::LineList),
        );

        cache.invalidate(&tex(0));
        assert!(cache.exchange(tex(0), value.clone()));

        cache.invalidate_kind(RegisterKind::Texture);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_handle() {
        let mut cache = RegisterCache::new();
        let vb = RegisterKey::slot(RegisterKind::VertexBuffer, ShaderStages::VERTEX, 0);
        let buffer = RegisterValue::VertexBuffer {
            buffer: Some(NativeHandle(7)),
            stride: 12,
            offset: 0,
        };
        cache.exchange(vb, buffer.clone());
        cache.exchange(tex(0), RegisterValue::Handle(Some(NativeHandle(8))));

        cache.invalidate_handle(NativeHandle(7));
        assert!(cache.get(&vb).is_none());
        assert!(cache.get(&tex(0)).is_some());
        assert!(cache.exchange(vb, buffer));
    }

    #[test]
    fn test_viewport_value() {
        let mut cache = RegisterCache::new();
        let key = RegisterKey::global(RegisterKind::Viewport);
        let vp = Viewport::from_dimensions(64, 64);
        assert!(cache.exchange(key, (&vp).into()));
        assert!(!cache.exchange(key, (&vp).into()));
        assert!(cache.exchange(key, (&vp.with_depth_range(0.0, 0.5)).into()));
    }

    #[test]
    fn test_check_slot_accepts_valid() {
        assert!(check_slot("set_texture", ShaderStages::PIXEL, MAX_SLOTS - 1));
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_check_slot_rejects_in_release() {
        assert!(!check_slot("set_texture", ShaderStages::PIXEL, MAX_SLOTS));
        assert!(!check_slot("set_texture", ShaderStages::empty(), 0));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "out of range")]
    fn test_check_slot_asserts_in_debug() {
        check_slot("set_texture", ShaderStages::PIXEL, MAX_SLOTS);
    }
}
