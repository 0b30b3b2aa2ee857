//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It keeps a table of
//! live objects, stores buffer contents in memory so reads and copies behave,
//! and counts every trait call so tests can assert how often the device
//! reached the backend.

use std::any::Any;
use std::collections::HashMap;

use crate::error::GraphicsError;
use crate::shader::{ShaderDialect, ShaderStage, StageBinary, VertexInput};
use crate::types::{
    BindFlags, BlendDescriptor, BufferDescriptor, Color, DepthStencilDescriptor, IndexFormat,
    InputLayoutDescriptor, PrimitiveTopology, QueryKind, RasterizerDescriptor, SamplerDescriptor,
    ScissorRect, ShaderStages, TextureDescriptor, TextureFormat, Viewport,
};

use super::{DrawCall, GpuBackend, NativeHandle, RenderBackend};

/// One [`GpuBackend`] method, for call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    Resize,
    Present,
    CreateBuffer,
    CreateTexture,
    CreateDepthStencilState,
    CreateRasterizerState,
    CreateBlendState,
    CreateSamplerState,
    CreateInputLayout,
    CompileStage,
    CreateShaderStage,
    CreateQuery,
    Release,
    BindDepthStencilState,
    BindRasterizerState,
    BindBlendState,
    BindInputLayout,
    BindShaderStage,
    BindVertexBuffer,
    BindIndexBuffer,
    BindConstantBuffer,
    BindTexture,
    BindSampler,
    BindUnorderedAccess,
    BindRenderTargets,
    SetViewport,
    SetScissor,
    SetTopology,
    ClearState,
    ClearRenderTarget,
    ClearDepthStencil,
    Draw,
    Dispatch,
    UpdateBuffer,
    ReadBuffer,
    UpdateTexture,
    CopyBuffer,
    CopyTexture,
    GenerateMips,
    BeginQuery,
    EndQuery,
    QueryResult,
}

#[derive(Debug)]
enum Object {
    Buffer(Vec<u8>),
    Texture(TextureDescriptor),
    State,
    InputLayout,
    Shader,
    Query { kind: QueryKind, active: bool },
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    dialect: ShaderDialect,
    next_handle: u64,
    objects: HashMap<NativeHandle, Object>,
    back_buffer: NativeHandle,
    calls: HashMap<BackendCall, u64>,
    vertex_shader: Option<NativeHandle>,
    compute_shader: Option<NativeHandle>,
    last_draw: Option<DrawCall>,
    frame: u64,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a new dummy backend with a 640x480 back buffer.
    pub fn new() -> Self {
        Self::with_size(640, 480)
    }

    /// Create a dummy backend with a back buffer of the given size.
    pub fn with_size(width: u32, height: u32) -> Self {
        let mut backend = Self {
            dialect: ShaderDialect::Wgsl,
            next_handle: 1,
            objects: HashMap::new(),
            back_buffer: NativeHandle(0),
            calls: HashMap::new(),
            vertex_shader: None,
            compute_shader: None,
            last_draw: None,
            frame: 0,
        };
        let back_buffer = TextureDescriptor::new_2d(
            width.max(1),
            height.max(1),
            TextureFormat::Bgra8Unorm,
        )
        .with_label("back buffer")
        .with_bind_flags(BindFlags::RENDER_TARGET);
        backend.back_buffer = backend.insert(Object::Texture(back_buffer));
        backend
    }

    /// Create a dummy backend whose shaders are built for `dialect`.
    ///
    /// Anything but WGSL makes shader creation run the transpiler.
    pub fn with_dialect(dialect: ShaderDialect) -> Self {
        Self {
            dialect,
            ..Self::new()
        }
    }

    /// Number of times `call` reached this backend.
    pub fn call_count(&self, call: BackendCall) -> u64 {
        self.calls.get(&call).copied().unwrap_or(0)
    }

    /// Total number of calls of any kind.
    pub fn total_calls(&self) -> u64 {
        self.calls.values().sum()
    }

    pub fn reset_counts(&mut self) {
        self.calls.clear();
    }

    /// Live native objects, the back buffer included.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Contents of a buffer.
    pub fn buffer_data(&self, handle: NativeHandle) -> Option<&[u8]> {
        match self.objects.get(&handle) {
            Some(Object::Buffer(data)) => Some(data),
            _ => None,
        }
    }

    pub fn last_draw(&self) -> Option<DrawCall> {
        self.last_draw
    }

    /// Presented frame count.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    fn record(&mut self, call: BackendCall) {
        log::trace!("DummyBackend: {call:?}");
        *self.calls.entry(call).or_insert(0) += 1;
    }

    fn insert(&mut self, object: Object) -> NativeHandle {
        let handle = NativeHandle(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn buffer_mut(&mut self, handle: NativeHandle) -> Result<&mut Vec<u8>, GraphicsError> {
        match self.objects.get_mut(&handle) {
            Some(Object::Buffer(data)) => Ok(data),
            _ => Err(GraphicsError::Backend(format!(
                "{} is not a live buffer",
                handle.raw()
            ))),
        }
    }

    fn texture(&self, handle: NativeHandle) -> Result<&TextureDescriptor, GraphicsError> {
        match self.objects.get(&handle) {
            Some(Object::Texture(desc)) => Ok(desc),
            _ => Err(GraphicsError::Backend(format!(
                "{} is not a live texture",
                handle.raw()
            ))),
        }
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn kind(&self) -> RenderBackend {
        RenderBackend::Dummy
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn shader_dialect(&self) -> ShaderDialect {
        self.dialect
    }

    fn back_buffer(&self) -> NativeHandle {
        self.back_buffer
    }

    fn texture_info(&self, texture: NativeHandle) -> Option<TextureDescriptor> {
        self.texture(texture).ok().cloned()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), GraphicsError> {
        self.record(BackendCall::Resize);
        if let Some(Object::Texture(desc)) = self.objects.get_mut(&self.back_buffer) {
            desc.width = width.max(1);
            desc.height = height.max(1);
        }
        Ok(())
    }

    fn present(&mut self, _vsync: bool) -> Result<(), GraphicsError> {
        self.record(BackendCall::Present);
        self.frame += 1;
        Ok(())
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateBuffer);
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let mut contents = vec![0u8; desc.size as usize];
        if let Some(data) = data {
            let len = data.len().min(contents.len());
            contents[..len].copy_from_slice(&data[..len]);
        }
        Ok(self.insert(Object::Buffer(contents)))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        _data: Option<&[u8]>,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateTexture);
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth
        );
        Ok(self.insert(Object::Texture(desc.clone())))
    }

    fn create_depth_stencil_state(
        &mut self,
        _desc: &DepthStencilDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateDepthStencilState);
        Ok(self.insert(Object::State))
    }

    fn create_rasterizer_state(
        &mut self,
        _desc: &RasterizerDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateRasterizerState);
        Ok(self.insert(Object::State))
    }

    fn create_blend_state(
        &mut self,
        _desc: &BlendDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateBlendState);
        Ok(self.insert(Object::State))
    }

    fn create_sampler_state(
        &mut self,
        _desc: &SamplerDescriptor,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateSamplerState);
        Ok(self.insert(Object::State))
    }

    fn create_input_layout(
        &mut self,
        desc: &InputLayoutDescriptor,
        signature: &[VertexInput],
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateInputLayout);
        for input in signature {
            if !desc.elements.iter().any(|e| e.location == input.location) {
                return Err(GraphicsError::creation(format!(
                    "vertex input '{}' at location {} has no layout element",
                    input.name, input.location
                )));
            }
        }
        Ok(self.insert(Object::InputLayout))
    }

    fn compile_stage(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> Result<Vec<u8>, GraphicsError> {
        self.record(BackendCall::CompileStage);
        if !source.contains(entry_point) {
            return Err(GraphicsError::ShaderCompilation {
                stage,
                diagnostic: format!("entry point '{entry_point}' not found"),
            });
        }
        Ok(source.as_bytes().to_vec())
    }

    fn create_shader_stage(
        &mut self,
        _stage: ShaderStage,
        _binary: &StageBinary,
    ) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateShaderStage);
        Ok(self.insert(Object::Shader))
    }

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeHandle, GraphicsError> {
        self.record(BackendCall::CreateQuery);
        Ok(self.insert(Object::Query {
            kind,
            active: false,
        }))
    }

    fn release(&mut self, handle: NativeHandle) {
        self.record(BackendCall::Release);
        if handle == self.back_buffer {
            return;
        }
        self.objects.remove(&handle);
    }

    fn bind_depth_stencil_state(&mut self, _state: Option<NativeHandle>, _stencil_ref: u32) {
        self.record(BackendCall::BindDepthStencilState);
    }

    fn bind_rasterizer_state(&mut self, _state: Option<NativeHandle>) {
        self.record(BackendCall::BindRasterizerState);
    }

    fn bind_blend_state(&mut self, _state: Option<NativeHandle>) {
        self.record(BackendCall::BindBlendState);
    }

    fn bind_input_layout(&mut self, _layout: Option<NativeHandle>) {
        self.record(BackendCall::BindInputLayout);
    }

    fn bind_shader_stage(&mut self, stage: ShaderStage, shader: Option<NativeHandle>) {
        self.record(BackendCall::BindShaderStage);
        match stage {
            ShaderStage::Vertex => self.vertex_shader = shader,
            ShaderStage::Compute => self.compute_shader = shader,
            _ => {}
        }
    }

    fn bind_vertex_buffer(
        &mut self,
        _slot: u32,
        _buffer: Option<NativeHandle>,
        _stride: u32,
        _offset: u64,
    ) {
        self.record(BackendCall::BindVertexBuffer);
    }

    fn bind_index_buffer(
        &mut self,
        _buffer: Option<NativeHandle>,
        _format: IndexFormat,
        _offset: u64,
    ) {
        self.record(BackendCall::BindIndexBuffer);
    }

    fn bind_constant_buffer(
        &mut self,
        _stages: ShaderStages,
        _slot: u32,
        _buffer: Option<NativeHandle>,
    ) {
        self.record(BackendCall::BindConstantBuffer);
    }

    fn bind_texture(&mut self, _stages: ShaderStages, _slot: u32, _texture: Option<NativeHandle>) {
        self.record(BackendCall::BindTexture);
    }

    fn bind_sampler(&mut self, _stages: ShaderStages, _slot: u32, _sampler: Option<NativeHandle>) {
        self.record(BackendCall::BindSampler);
    }

    fn bind_unordered_access(&mut self, _slot: u32, _resource: Option<NativeHandle>) {
        self.record(BackendCall::BindUnorderedAccess);
    }

    fn bind_render_targets(&mut self, _colors: &[NativeHandle], _depth: Option<NativeHandle>) {
        self.record(BackendCall::BindRenderTargets);
    }

    fn set_viewport(&mut self, _viewport: &Viewport) {
        self.record(BackendCall::SetViewport);
    }

    fn set_scissor(&mut self, _rect: &ScissorRect) {
        self.record(BackendCall::SetScissor);
    }

    fn set_topology(&mut self, _topology: PrimitiveTopology) {
        self.record(BackendCall::SetTopology);
    }

    fn clear_state(&mut self) {
        self.record(BackendCall::ClearState);
        self.vertex_shader = None;
        self.compute_shader = None;
    }

    fn clear_render_target(
        &mut self,
        target: NativeHandle,
        _color: Color,
    ) -> Result<(), GraphicsError> {
        self.record(BackendCall::ClearRenderTarget);
        self.texture(target).map(|_| ())
    }

    fn clear_depth_stencil(
        &mut self,
        target: NativeHandle,
        _depth: f32,
        _stencil: u8,
    ) -> Result<(), GraphicsError> {
        self.record(BackendCall::ClearDepthStencil);
        self.texture(target).map(|_| ())
    }

    fn draw(&mut self, call: DrawCall) -> Result<(), GraphicsError> {
        self.record(BackendCall::Draw);
        if self.vertex_shader.is_none() {
            return Err(GraphicsError::Backend("draw without a vertex shader".into()));
        }
        self.last_draw = Some(call);
        Ok(())
    }

    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) -> Result<(), GraphicsError> {
        self.record(BackendCall::Dispatch);
        if self.compute_shader.is_none() {
            return Err(GraphicsError::Backend(
                "dispatch without a compute shader".into(),
            ));
        }
        Ok(())
    }

    fn update_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        self.record(BackendCall::UpdateBuffer);
        let contents = self.buffer_mut(buffer)?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(data.len())?))
            .filter(|range| range.end <= contents.len());
        let Some(range) = range else {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                contents.len()
            )));
        };
        contents[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: NativeHandle) -> Result<Vec<u8>, GraphicsError> {
        self.record(BackendCall::ReadBuffer);
        self.buffer_mut(buffer).map(|data| data.clone())
    }

    fn update_texture(
        &mut self,
        texture: NativeHandle,
        mip_level: u32,
        layer: u32,
        _data: &[u8],
    ) -> Result<(), GraphicsError> {
        self.record(BackendCall::UpdateTexture);
        let desc = self.texture(texture)?;
        if mip_level >= desc.mip_levels.max(1) || layer >= desc.layers() {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip {mip_level} layer {layer} out of range"
            )));
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        dst: NativeHandle,
        src: NativeHandle,
        size: u64,
    ) -> Result<(), GraphicsError> {
        self.record(BackendCall::CopyBuffer);
        let source = self.buffer_mut(src)?.clone();
        let target = self.buffer_mut(dst)?;
        let len = (size as usize).min(source.len()).min(target.len());
        target[..len].copy_from_slice(&source[..len]);
        Ok(())
    }

    fn copy_texture(&mut self, dst: NativeHandle, src: NativeHandle) -> Result<(), GraphicsError> {
        self.record(BackendCall::CopyTexture);
        let (src_desc, dst_desc) = (self.texture(src)?, self.texture(dst)?);
        if src_desc.width != dst_desc.width
            || src_desc.height != dst_desc.height
            || src_desc.format != dst_desc.format
        {
            return Err(GraphicsError::InvalidParameter(
                "copy_texture requires matching size and format".into(),
            ));
        }
        Ok(())
    }

    fn generate_mips(&mut self, texture: NativeHandle) -> Result<(), GraphicsError> {
        self.record(BackendCall::GenerateMips);
        self.texture(texture).map(|_| ())
    }

    fn begin_query(&mut self, query: NativeHandle) {
        self.record(BackendCall::BeginQuery);
        if let Some(Object::Query { active, .. }) = self.objects.get_mut(&query) {
            *active = true;
        }
    }

    fn end_query(&mut self, query: NativeHandle) {
        self.record(BackendCall::EndQuery);
        if let Some(Object::Query { active, .. }) = self.objects.get_mut(&query) {
            *active = false;
        }
    }

    fn query_result(&mut self, query: NativeHandle) -> Result<Option<u64>, GraphicsError> {
        self.record(BackendCall::QueryResult);
        match self.objects.get(&query) {
            Some(Object::Query { active: true, .. }) => Ok(None),
            Some(Object::Query {
                kind: QueryKind::Occlusion,
                ..
            }) => Ok(Some(0)),
            Some(Object::Query {
                kind: QueryKind::Timestamp,
                ..
            }) => Ok(Some(self.frame)),
            _ => Err(GraphicsError::Backend(format!(
                "{} is not a live query",
                query.raw()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferKind;

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy Backend");
        assert_eq!(backend.kind(), RenderBackend::Dummy);
        assert_eq!(backend.shader_dialect(), ShaderDialect::Wgsl);
    }

    #[test]
    fn test_handles_are_unique() {
        let mut backend = DummyBackend::new();
        let a = backend.create_query(QueryKind::Occlusion).unwrap();
        let b = backend
            .create_blend_state(&BlendDescriptor::default())
            .unwrap();
        backend.release(a);
        let c = backend.create_query(QueryKind::Occlusion).unwrap();
        assert!(a != b && b != c && a != c);
        assert!(!backend.is_live(a));
        assert_eq!(backend.live_objects(), 3);
    }

    #[test]
    fn test_buffer_contents() {
        let mut backend = DummyBackend::new();
        let desc = BufferDescriptor::new(BufferKind::Constant, 8);
        let src = backend.create_buffer(&desc, Some(&[1, 2, 3, 4])).unwrap();
        let dst = backend.create_buffer(&desc, None).unwrap();

        backend.update_buffer(src, 4, &[5, 6, 7, 8]).unwrap();
        backend.copy_buffer(dst, src, 8).unwrap();
        assert_eq!(backend.read_buffer(dst).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(backend.update_buffer(src, 6, &[0; 4]).is_err());
        assert!(matches!(
            backend.update_buffer(src, u64::MAX, &[0; 2]),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_call_counting() {
        let mut backend = DummyBackend::new();
        backend.bind_blend_state(None);
        backend.bind_blend_state(None);
        backend.set_topology(PrimitiveTopology::LineList);
        assert_eq!(backend.call_count(BackendCall::BindBlendState), 2);
        assert_eq!(backend.total_calls(), 3);
        backend.reset_counts();
        assert_eq!(backend.total_calls(), 0);
    }

    #[test]
    fn test_draw_requires_vertex_shader() {
        let mut backend = DummyBackend::new();
        let call = DrawCall::Vertices {
            vertex_count: 3,
            first_vertex: 0,
            instance_count: 1,
            first_instance: 0,
        };
        assert!(backend.draw(call).is_err());

        let binary = StageBinary {
            stage: ShaderStage::Vertex,
            entry_point: "vs_main".into(),
            code: Vec::new(),
            reflection: Default::default(),
        };
        let vs = backend
            .create_shader_stage(ShaderStage::Vertex, &binary)
            .unwrap();
        backend.bind_shader_stage(ShaderStage::Vertex, Some(vs));
        backend.draw(call).unwrap();
        assert_eq!(backend.last_draw(), Some(call));
    }

    #[test]
    fn test_resize_back_buffer() {
        let mut backend = DummyBackend::with_size(64, 32);
        let back = backend.back_buffer();
        assert_eq!(backend.texture_info(back).unwrap().width, 64);
        backend.resize(128, 96).unwrap();
        let info = backend.texture_info(back).unwrap();
        assert_eq!((info.width, info.height), (128, 96));
        backend.release(back);
        assert!(backend.is_live(back));
    }

    #[test]
    fn test_query_lifecycle() {
        let mut backend = DummyBackend::new();
        let query = backend.create_query(QueryKind::Timestamp).unwrap();
        backend.begin_query(query);
        assert_eq!(backend.query_result(query).unwrap(), None);
        backend.end_query(query);
        backend.present(true).unwrap();
        assert_eq!(backend.query_result(query).unwrap(), Some(1));
    }
}
