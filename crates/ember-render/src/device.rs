// SPDX-License-Identifier: CEPL-1.0
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::Result;
use crate::ids::*;
use crate::types::*;

/// The contract the engine layer renders through.
///
/// Every `create_*` hands back a generational handle; the matching
/// `destroy_*` must be called exactly once. Nothing is reference counted:
/// a second destroy fails with `InvalidHandle`, and destroying something
/// another live object still depends on is a `ContractViolation`.
pub trait RenderDevice {
    fn device_name(&self) -> &str;
    fn vendor_name(&self) -> &str;

    // Buffers
    fn create_vertex_buffer(&mut self, data: &[u8]) -> Result<VertexBufferId>;
    fn destroy_vertex_buffer(&mut self, id: VertexBufferId) -> Result<()>;

    fn create_index_buffer(&mut self, data: &[u8], index_type: IndexType) -> Result<IndexBufferId>;
    fn destroy_index_buffer(&mut self, id: IndexBufferId) -> Result<()>;

    fn create_uniform_buffer(&mut self, size: usize, data: Option<&[u8]>)
        -> Result<UniformBufferId>;
    fn update_uniform_buffer(&mut self, id: UniformBufferId, offset: usize, data: &[u8])
        -> Result<()>;
    fn destroy_uniform_buffer(&mut self, id: UniformBufferId) -> Result<()>;

    // Images
    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> Result<TextureId>;
    fn destroy_texture(&mut self, id: TextureId) -> Result<()>;

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&mut self, id: SamplerId) -> Result<()>;

    // Programs
    fn create_shader(&mut self, stages: &[ShaderModuleDesc<'_>]) -> Result<ShaderId>;
    fn destroy_shader(&mut self, id: ShaderId) -> Result<()>;

    // Render targets
    fn create_framebuffer_format(
        &mut self,
        attachments: &[AttachmentDesc],
    ) -> Result<FramebufferFormatId>;
    fn destroy_framebuffer_format(&mut self, id: FramebufferFormatId) -> Result<()>;

    fn create_framebuffer(
        &mut self,
        format: FramebufferFormatId,
        attachments: &[TextureId],
    ) -> Result<FramebufferId>;
    fn destroy_framebuffer(&mut self, id: FramebufferId) -> Result<()>;

    // Uniforms
    fn create_uniform_layout(&mut self, desc: &UniformLayoutDesc) -> Result<UniformLayoutId>;
    fn destroy_uniform_layout(&mut self, id: UniformLayoutId) -> Result<()>;

    fn create_uniform_set(
        &mut self,
        layout: UniformLayoutId,
        bindings: &[UniformBinding],
    ) -> Result<UniformSetId>;
    fn destroy_uniform_set(&mut self, id: UniformSetId) -> Result<()>;

    // Pipelines
    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc) -> Result<GraphicsPipelineId>;
    fn destroy_graphics_pipeline(&mut self, id: GraphicsPipelineId) -> Result<()>;

    // Surfaces
    fn create_surface(
        &mut self,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        prefs: &SurfacePreferences,
    ) -> Result<SurfaceId>;
    fn resize_surface(&mut self, id: SurfaceId, size: RenderSize) -> Result<()>;
    fn surface_size(&self, id: SurfaceId) -> Result<RenderSize>;
    fn destroy_surface(&mut self, id: SurfaceId) -> Result<()>;

    // Draw list
    fn begin_draw_list(&mut self, target: DrawTarget, clear: &ClearValues) -> Result<()>;
    fn bind_pipeline(&mut self, pipeline: GraphicsPipelineId) -> Result<()>;
    fn bind_uniform_set(&mut self, set: UniformSetId, slot: u32) -> Result<()>;
    fn bind_vertex_buffer(&mut self, buffer: VertexBufferId, binding: u32) -> Result<()>;
    fn bind_index_buffer(&mut self, buffer: IndexBufferId) -> Result<()>;
    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()>;
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> Result<()>;
    /// Submits the list. For surfaces this also presents, and may report
    /// `SwapchainOutOfDate`, after which the caller resizes and tries again.
    fn end_draw_list(&mut self) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;
}
