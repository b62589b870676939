use ash::vk;
use ember_render::{
    AttachmentDesc, ClearValues, DrawTarget, FramebufferFormatId, FramebufferId,
    GraphicsPipelineId, HandleTable, IndexBufferId, IndexType, PipelineDesc, PipelineTarget,
    RenderDevice, RenderError, RenderSize, Result, SamplerDesc, SamplerId, ShaderId,
    ShaderModuleDesc, SurfaceId, SurfacePreferences, TextureDesc, TextureFormat, TextureId,
    TextureUsage, TypedId, UniformBinding, UniformBufferId, UniformKind, UniformLayoutDesc,
    UniformLayoutId, UniformResource, UniformSetId, VertexBufferId,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::context::VkContext;
use crate::convert;
use crate::descriptor::{DescriptorAllocator, PoolGrowth, Properties};
use crate::draw::{self, DrawState, MAX_BOUND_SETS};
use crate::error::VkResultExt;
use crate::memory::{self, GpuBuffer, GpuImage, ImageRequest};
use crate::pipeline::{self, GraphicsPipeline, PipelineTargetInfo, Shader};
use crate::renderpass;
use crate::surface::{SurfaceSettings, VkSurface};

struct IndexBuffer {
    buffer: GpuBuffer,
    index_type: vk::IndexType,
}

struct Texture {
    image: GpuImage,
    view: vk::ImageView,
    format: TextureFormat,
    /// Layout the image is left in between uses.
    layout: vk::ImageLayout,
}

struct FramebufferFormat {
    render_pass: vk::RenderPass,
    attachments: Vec<AttachmentDesc>,
    /// Indices into `attachments` in render-pass order: colours, then depth.
    order: Vec<usize>,
    color_count: u32,
    has_depth: bool,
    framebuffers: u32,
}

struct Framebuffer {
    framebuffer: vk::Framebuffer,
    format: FramebufferFormatId,
    extent: vk::Extent2D,
}

struct UniformLayout {
    allocator: DescriptorAllocator<ash::Device>,
    desc: UniformLayoutDesc,
}

struct UniformSet {
    set: vk::DescriptorSet,
    layout: UniformLayoutId,
}

struct Pipeline {
    inner: GraphicsPipeline,
    target: PipelineTarget,
    set_count: u32,
}

struct OpenList {
    target: DrawTarget,
    cmd: vk::CommandBuffer,
    state: DrawState,
    layout: Option<vk::PipelineLayout>,
    set_count: u32,
}

/// Command buffer and fence for draw lists aimed at offscreen framebuffers.
struct Offscreen {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Vulkan implementation of [`RenderDevice`].
///
/// Owns the [`VkContext`] and one handle table per resource kind. Field order
/// matters: the context is dropped last, after `Drop` has emptied every table.
pub struct VkRenderDevice {
    cfg: DeviceConfig,

    vertex_buffers: HandleTable<VertexBufferId, GpuBuffer>,
    index_buffers: HandleTable<IndexBufferId, IndexBuffer>,
    uniform_buffers: HandleTable<UniformBufferId, GpuBuffer>,
    textures: HandleTable<TextureId, Texture>,
    samplers: HandleTable<SamplerId, vk::Sampler>,
    shaders: HandleTable<ShaderId, Shader>,
    framebuffer_formats: HandleTable<FramebufferFormatId, FramebufferFormat>,
    framebuffers: HandleTable<FramebufferId, Framebuffer>,
    uniform_layouts: HandleTable<UniformLayoutId, UniformLayout>,
    uniform_sets: HandleTable<UniformSetId, UniformSet>,
    pipelines: HandleTable<GraphicsPipelineId, Pipeline>,
    surfaces: HandleTable<SurfaceId, VkSurface<VkContext>>,

    list: Option<OpenList>,
    offscreen: Offscreen,
    ctx: VkContext,
}

impl VkRenderDevice {
    /// `display` must be provided if surfaces will be created.
    pub fn new(display: Option<RawDisplayHandle>, cfg: DeviceConfig) -> Result<Self> {
        let cfg = cfg.validated();
        unsafe {
            let ctx = VkContext::new(display, &cfg)?;
            let cmd = ctx.allocate_graphics_command_buffer()?;
            let fence = ctx.create_fence_raw(false)?;
            Ok(Self {
                cfg,
                vertex_buffers: HandleTable::new(),
                index_buffers: HandleTable::new(),
                uniform_buffers: HandleTable::new(),
                textures: HandleTable::new(),
                samplers: HandleTable::new(),
                shaders: HandleTable::new(),
                framebuffer_formats: HandleTable::new(),
                framebuffers: HandleTable::new(),
                uniform_layouts: HandleTable::new(),
                uniform_sets: HandleTable::new(),
                pipelines: HandleTable::new(),
                surfaces: HandleTable::new(),
                list: None,
                offscreen: Offscreen { cmd, fence },
                ctx,
            })
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    fn ensure_not_target(&self, target: DrawTarget) -> Result<()> {
        if self.list.as_ref().is_some_and(|l| l.target == target) {
            return Err(RenderError::contract(
                "cannot destroy the target of the open draw list",
            ));
        }
        Ok(())
    }

    unsafe fn create_texture_inner(
        &self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> Result<Texture> {
        validate_texture(desc, data)?;
        let depth = desc.format.is_depth();
        let sampled = desc.usage.contains(TextureUsage::SAMPLED);

        let format = convert::texture_format(desc.format);
        let mip_levels = if desc.mipmaps {
            memory::mip_level_count(desc.width, desc.height)
        } else {
            1
        };
        let mut usage = convert::texture_usage(desc.usage);
        if data.is_some() {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
            if mip_levels > 1 {
                usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
        }
        let aspect = if depth {
            memory::depth_aspect(format)
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let layout = renderpass::resting_layout(depth, sampled);

        let image = GpuImage::new(
            &self.ctx,
            ImageRequest {
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                format,
                mip_levels,
                usage,
                aspect,
            },
        )?;

        let ready = match data {
            Some(bytes) => image.upload(&self.ctx, bytes).and_then(|_| {
                if layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                    Ok(())
                } else {
                    memory::transition_image_layout(
                        &self.ctx,
                        &image,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        layout,
                    )
                }
            }),
            None => memory::transition_image_layout(
                &self.ctx,
                &image,
                vk::ImageLayout::UNDEFINED,
                layout,
            ),
        }
        .and_then(|_| image.create_view(&self.ctx));

        match ready {
            Ok(view) => Ok(Texture {
                image,
                view,
                format: desc.format,
                layout,
            }),
            Err(e) => {
                image.destroy(&self.ctx);
                Err(e)
            }
        }
    }

    /// Resolves every binding of `desc` against `bindings` before anything
    /// is allocated, so a bad request leaks nothing.
    fn resolve_bindings(
        &self,
        desc: &UniformLayoutDesc,
        bindings: &[UniformBinding],
    ) -> Result<Vec<(u32, ResolvedResource)>> {
        if bindings.len() != desc.entries.len() {
            return Err(RenderError::contract(format!(
                "layout has {} bindings, {} supplied",
                desc.entries.len(),
                bindings.len()
            )));
        }
        desc.entries
            .iter()
            .map(|entry| {
                let b = bindings
                    .iter()
                    .find(|b| b.binding == entry.binding)
                    .ok_or_else(|| {
                        RenderError::contract(format!("binding {} not supplied", entry.binding))
                    })?;
                let resolved = match (entry.kind, b.resource) {
                    (UniformKind::UniformBuffer, UniformResource::Buffer(id)) => {
                        let buf = self.uniform_buffers.get(id)?;
                        ResolvedResource::Buffer(buf.buffer, buf.size)
                    }
                    (UniformKind::CombinedImageSampler, UniformResource::Texture { texture, sampler }) => {
                        let tex = self.textures.get(texture)?;
                        if tex.layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                            return Err(RenderError::contract(format!(
                                "texture {texture:?} is not sampled"
                            )));
                        }
                        ResolvedResource::Image(tex.view, *self.samplers.get(sampler)?)
                    }
                    (kind, _) => {
                        return Err(RenderError::contract(format!(
                            "binding {} expects {kind:?}",
                            entry.binding
                        )))
                    }
                };
                Ok((entry.binding, resolved))
            })
            .collect()
    }

    unsafe fn submit_offscreen(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        let device = &self.ctx.device;
        device
            .queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&si),
                self.offscreen.fence,
            )
            .op("vkQueueSubmit(offscreen)")?;
        device
            .wait_for_fences(std::slice::from_ref(&self.offscreen.fence), true, u64::MAX)
            .op("vkWaitForFences(offscreen)")?;
        device
            .reset_fences(std::slice::from_ref(&self.offscreen.fence))
            .op("vkResetFences(offscreen)")
    }
}

#[derive(Clone, Copy)]
enum ResolvedResource {
    Buffer(vk::Buffer, vk::DeviceSize),
    Image(vk::ImageView, vk::Sampler),
}

/// Usage and payload checks shared by every texture, before any allocation.
fn validate_texture(desc: &TextureDesc, data: Option<&[u8]>) -> Result<()> {
    if desc.width == 0 || desc.height == 0 {
        return Err(RenderError::contract("zero-sized texture"));
    }
    let depth = desc.format.is_depth();
    let sampled = desc.usage.contains(TextureUsage::SAMPLED);
    let attachment = desc
        .usage
        .intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_ATTACHMENT);
    if !sampled && !attachment {
        return Err(RenderError::contract(
            "texture usage needs SAMPLED or an attachment bit",
        ));
    }
    if depth && desc.usage.contains(TextureUsage::COLOR_ATTACHMENT)
        || !depth && desc.usage.contains(TextureUsage::DEPTH_ATTACHMENT)
    {
        return Err(RenderError::contract(format!(
            "{:?} cannot be used as that kind of attachment",
            desc.format
        )));
    }
    if sampled && desc.format == TextureFormat::Depth24Stencil8 {
        return Err(RenderError::contract(
            "sampling depth-stencil textures is not supported",
        ));
    }
    if desc.mipmaps && attachment {
        return Err(RenderError::contract("attachment textures cannot have mipmaps"));
    }
    if let Some(bytes) = data {
        if depth {
            return Err(RenderError::contract("depth textures cannot take initial data"));
        }
        let expected = desc.width as usize
            * desc.height as usize
            * desc.format.bytes_per_pixel() as usize;
        if bytes.len() != expected {
            return Err(RenderError::contract(format!(
                "texture data is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
    }
    Ok(())
}

/// Render-pass order for a framebuffer format: colour attachments in the
/// caller's order, then the single depth attachment. Returns the order and
/// the colour count.
fn attachment_order(attachments: &[AttachmentDesc]) -> Result<(Vec<usize>, u32)> {
    if attachments.is_empty() {
        return Err(RenderError::contract("framebuffer format with no attachments"));
    }
    let mut order: Vec<usize> = (0..attachments.len())
        .filter(|&i| !attachments[i].format.is_depth())
        .collect();
    let color_count = order.len() as u32;
    let depth: Vec<usize> = (0..attachments.len())
        .filter(|&i| attachments[i].format.is_depth())
        .collect();
    if depth.len() > 1 {
        return Err(RenderError::contract("more than one depth attachment"));
    }
    order.extend(&depth);
    Ok((order, color_count))
}

fn validate_uniform_layout(desc: &UniformLayoutDesc) -> Result<()> {
    if desc.entries.is_empty() {
        return Err(RenderError::contract("uniform layout with no bindings"));
    }
    for (i, e) in desc.entries.iter().enumerate() {
        if desc.entries[..i].iter().any(|o| o.binding == e.binding) {
            return Err(RenderError::contract(format!(
                "binding {} declared twice",
                e.binding
            )));
        }
    }
    Ok(())
}

fn open(list: &mut Option<OpenList>) -> Result<&mut OpenList> {
    list.as_mut()
        .ok_or_else(|| RenderError::contract("no draw list is open"))
}

fn leaked<K: TypedId>(id: K) {
    error!("{} {:?} still alive at device teardown", K::KIND, id.raw());
}

impl RenderDevice for VkRenderDevice {
    fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    fn vendor_name(&self) -> &str {
        self.ctx.vendor_name()
    }

    fn create_vertex_buffer(&mut self, data: &[u8]) -> Result<VertexBufferId> {
        let buffer = unsafe {
            GpuBuffer::device_local_with_data(&self.ctx, vk::BufferUsageFlags::VERTEX_BUFFER, data)?
        };
        Ok(self.vertex_buffers.add(buffer))
    }

    fn destroy_vertex_buffer(&mut self, id: VertexBufferId) -> Result<()> {
        let buffer = self.vertex_buffers.remove(id)?;
        unsafe { buffer.destroy(&self.ctx) };
        Ok(())
    }

    fn create_index_buffer(&mut self, data: &[u8], index_type: IndexType) -> Result<IndexBufferId> {
        if data.len() % index_type.size() != 0 {
            return Err(RenderError::contract(format!(
                "{} bytes is not a whole number of {index_type:?} indices",
                data.len()
            )));
        }
        let buffer = unsafe {
            GpuBuffer::device_local_with_data(&self.ctx, vk::BufferUsageFlags::INDEX_BUFFER, data)?
        };
        Ok(self.index_buffers.add(IndexBuffer {
            buffer,
            index_type: convert::index_type(index_type),
        }))
    }

    fn destroy_index_buffer(&mut self, id: IndexBufferId) -> Result<()> {
        let ib = self.index_buffers.remove(id)?;
        unsafe { ib.buffer.destroy(&self.ctx) };
        Ok(())
    }

    fn create_uniform_buffer(
        &mut self,
        size: usize,
        data: Option<&[u8]>,
    ) -> Result<UniformBufferId> {
        unsafe {
            let buffer = GpuBuffer::host_visible(
                &self.ctx,
                size as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            if let Some(bytes) = data {
                if let Err(e) = buffer.write(&self.ctx, 0, bytes) {
                    buffer.destroy(&self.ctx);
                    return Err(e);
                }
            }
            Ok(self.uniform_buffers.add(buffer))
        }
    }

    fn update_uniform_buffer(
        &mut self,
        id: UniformBufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let buffer = self.uniform_buffers.get(id)?;
        unsafe { buffer.write(&self.ctx, offset as vk::DeviceSize, data) }
    }

    fn destroy_uniform_buffer(&mut self, id: UniformBufferId) -> Result<()> {
        let buffer = self.uniform_buffers.remove(id)?;
        unsafe { buffer.destroy(&self.ctx) };
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> Result<TextureId> {
        let texture = unsafe { self.create_texture_inner(desc, data)? };
        debug!(
            "texture {}x{} {:?}, {} mip level(s)",
            desc.width, desc.height, desc.format, texture.image.mip_levels
        );
        Ok(self.textures.add(texture))
    }

    fn destroy_texture(&mut self, id: TextureId) -> Result<()> {
        let texture = self.textures.remove(id)?;
        unsafe {
            self.ctx.device.destroy_image_view(texture.view, None);
            texture.image.destroy(&self.ctx);
        }
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
        let max_supported = self.ctx.properties.limits.max_sampler_anisotropy;
        let anisotropy = desc
            .max_anisotropy
            .filter(|_| self.ctx.anisotropy)
            .map(|a| a.clamp(1.0, max_supported));
        let address = convert::address_mode(desc.address_mode);
        let ci = vk::SamplerCreateInfo {
            s_type: vk::StructureType::SAMPLER_CREATE_INFO,
            mag_filter: convert::filter(desc.mag_filter),
            min_filter: convert::filter(desc.min_filter),
            mipmap_mode: convert::mipmap_mode(desc.mip_filter),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            anisotropy_enable: anisotropy.is_some().into(),
            max_anisotropy: anisotropy.unwrap_or(1.0),
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };
        let sampler = unsafe {
            self.ctx
                .device
                .create_sampler(&ci, None)
                .op("vkCreateSampler")?
        };
        Ok(self.samplers.add(sampler))
    }

    fn destroy_sampler(&mut self, id: SamplerId) -> Result<()> {
        let sampler = self.samplers.remove(id)?;
        unsafe { self.ctx.device.destroy_sampler(sampler, None) };
        Ok(())
    }

    fn create_shader(&mut self, stages: &[ShaderModuleDesc<'_>]) -> Result<ShaderId> {
        let shader = unsafe { Shader::new(&self.ctx.device, stages)? };
        Ok(self.shaders.add(shader))
    }

    fn destroy_shader(&mut self, id: ShaderId) -> Result<()> {
        let shader = self.shaders.remove(id)?;
        unsafe { shader.destroy(&self.ctx.device) };
        Ok(())
    }

    fn create_framebuffer_format(
        &mut self,
        attachments: &[AttachmentDesc],
    ) -> Result<FramebufferFormatId> {
        let (order, color_count) = attachment_order(attachments)?;
        let depth = order.get(color_count as usize).copied();

        let colors: Vec<renderpass::AttachmentSpec> = order[..color_count as usize]
            .iter()
            .map(|&i| {
                let a = &attachments[i];
                renderpass::offscreen_attachment(
                    convert::texture_format(a.format),
                    false,
                    a.load,
                    a.sampled_after,
                )
            })
            .collect();
        let depth_spec = depth.map(|i| {
            let a = &attachments[i];
            renderpass::offscreen_attachment(
                convert::texture_format(a.format),
                true,
                a.load,
                a.sampled_after,
            )
        });

        let render_pass =
            unsafe { renderpass::create_render_pass(&self.ctx.device, &colors, depth_spec)? };
        Ok(self.framebuffer_formats.add(FramebufferFormat {
            render_pass,
            attachments: attachments.to_vec(),
            order,
            color_count,
            has_depth: depth_spec.is_some(),
            framebuffers: 0,
        }))
    }

    fn destroy_framebuffer_format(&mut self, id: FramebufferFormatId) -> Result<()> {
        let format = self.framebuffer_formats.get(id)?;
        if format.framebuffers != 0 {
            return Err(RenderError::contract(format!(
                "framebuffer format still used by {} framebuffer(s)",
                format.framebuffers
            )));
        }
        let format = self.framebuffer_formats.remove(id)?;
        unsafe { self.ctx.device.destroy_render_pass(format.render_pass, None) };
        Ok(())
    }

    fn create_framebuffer(
        &mut self,
        format_id: FramebufferFormatId,
        attachments: &[TextureId],
    ) -> Result<FramebufferId> {
        let format = self.framebuffer_formats.get(format_id)?;
        if attachments.len() != format.attachments.len() {
            return Err(RenderError::contract(format!(
                "format has {} attachments, {} textures supplied",
                format.attachments.len(),
                attachments.len()
            )));
        }

        let mut extent: Option<vk::Extent2D> = None;
        let mut views = Vec::with_capacity(attachments.len());
        for &i in &format.order {
            let want = &format.attachments[i];
            let tex = self.textures.get(attachments[i])?;
            if tex.format != want.format {
                return Err(RenderError::contract(format!(
                    "attachment {i} is {:?}, format expects {:?}",
                    tex.format, want.format
                )));
            }
            if tex.layout != renderpass::resting_layout(want.format.is_depth(), want.sampled_after)
            {
                return Err(RenderError::contract(format!(
                    "attachment {i}: texture usage does not match sampled_after={}",
                    want.sampled_after
                )));
            }
            match extent {
                None => extent = Some(tex.image.extent),
                Some(e) if e != tex.image.extent => {
                    return Err(RenderError::contract("attachments differ in size"))
                }
                Some(_) => {}
            }
            views.push(tex.view);
        }
        let extent = extent.ok_or_else(|| RenderError::contract("no attachments"))?;

        let framebuffer = unsafe {
            renderpass::create_framebuffer(&self.ctx.device, format.render_pass, &views, extent)?
        };
        self.framebuffer_formats.get_mut(format_id)?.framebuffers += 1;
        Ok(self.framebuffers.add(Framebuffer {
            framebuffer,
            format: format_id,
            extent,
        }))
    }

    fn destroy_framebuffer(&mut self, id: FramebufferId) -> Result<()> {
        self.ensure_not_target(DrawTarget::Framebuffer(id))?;
        let fb = self.framebuffers.remove(id)?;
        if let Ok(format) = self.framebuffer_formats.get_mut(fb.format) {
            format.framebuffers -= 1;
        }
        unsafe { self.ctx.device.destroy_framebuffer(fb.framebuffer, None) };
        Ok(())
    }

    fn create_uniform_layout(&mut self, desc: &UniformLayoutDesc) -> Result<UniformLayoutId> {
        validate_uniform_layout(desc)?;
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .entries
            .iter()
            .map(|e| vk::DescriptorSetLayoutBinding {
                binding: e.binding,
                descriptor_type: convert::descriptor_type(e.kind),
                descriptor_count: 1,
                stage_flags: convert::shader_stages(e.stages),
                ..Default::default()
            })
            .collect();
        let ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe {
            self.ctx
                .device
                .create_descriptor_set_layout(&ci, None)
                .op("vkCreateDescriptorSetLayout")?
        };
        let allocator = DescriptorAllocator::new(
            self.ctx.device.clone(),
            Properties {
                layout,
                sampler_count: desc.count(UniformKind::CombinedImageSampler),
                uniform_buffer_count: desc.count(UniformKind::UniformBuffer),
            },
            PoolGrowth {
                initial_size: self.cfg.descriptor_pool_initial_size,
                factor: self.cfg.descriptor_pool_growth_factor,
            },
        );
        Ok(self.uniform_layouts.add(UniformLayout {
            allocator,
            desc: desc.clone(),
        }))
    }

    fn destroy_uniform_layout(&mut self, id: UniformLayoutId) -> Result<()> {
        // Refused with live sets; the layout stays usable.
        unsafe { self.uniform_layouts.get_mut(id)?.allocator.destroy()? };
        let layout = self.uniform_layouts.remove(id)?;
        unsafe {
            self.ctx
                .device
                .destroy_descriptor_set_layout(layout.allocator.layout(), None)
        };
        Ok(())
    }

    fn create_uniform_set(
        &mut self,
        layout_id: UniformLayoutId,
        bindings: &[UniformBinding],
    ) -> Result<UniformSetId> {
        let resolved = {
            let layout = self.uniform_layouts.get(layout_id)?;
            self.resolve_bindings(&layout.desc, bindings)?
        };
        let set = unsafe { self.uniform_layouts.get_mut(layout_id)?.allocator.allocate_set()? };

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for (_, r) in &resolved {
            match *r {
                ResolvedResource::Buffer(buffer, range) => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range,
                    })
                }
                ResolvedResource::Image(image_view, sampler) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler,
                        image_view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    })
                }
            }
        }
        let (mut b, mut i) = (0usize, 0usize);
        let writes: Vec<vk::WriteDescriptorSet> = resolved
            .iter()
            .map(|(binding, r)| {
                let mut w = vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: *binding,
                    descriptor_count: 1,
                    ..Default::default()
                };
                match r {
                    ResolvedResource::Buffer(..) => {
                        w.descriptor_type = vk::DescriptorType::UNIFORM_BUFFER;
                        w.p_buffer_info = &buffer_infos[b];
                        b += 1;
                    }
                    ResolvedResource::Image(..) => {
                        w.descriptor_type = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
                        w.p_image_info = &image_infos[i];
                        i += 1;
                    }
                }
                w
            })
            .collect();
        unsafe { self.ctx.device.update_descriptor_sets(&writes, &[]) };

        Ok(self.uniform_sets.add(UniformSet {
            set,
            layout: layout_id,
        }))
    }

    fn destroy_uniform_set(&mut self, id: UniformSetId) -> Result<()> {
        let set = self.uniform_sets.remove(id)?;
        self.uniform_layouts
            .get_mut(set.layout)
            .map_err(|_| RenderError::contract("uniform set outlived its layout"))?
            .allocator
            .free_set(set.set)
    }

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc) -> Result<GraphicsPipelineId> {
        if desc.uniform_layouts.len() > MAX_BOUND_SETS {
            return Err(RenderError::contract(format!(
                "{} uniform layouts exceed the {MAX_BOUND_SETS} bindable sets",
                desc.uniform_layouts.len()
            )));
        }
        let set_layouts = desc
            .uniform_layouts
            .iter()
            .map(|&id| Ok(self.uniform_layouts.get(id)?.allocator.layout()))
            .collect::<Result<Vec<_>>>()?;

        let target = match desc.target {
            PipelineTarget::Framebuffer(id) => {
                let format = self.framebuffer_formats.get(id)?;
                PipelineTargetInfo {
                    render_pass: format.render_pass,
                    color_count: format.color_count,
                    has_depth: format.has_depth,
                }
            }
            PipelineTarget::Surface(id) => {
                let surface = self.surfaces.get(id)?;
                if surface.render_pass() == vk::RenderPass::null() {
                    return Err(RenderError::contract(
                        "surface has no swapchain to build a pipeline against",
                    ));
                }
                PipelineTargetInfo {
                    render_pass: surface.render_pass(),
                    color_count: 1,
                    has_depth: surface.has_depth(),
                }
            }
        };

        let shader = self.shaders.get(desc.shader)?;
        let inner = unsafe {
            pipeline::create_graphics_pipeline(&self.ctx.device, shader, &set_layouts, target, desc)?
        };
        Ok(self.pipelines.add(Pipeline {
            inner,
            target: desc.target,
            set_count: set_layouts.len() as u32,
        }))
    }

    fn destroy_graphics_pipeline(&mut self, id: GraphicsPipelineId) -> Result<()> {
        let p = self.pipelines.remove(id)?;
        unsafe { p.inner.destroy(&self.ctx.device) };
        Ok(())
    }

    fn create_surface(
        &mut self,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        prefs: &SurfacePreferences,
    ) -> Result<SurfaceId> {
        let display_raw = display
            .display_handle()
            .map_err(|e| RenderError::window(e.to_string()))?
            .as_raw();
        let window_raw = window
            .window_handle()
            .map_err(|e| RenderError::window(e.to_string()))?
            .as_raw();

        let (vsync, prefer_mailbox) =
            convert::present_flags(prefs.present_mode, self.cfg.vsync, self.cfg.prefer_mailbox);
        let settings = SurfaceSettings {
            formats: prefs.formats.iter().copied().map(convert::texture_format).collect(),
            vsync,
            prefer_mailbox,
            depth: prefs.depth && self.cfg.depth_buffer,
            min_image_count: self.cfg.min_image_count,
            frames_in_flight: self.cfg.frames_in_flight,
        };

        unsafe {
            let raw = ash_window::create_surface(
                &self.ctx.entry,
                &self.ctx.instance,
                display_raw,
                window_raw,
                None,
            )
            .op("vkCreateSurfaceKHR")?;
            let family = match self.ctx.present_family(raw) {
                Ok(f) => f,
                Err(e) => {
                    self.ctx.surface_loader.destroy_surface(raw, None);
                    return Err(e);
                }
            };

            let mut surface = VkSurface::new(raw, family, size, settings);
            let configured = surface
                .update_surface_capabilities(&self.ctx)
                .and_then(|_| surface.create_swap_chain(&self.ctx));
            if let Err(e) = configured {
                surface.destroy(&self.ctx);
                return Err(e);
            }
            match surface.color_format().map(convert::texture_format_from_vk) {
                Some(Ok(format)) => info!(
                    "surface created {}x{} {format:?} (present family {family})",
                    size.width, size.height
                ),
                Some(Err(_)) | None => warn!(
                    "surface created {}x{} with a format outside TextureFormat",
                    size.width, size.height
                ),
            }
            Ok(self.surfaces.add(surface))
        }
    }

    fn resize_surface(&mut self, id: SurfaceId, size: RenderSize) -> Result<()> {
        self.ensure_not_target(DrawTarget::Surface(id))?;
        let surface = self.surfaces.get_mut(id)?;
        unsafe { surface.resize_surface(&self.ctx, size) }
    }

    fn surface_size(&self, id: SurfaceId) -> Result<RenderSize> {
        Ok(self.surfaces.get(id)?.size())
    }

    fn destroy_surface(&mut self, id: SurfaceId) -> Result<()> {
        self.ensure_not_target(DrawTarget::Surface(id))?;
        let mut surface = self.surfaces.remove(id)?;
        unsafe { surface.destroy(&self.ctx) };
        Ok(())
    }

    fn begin_draw_list(&mut self, target: DrawTarget, clear: &ClearValues) -> Result<()> {
        if self.list.is_some() {
            return Err(RenderError::contract("a draw list is already open"));
        }
        let device = &self.ctx.device;
        let cmd = match target {
            DrawTarget::Surface(id) => {
                let surface = self.surfaces.get_mut(id)?;
                unsafe {
                    // If anything below fails the image stays acquired and
                    // the next begin_draw_list records into it again.
                    let index = surface.acquire_next_image(&self.ctx)?;
                    let (Some(cmd), Some(fb), Some(extent)) = (
                        surface.frame_command_buffer(),
                        surface.framebuffer(index),
                        surface.extent(),
                    ) else {
                        return Err(RenderError::SwapchainOutOfDate);
                    };
                    draw::begin_command_buffer(device, cmd)?;
                    let clears = draw::clear_values(1, surface.has_depth(), clear);
                    draw::begin_render_pass(
                        device,
                        cmd,
                        surface.render_pass(),
                        fb,
                        extent,
                        &clears,
                    );
                    cmd
                }
            }
            DrawTarget::Framebuffer(id) => {
                let fb = self.framebuffers.get(id)?;
                let format = self.framebuffer_formats.get(fb.format)?;
                let cmd = self.offscreen.cmd;
                unsafe {
                    draw::begin_command_buffer(device, cmd)?;
                    let clears = draw::clear_values(format.color_count, format.has_depth, clear);
                    draw::begin_render_pass(
                        device,
                        cmd,
                        format.render_pass,
                        fb.framebuffer,
                        fb.extent,
                        &clears,
                    );
                }
                cmd
            }
        };
        self.list = Some(OpenList {
            target,
            cmd,
            state: DrawState::default(),
            layout: None,
            set_count: 0,
        });
        Ok(())
    }

    fn bind_pipeline(&mut self, id: GraphicsPipelineId) -> Result<()> {
        let list = open(&mut self.list)?;
        let p = self.pipelines.get(id)?;
        let compatible = match (p.target, list.target) {
            (PipelineTarget::Surface(s), DrawTarget::Surface(t)) => s == t,
            (PipelineTarget::Framebuffer(f), DrawTarget::Framebuffer(fb)) => {
                self.framebuffers.get(fb)?.format == f
            }
            _ => false,
        };
        if !compatible {
            return Err(RenderError::contract(
                "pipeline was built for a different target",
            ));
        }
        if list.state.set_pipeline(p.inner.pipeline) {
            unsafe {
                self.ctx.device.cmd_bind_pipeline(
                    list.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    p.inner.pipeline,
                )
            };
        }
        list.layout = Some(p.inner.layout);
        list.set_count = p.set_count;
        Ok(())
    }

    fn bind_uniform_set(&mut self, id: UniformSetId, slot: u32) -> Result<()> {
        let set = self.uniform_sets.get(id)?.set;
        let device = &self.ctx.device;
        let list = open(&mut self.list)?;
        let layout = list
            .layout
            .ok_or_else(|| RenderError::contract("bind a pipeline before uniform sets"))?;
        if slot >= list.set_count {
            return Err(RenderError::contract(format!(
                "slot {slot} beyond the pipeline's {} uniform layout(s)",
                list.set_count
            )));
        }
        if list.state.set_uniform_set(slot, set)? {
            unsafe {
                device.cmd_bind_descriptor_sets(
                    list.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    slot,
                    std::slice::from_ref(&set),
                    &[],
                )
            };
        }
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, id: VertexBufferId, binding: u32) -> Result<()> {
        let buffer = self.vertex_buffers.get(id)?.buffer;
        let device = &self.ctx.device;
        let list = open(&mut self.list)?;
        if list.state.set_vertex_buffer(binding, buffer)? {
            unsafe { device.cmd_bind_vertex_buffers(list.cmd, binding, &[buffer], &[0]) };
        }
        Ok(())
    }

    fn bind_index_buffer(&mut self, id: IndexBufferId) -> Result<()> {
        let ib = self.index_buffers.get(id)?;
        let (buffer, index_type) = (ib.buffer.buffer, ib.index_type);
        let device = &self.ctx.device;
        let list = open(&mut self.list)?;
        if list.state.set_index_buffer(buffer, index_type) {
            unsafe { device.cmd_bind_index_buffer(list.cmd, buffer, 0, index_type) };
        }
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        let device = &self.ctx.device;
        let list = open(&mut self.list)?;
        if !list.state.has_pipeline() {
            return Err(RenderError::contract("draw without a bound pipeline"));
        }
        unsafe { device.cmd_draw(list.cmd, vertex_count, instance_count, 0, 0) };
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> Result<()> {
        let device = &self.ctx.device;
        let list = open(&mut self.list)?;
        if !list.state.has_pipeline() {
            return Err(RenderError::contract("draw without a bound pipeline"));
        }
        if list.state.index_type().is_none() {
            return Err(RenderError::contract("draw_indexed without an index buffer"));
        }
        unsafe { device.cmd_draw_indexed(list.cmd, index_count, instance_count, 0, 0, 0) };
        Ok(())
    }

    fn end_draw_list(&mut self) -> Result<()> {
        let list = self
            .list
            .take()
            .ok_or_else(|| RenderError::contract("no draw list is open"))?;
        unsafe {
            self.ctx.device.cmd_end_render_pass(list.cmd);
            self.ctx
                .device
                .end_command_buffer(list.cmd)
                .op("vkEndCommandBuffer")?;
            match list.target {
                DrawTarget::Surface(id) => {
                    let surface = self.surfaces.get_mut(id)?;
                    surface.submit_and_present(&self.ctx, list.cmd)
                }
                DrawTarget::Framebuffer(_) => self.submit_offscreen(list.cmd),
            }
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.ctx.wait_idle() }
    }
}

impl Drop for VkRenderDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.wait_idle() {
                warn!("device teardown: wait_idle failed: {e}");
            }
            if self.list.take().is_some() {
                warn!("device dropped with a draw list still open");
            }
            let device = &self.ctx.device;

            // Dependents first: pipelines, sets, layouts, framebuffers, formats.
            for (id, p) in self.pipelines.drain() {
                leaked(id);
                p.inner.destroy(device);
            }
            for (id, set) in self.uniform_sets.drain() {
                leaked(id);
                if let Ok(layout) = self.uniform_layouts.get_mut(set.layout) {
                    layout.allocator.free_set(set.set).ok();
                }
            }
            for (id, mut layout) in self.uniform_layouts.drain() {
                leaked(id);
                layout.allocator.destroy().ok();
                device.destroy_descriptor_set_layout(layout.allocator.layout(), None);
            }
            for (id, fb) in self.framebuffers.drain() {
                leaked(id);
                device.destroy_framebuffer(fb.framebuffer, None);
            }
            for (id, format) in self.framebuffer_formats.drain() {
                leaked(id);
                device.destroy_render_pass(format.render_pass, None);
            }
            for (id, shader) in self.shaders.drain() {
                leaked(id);
                shader.destroy(device);
            }
            for (id, sampler) in self.samplers.drain() {
                leaked(id);
                device.destroy_sampler(sampler, None);
            }
            for (id, texture) in self.textures.drain() {
                leaked(id);
                device.destroy_image_view(texture.view, None);
                texture.image.destroy(&self.ctx);
            }
            for (id, buffer) in self.uniform_buffers.drain() {
                leaked(id);
                buffer.destroy(&self.ctx);
            }
            for (id, ib) in self.index_buffers.drain() {
                leaked(id);
                ib.buffer.destroy(&self.ctx);
            }
            for (id, buffer) in self.vertex_buffers.drain() {
                leaked(id);
                buffer.destroy(&self.ctx);
            }
            for (id, mut surface) in self.surfaces.drain() {
                leaked(id);
                surface.destroy(&self.ctx);
            }

            device.destroy_fence(self.offscreen.fence, None);
            device.free_command_buffers(
                self.ctx.graphics_pool,
                std::slice::from_ref(&self.offscreen.cmd),
            );
        }
        info!("vk device torn down");
        // `ctx` drops after this, tearing down pools, device and instance.
    }
}

#[cfg(test)]
mod tests {
    use ember_render::{LoadOp, ShaderStages, UniformLayoutEntry};

    use super::*;

    fn desc(format: TextureFormat, usage: TextureUsage) -> TextureDesc {
        TextureDesc {
            width: 4,
            height: 4,
            format,
            usage,
            mipmaps: false,
        }
    }

    fn is_contract<T: std::fmt::Debug>(r: Result<T>) -> bool {
        matches!(r, Err(RenderError::ContractViolation(_)))
    }

    #[test]
    fn sampled_texture_data_must_match_extent() {
        let d = desc(TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        assert!(validate_texture(&d, Some(&[0u8; 64])).is_ok());
        assert!(is_contract(validate_texture(&d, Some(&[0u8; 63]))));
        assert!(validate_texture(&d, None).is_ok());
    }

    #[test]
    fn texture_usage_must_fit_the_format() {
        assert!(is_contract(validate_texture(
            &desc(TextureFormat::Rgba8Unorm, TextureUsage::empty()),
            None
        )));
        assert!(is_contract(validate_texture(
            &desc(TextureFormat::Depth32Float, TextureUsage::COLOR_ATTACHMENT),
            None
        )));
        assert!(is_contract(validate_texture(
            &desc(TextureFormat::Rgba8Unorm, TextureUsage::DEPTH_ATTACHMENT),
            None
        )));
        assert!(is_contract(validate_texture(
            &desc(
                TextureFormat::Depth24Stencil8,
                TextureUsage::DEPTH_ATTACHMENT | TextureUsage::SAMPLED
            ),
            None
        )));
        assert!(validate_texture(
            &desc(
                TextureFormat::Depth32Float,
                TextureUsage::DEPTH_ATTACHMENT | TextureUsage::SAMPLED
            ),
            None
        )
        .is_ok());
    }

    #[test]
    fn depth_and_mipmapped_attachments_are_rejected() {
        let depth = desc(TextureFormat::Depth32Float, TextureUsage::DEPTH_ATTACHMENT);
        assert!(is_contract(validate_texture(&depth, Some(&[0u8; 64]))));

        let mut target = desc(
            TextureFormat::Rgba8Unorm,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED,
        );
        target.mipmaps = true;
        assert!(is_contract(validate_texture(&target, None)));

        let mut zero = desc(TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        zero.width = 0;
        assert!(is_contract(validate_texture(&zero, None)));
    }

    fn attachment(format: TextureFormat) -> AttachmentDesc {
        AttachmentDesc {
            format,
            load: LoadOp::Clear,
            sampled_after: false,
        }
    }

    #[test]
    fn depth_attachment_moves_to_the_end() {
        let (order, colors) = attachment_order(&[
            attachment(TextureFormat::Depth32Float),
            attachment(TextureFormat::Rgba8Unorm),
            attachment(TextureFormat::Rgba16Float),
        ])
        .unwrap();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(colors, 2);

        let (order, colors) = attachment_order(&[attachment(TextureFormat::Depth32Float)]).unwrap();
        assert_eq!((order, colors), (vec![0], 0));
    }

    #[test]
    fn bad_attachment_lists_are_rejected() {
        assert!(is_contract(attachment_order(&[])));
        assert!(is_contract(attachment_order(&[
            attachment(TextureFormat::Depth32Float),
            attachment(TextureFormat::Depth24Stencil8),
        ])));
    }

    #[test]
    fn uniform_layout_bindings_are_unique() {
        let entry = |binding| UniformLayoutEntry {
            binding,
            kind: UniformKind::UniformBuffer,
            stages: ShaderStages::VERTEX,
        };
        assert!(validate_uniform_layout(&UniformLayoutDesc {
            entries: vec![entry(0), entry(1)],
        })
        .is_ok());
        assert!(is_contract(validate_uniform_layout(&UniformLayoutDesc {
            entries: vec![entry(0), entry(0)],
        })));
        assert!(is_contract(validate_uniform_layout(&UniformLayoutDesc::default())));
    }

    #[test]
    fn binding_requires_an_open_list() {
        let mut list = None;
        assert!(is_contract(open(&mut list).map(|_| ())));
    }
}
