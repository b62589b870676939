//! Per-window presentation: swapchain, its views and depth, the surface's
//! render pass, framebuffers and frame pacing.
//!
//! ```text
//! Uninitialized --create_swap_chain--> Configured --resize_surface--> Configured
//!                                           |               \--(failure or 0x0)--> Invalid
//!                                           \--destroy--> Destroyed
//! ```
//!
//! All driver calls go through [`PresentBackend`], which `VkContext`
//! implements; tests drive the state machine with a counting fake.

use ash::prelude::VkResult;
use ash::vk;
use ember_render::{RenderError, RenderSize, Result};
use tracing::{debug, info, warn};

use crate::context::VkContext;
use crate::error::VkResultExt;
use crate::memory::{self, DepthTarget};
use crate::renderpass;
use crate::swapchain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    present_mode_name,
};

pub(crate) struct SurfaceSupport {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SwapchainRequest {
    pub surface: vk::SurfaceKHR,
    pub present_family: u32,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Driver calls made by [`VkSurface`].
pub(crate) trait PresentBackend {
    type Depth;

    unsafe fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport>;
    unsafe fn depth_format(&self) -> Result<vk::Format>;

    unsafe fn create_swapchain(
        &self,
        req: &SwapchainRequest,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)>;
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    unsafe fn create_image_view(&self, image: vk::Image, format: vk::Format)
        -> Result<vk::ImageView>;
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    unsafe fn create_depth(&self, extent: vk::Extent2D, format: vk::Format) -> Result<Self::Depth>;
    fn depth_view(&self, depth: &Self::Depth) -> vk::ImageView;
    unsafe fn destroy_depth(&self, depth: Self::Depth);

    unsafe fn create_render_pass(
        &self,
        color: vk::Format,
        depth: Option<vk::Format>,
    ) -> Result<vk::RenderPass>;
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    unsafe fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    unsafe fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer>;
    unsafe fn free_command_buffer(&self, cmd: vk::CommandBuffer);

    unsafe fn acquire_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    unsafe fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;
    unsafe fn present(
        &self,
        family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    unsafe fn wait_fence(&self, fence: vk::Fence) -> Result<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    unsafe fn wait_idle(&self) -> Result<()>;
    unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SurfaceState {
    Uninitialized,
    Configured,
    Invalid,
    Destroyed,
}

/// Per-surface choices fixed at creation, from the caller's preferences
/// merged with the device config.
#[derive(Clone, Debug)]
pub(crate) struct SurfaceSettings {
    pub formats: Vec<vk::Format>,
    pub vsync: bool,
    pub prefer_mailbox: bool,
    pub depth: bool,
    pub min_image_count: u32,
    pub frames_in_flight: u32,
}

#[derive(Clone, Copy, Debug)]
struct Chosen {
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    image_count: u32,
    pre_transform: vk::SurfaceTransformFlagsKHR,
    depth_format: Option<vk::Format>,
}

struct SwapchainResources<D> {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: Option<D>,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl<D> SwapchainResources<D> {
    fn empty(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            depth: None,
            framebuffers: Vec::new(),
            extent,
            format,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    cmd: vk::CommandBuffer,
}

pub(crate) struct VkSurface<B: PresentBackend> {
    surface: vk::SurfaceKHR,
    present_family: u32,
    size: RenderSize,
    settings: SurfaceSettings,
    chosen: Option<Chosen>,
    swapchain: Option<SwapchainResources<B::Depth>>,
    render_pass: vk::RenderPass,
    frames: Vec<FrameSync>,
    /// Fence of the frame last rendering into each swapchain image.
    image_fences: Vec<vk::Fence>,
    frame: usize,
    current_image: Option<u32>,
    state: SurfaceState,
}

/// Tears down in framebuffers -> render pass -> swapchain order. Works on
/// partially built resources: null handles and empty lists are skipped.
unsafe fn release<B: PresentBackend>(
    backend: &B,
    res: SwapchainResources<B::Depth>,
    render_pass: &mut vk::RenderPass,
) {
    for fb in res.framebuffers {
        backend.destroy_framebuffer(fb);
    }
    if *render_pass != vk::RenderPass::null() {
        backend.destroy_render_pass(*render_pass);
        *render_pass = vk::RenderPass::null();
    }
    for view in res.views {
        backend.destroy_image_view(view);
    }
    if let Some(depth) = res.depth {
        backend.destroy_depth(depth);
    }
    if res.swapchain != vk::SwapchainKHR::null() {
        backend.destroy_swapchain(res.swapchain);
    }
}

impl<B: PresentBackend> VkSurface<B> {
    pub fn new(
        surface: vk::SurfaceKHR,
        present_family: u32,
        size: RenderSize,
        settings: SurfaceSettings,
    ) -> Self {
        Self {
            surface,
            present_family,
            size,
            settings,
            chosen: None,
            swapchain: None,
            render_pass: vk::RenderPass::null(),
            frames: Vec::new(),
            image_fences: Vec::new(),
            frame: 0,
            current_image: None,
            state: SurfaceState::Uninitialized,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|s| s.extent)
    }

    pub fn color_format(&self) -> Option<vk::Format> {
        self.chosen.map(|c| c.format.format)
    }

    pub fn has_depth(&self) -> bool {
        self.chosen.is_some_and(|c| c.depth_format.is_some())
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.swapchain
            .as_ref()
            .and_then(|s| s.framebuffers.get(image_index as usize).copied())
    }

    /// Command buffer owned by the current frame slot.
    pub fn frame_command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.frames.get(self.frame).map(|f| f.cmd)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state == SurfaceState::Destroyed {
            return Err(RenderError::contract("surface already destroyed"));
        }
        Ok(())
    }

    /// Requeries the surface and records format, present mode, extent, image
    /// count and depth format for the next swapchain.
    pub unsafe fn update_surface_capabilities(&mut self, backend: &B) -> Result<()> {
        self.ensure_alive()?;
        let support = backend.surface_support(self.surface)?;
        let format = choose_surface_format(&support.formats, &self.settings.formats)?;
        let present_mode = choose_present_mode(
            &support.present_modes,
            self.settings.vsync,
            self.settings.prefer_mailbox,
        );
        let caps = &support.caps;
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };
        let depth_format = if self.settings.depth {
            Some(backend.depth_format()?)
        } else {
            None
        };
        let chosen = Chosen {
            format,
            present_mode,
            extent: choose_extent(caps, self.size),
            image_count: choose_image_count(caps, self.settings.min_image_count),
            pre_transform,
            depth_format,
        };
        debug!(
            "surface caps: {:?}/{:?}, {}, {}x{}, {} images, depth {:?}",
            chosen.format.format,
            chosen.format.color_space,
            present_mode_name(present_mode),
            chosen.extent.width,
            chosen.extent.height,
            chosen.image_count,
            chosen.depth_format
        );
        self.chosen = Some(chosen);
        Ok(())
    }

    unsafe fn create_frames(&mut self, backend: &B) -> Result<()> {
        for _ in 0..self.settings.frames_in_flight.max(1) {
            let mut frame = FrameSync {
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
                cmd: vk::CommandBuffer::null(),
            };
            let built = (|| -> Result<()> {
                frame.image_available = backend.create_semaphore()?;
                frame.render_finished = backend.create_semaphore()?;
                // Signalled so the first wait on each slot returns at once.
                frame.in_flight = backend.create_fence(true)?;
                frame.cmd = backend.allocate_command_buffer()?;
                Ok(())
            })();
            // Track even a half-built frame so destroy_frames frees it.
            self.frames.push(frame);
            if let Err(e) = built {
                self.destroy_frames(backend);
                return Err(e);
            }
        }
        Ok(())
    }

    unsafe fn destroy_frames(&mut self, backend: &B) {
        for f in self.frames.drain(..) {
            if f.cmd != vk::CommandBuffer::null() {
                backend.free_command_buffer(f.cmd);
            }
            if f.in_flight != vk::Fence::null() {
                backend.destroy_fence(f.in_flight);
            }
            if f.render_finished != vk::Semaphore::null() {
                backend.destroy_semaphore(f.render_finished);
            }
            if f.image_available != vk::Semaphore::null() {
                backend.destroy_semaphore(f.image_available);
            }
        }
        self.frame = 0;
    }

    unsafe fn build(
        &self,
        backend: &B,
        c: &Chosen,
        res: &mut SwapchainResources<B::Depth>,
        render_pass: &mut vk::RenderPass,
    ) -> Result<()> {
        let (swapchain, images) = backend.create_swapchain(&SwapchainRequest {
            surface: self.surface,
            present_family: self.present_family,
            format: c.format,
            present_mode: c.present_mode,
            extent: c.extent,
            image_count: c.image_count,
            pre_transform: c.pre_transform,
        })?;
        res.swapchain = swapchain;
        res.images = images;

        for i in 0..res.images.len() {
            let view = backend.create_image_view(res.images[i], c.format.format)?;
            res.views.push(view);
        }
        if let Some(fmt) = c.depth_format {
            res.depth = Some(backend.create_depth(c.extent, fmt)?);
        }

        *render_pass = backend.create_render_pass(c.format.format, c.depth_format)?;

        let depth_view = res.depth.as_ref().map(|d| backend.depth_view(d));
        for i in 0..res.views.len() {
            let mut attachments = vec![res.views[i]];
            attachments.extend(depth_view);
            let fb = backend.create_framebuffer(*render_pass, &attachments, c.extent)?;
            res.framebuffers.push(fb);
        }
        Ok(())
    }

    /// Builds swapchain, views and depth, then the render pass, then the
    /// framebuffers. On failure everything built so far is released and the
    /// surface is left `Invalid`.
    pub unsafe fn create_swap_chain(&mut self, backend: &B) -> Result<()> {
        self.ensure_alive()?;
        if self.swapchain.is_some() {
            return Err(RenderError::contract("surface already has a swapchain"));
        }
        let chosen = self.chosen.ok_or_else(|| {
            RenderError::contract("create_swap_chain before update_surface_capabilities")
        })?;
        if chosen.extent.width == 0 || chosen.extent.height == 0 {
            debug!("surface extent is 0x0; swapchain deferred");
            self.state = SurfaceState::Invalid;
            return Ok(());
        }

        if self.frames.is_empty() {
            if let Err(e) = self.create_frames(backend) {
                self.state = SurfaceState::Invalid;
                return Err(e);
            }
        }

        let mut res = SwapchainResources::empty(chosen.extent, chosen.format.format);
        let mut render_pass = vk::RenderPass::null();
        if let Err(e) = self.build(backend, &chosen, &mut res, &mut render_pass) {
            warn!("swapchain creation failed: {e}");
            release(backend, res, &mut render_pass);
            self.state = SurfaceState::Invalid;
            return Err(e);
        }

        info!(
            "swapchain {}x{} with {} images, {}",
            res.extent.width,
            res.extent.height,
            res.images.len(),
            present_mode_name(chosen.present_mode)
        );
        self.image_fences = vec![vk::Fence::null(); res.images.len()];
        self.render_pass = render_pass;
        self.swapchain = Some(res);
        self.current_image = None;
        self.state = SurfaceState::Configured;
        Ok(())
    }

    unsafe fn teardown_swapchain(&mut self, backend: &B) {
        let mut render_pass = self.render_pass;
        match self.swapchain.take() {
            Some(res) => release(backend, res, &mut render_pass),
            None => {
                if render_pass != vk::RenderPass::null() {
                    backend.destroy_render_pass(render_pass);
                }
            }
        }
        self.render_pass = vk::RenderPass::null();
        self.image_fences.clear();
        if let Some(image) = self.current_image.take() {
            // The slot's semaphore still holds the acquire signal and its fence
            // may be reset without a submit behind it; rebuild the sync objects.
            debug!("dropping frame sync for unpresented image {image}");
            self.destroy_frames(backend);
        }
    }

    /// Waits for the current frame slot, then acquires the next image. An
    /// image that was acquired but never submitted is handed out again.
    pub unsafe fn acquire_next_image(&mut self, backend: &B) -> Result<u32> {
        match self.state {
            SurfaceState::Configured => {}
            SurfaceState::Invalid => return Err(RenderError::SwapchainOutOfDate),
            SurfaceState::Uninitialized => {
                return Err(RenderError::contract("surface has no swapchain yet"))
            }
            SurfaceState::Destroyed => {
                return Err(RenderError::contract("surface already destroyed"))
            }
        }
        if let Some(index) = self.current_image {
            debug!("reusing unsubmitted image {index}");
            return Ok(index);
        }
        let swapchain = self
            .swapchain
            .as_ref()
            .map(|s| s.swapchain)
            .ok_or(RenderError::SwapchainOutOfDate)?;
        let frame = self.frames[self.frame];

        backend.wait_fence(frame.in_flight)?;
        let index = match backend.acquire_image(swapchain, frame.image_available) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    warn!("acquired image {index} from a suboptimal swapchain");
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(RenderError::SwapchainOutOfDate),
            Err(e) => return Err(RenderError::failed("vkAcquireNextImageKHR", e)),
        };

        if let Some(slot) = self.image_fences.get_mut(index as usize) {
            let previous = std::mem::replace(slot, frame.in_flight);
            if previous != vk::Fence::null() && previous != frame.in_flight {
                backend.wait_fence(previous)?;
            }
        }
        self.current_image = Some(index);
        Ok(index)
    }

    /// Submits `cmd` for the acquired image and queues it for presentation.
    pub unsafe fn submit_and_present(&mut self, backend: &B, cmd: vk::CommandBuffer) -> Result<()> {
        let image = self.current_image.ok_or_else(|| {
            RenderError::contract("submit_and_present without an acquired image")
        })?;
        let swapchain = self
            .swapchain
            .as_ref()
            .map(|s| s.swapchain)
            .ok_or(RenderError::SwapchainOutOfDate)?;
        let frame = self.frames[self.frame];

        // On failure the image stays acquired and the slot does not advance,
        // so the next acquire returns the same image and the next submit
        // consumes the pending image_available signal.
        backend.reset_fence(frame.in_flight)?;
        backend.submit(cmd, frame.image_available, frame.render_finished, frame.in_flight)?;
        self.current_image = None;
        self.frame = (self.frame + 1) % self.frames.len();

        match backend.present(self.present_family, swapchain, image, frame.render_finished) {
            Ok(false) => Ok(()),
            Ok(true) => {
                warn!("present reported a suboptimal swapchain");
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(e) => Err(RenderError::failed("vkQueuePresentKHR", e)),
        }
    }

    /// Full teardown then rebuild at `size`. A 0x0 size only records the
    /// size; the surface stays `Invalid` until the next non-zero resize.
    pub unsafe fn resize_surface(&mut self, backend: &B, size: RenderSize) -> Result<()> {
        self.ensure_alive()?;
        backend.wait_idle()?;
        self.teardown_swapchain(backend);
        self.state = SurfaceState::Invalid;
        self.size = size;

        if size.is_empty() {
            debug!("surface resized to {}x{}; waiting", size.width, size.height);
            return Ok(());
        }
        self.update_surface_capabilities(backend)?;
        self.create_swap_chain(backend)
    }

    /// Idempotent. Idles, releases swapchain state and sync objects, then the
    /// platform surface.
    pub unsafe fn destroy(&mut self, backend: &B) {
        if self.state == SurfaceState::Destroyed {
            return;
        }
        if let Err(e) = backend.wait_idle() {
            warn!("wait_idle before surface destroy failed: {e}");
        }
        self.teardown_swapchain(backend);
        self.destroy_frames(backend);
        backend.destroy_surface(self.surface);
        self.surface = vk::SurfaceKHR::null();
        self.chosen = None;
        self.state = SurfaceState::Destroyed;
    }
}

impl PresentBackend for VkContext {
    type Depth = DepthTarget;

    unsafe fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        Ok(SurfaceSupport {
            caps: self
                .surface_loader
                .get_physical_device_surface_capabilities(self.phys, surface)
                .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
            formats: self
                .surface_loader
                .get_physical_device_surface_formats(self.phys, surface)
                .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
            present_modes: self
                .surface_loader
                .get_physical_device_surface_present_modes(self.phys, surface)
                .op("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
        })
    }

    unsafe fn depth_format(&self) -> Result<vk::Format> {
        memory::pick_depth_format(self)
    }

    unsafe fn create_swapchain(
        &self,
        req: &SwapchainRequest,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let families = [self.graphics_family, req.present_family];
        let (sharing, family_count) = if req.present_family == self.graphics_family {
            (vk::SharingMode::EXCLUSIVE, 0)
        } else {
            (vk::SharingMode::CONCURRENT, 2)
        };
        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: req.surface,
            min_image_count: req.image_count,
            image_format: req.format.format,
            image_color_space: req.format.color_space,
            image_extent: req.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing,
            queue_family_index_count: family_count,
            p_queue_family_indices: families.as_ptr(),
            pre_transform: req.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: req.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let swapchain = self
            .swapchain_loader
            .create_swapchain(&ci, None)
            .op("vkCreateSwapchainKHR")?;
        match self
            .swapchain_loader
            .get_swapchain_images(swapchain)
            .op("vkGetSwapchainImagesKHR")
        {
            Ok(images) => Ok((swapchain, images)),
            Err(e) => {
                self.swapchain_loader.destroy_swapchain(swapchain, None);
                Err(e)
            }
        }
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.swapchain_loader.destroy_swapchain(swapchain, None);
    }

    unsafe fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
    ) -> Result<vk::ImageView> {
        memory::create_image_view(self, image, format, vk::ImageAspectFlags::COLOR, 1)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn create_depth(&self, extent: vk::Extent2D, format: vk::Format) -> Result<DepthTarget> {
        DepthTarget::new(self, extent, format)
    }

    fn depth_view(&self, depth: &DepthTarget) -> vk::ImageView {
        depth.view
    }

    unsafe fn destroy_depth(&self, depth: DepthTarget) {
        depth.destroy(self);
    }

    unsafe fn create_render_pass(
        &self,
        color: vk::Format,
        depth: Option<vk::Format>,
    ) -> Result<vk::RenderPass> {
        renderpass::create_render_pass(
            &self.device,
            &[renderpass::present_attachment(color)],
            depth.map(renderpass::transient_depth_attachment),
        )
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.device.destroy_render_pass(render_pass, None);
    }

    unsafe fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        renderpass::create_framebuffer(&self.device, render_pass, attachments, extent)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.device.destroy_framebuffer(framebuffer, None);
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        self.device
            .create_semaphore(&ci, None)
            .op("vkCreateSemaphore")
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        self.create_fence_raw(signaled)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    unsafe fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.allocate_graphics_command_buffer()
    }

    unsafe fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.device
            .free_command_buffers(self.graphics_pool, std::slice::from_ref(&cmd));
    }

    unsafe fn acquire_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        self.swapchain_loader
            .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
    }

    unsafe fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        self.device
            .queue_submit(self.graphics_queue, std::slice::from_ref(&si), fence)
            .op("vkQueueSubmit")
    }

    unsafe fn present(
        &self,
        family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        self.swapchain_loader.queue_present(self.queue(family), &pi)
    }

    unsafe fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device
            .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
            .op("vkWaitForFences")
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device
            .reset_fences(std::slice::from_ref(&fence))
            .op("vkResetFences")
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        VkContext::wait_idle(self)
    }

    unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.surface_loader.destroy_surface(surface, None);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    use ash::vk::Handle;

    use super::*;

    #[derive(Default)]
    struct Log {
        next_raw: u64,
        created: HashMap<&'static str, u32>,
        destroyed: HashMap<&'static str, u32>,
        order: Vec<&'static str>,
        fail_swapchain: bool,
        fail_framebuffer_after: Option<u32>,
        acquire_result: Option<vk::Result>,
        present_result: Option<vk::Result>,
        current_extent: vk::Extent2D,
        formats: Vec<vk::SurfaceFormatKHR>,
        submits: u32,
        presents: u32,
        acquires: u32,
        fail_submit: bool,
        no_depth_format: bool,
        unsignaled: HashSet<u64>,
    }

    #[derive(Default)]
    struct FakeBackend(RefCell<Log>);

    impl FakeBackend {
        fn new(width: u32, height: u32) -> Self {
            let backend = FakeBackend::default();
            {
                let mut log = backend.0.borrow_mut();
                log.current_extent = vk::Extent2D { width, height };
                log.formats = vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ];
            }
            backend
        }

        fn create(&self, kind: &'static str) -> u64 {
            let mut log = self.0.borrow_mut();
            *log.created.entry(kind).or_default() += 1;
            log.next_raw += 1;
            log.next_raw
        }

        fn destroy(&self, kind: &'static str) {
            let mut log = self.0.borrow_mut();
            *log.destroyed.entry(kind).or_default() += 1;
            log.order.push(kind);
        }

        fn created(&self, kind: &'static str) -> u32 {
            self.0.borrow().created.get(kind).copied().unwrap_or(0)
        }

        fn destroyed(&self, kind: &'static str) -> u32 {
            self.0.borrow().destroyed.get(kind).copied().unwrap_or(0)
        }

        fn assert_balanced(&self) {
            let log = self.0.borrow();
            for (kind, created) in &log.created {
                assert_eq!(
                    log.destroyed.get(kind).copied().unwrap_or(0),
                    *created,
                    "{kind} created/destroyed mismatch"
                );
            }
        }
    }

    impl PresentBackend for FakeBackend {
        type Depth = vk::ImageView;

        unsafe fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
            let log = self.0.borrow();
            Ok(SurfaceSupport {
                caps: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 3,
                    current_extent: log.current_extent,
                    supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    ..Default::default()
                },
                formats: log.formats.clone(),
                present_modes: vec![vk::PresentModeKHR::FIFO],
            })
        }

        unsafe fn depth_format(&self) -> Result<vk::Format> {
            if self.0.borrow().no_depth_format {
                return Err(RenderError::OperationFailed {
                    op: "pick_depth_format",
                    result: "no depth format".to_owned(),
                });
            }
            Ok(vk::Format::D32_SFLOAT)
        }

        unsafe fn create_swapchain(
            &self,
            req: &SwapchainRequest,
        ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
            if self.0.borrow().fail_swapchain {
                return Err(RenderError::failed(
                    "vkCreateSwapchainKHR",
                    vk::Result::ERROR_SURFACE_LOST_KHR,
                ));
            }
            let raw = self.create("swapchain");
            let images = (0..req.image_count)
                .map(|i| vk::Image::from_raw(1000 + i as u64))
                .collect();
            Ok((vk::SwapchainKHR::from_raw(raw), images))
        }

        unsafe fn destroy_swapchain(&self, _swapchain: vk::SwapchainKHR) {
            self.destroy("swapchain");
        }

        unsafe fn create_image_view(
            &self,
            _image: vk::Image,
            _format: vk::Format,
        ) -> Result<vk::ImageView> {
            Ok(vk::ImageView::from_raw(self.create("view")))
        }

        unsafe fn destroy_image_view(&self, _view: vk::ImageView) {
            self.destroy("view");
        }

        unsafe fn create_depth(
            &self,
            _extent: vk::Extent2D,
            _format: vk::Format,
        ) -> Result<vk::ImageView> {
            Ok(vk::ImageView::from_raw(self.create("depth")))
        }

        fn depth_view(&self, depth: &vk::ImageView) -> vk::ImageView {
            *depth
        }

        unsafe fn destroy_depth(&self, _depth: vk::ImageView) {
            self.destroy("depth");
        }

        unsafe fn create_render_pass(
            &self,
            _color: vk::Format,
            _depth: Option<vk::Format>,
        ) -> Result<vk::RenderPass> {
            Ok(vk::RenderPass::from_raw(self.create("render_pass")))
        }

        unsafe fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
            self.destroy("render_pass");
        }

        unsafe fn create_framebuffer(
            &self,
            _render_pass: vk::RenderPass,
            attachments: &[vk::ImageView],
            _extent: vk::Extent2D,
        ) -> Result<vk::Framebuffer> {
            assert_eq!(attachments.len(), 2, "colour + depth");
            let limit = self.0.borrow().fail_framebuffer_after;
            if limit.is_some_and(|n| self.created("framebuffer") >= n) {
                return Err(RenderError::failed(
                    "vkCreateFramebuffer",
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ));
            }
            Ok(vk::Framebuffer::from_raw(self.create("framebuffer")))
        }

        unsafe fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
            self.destroy("framebuffer");
        }

        unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
            Ok(vk::Semaphore::from_raw(self.create("semaphore")))
        }

        unsafe fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
            self.destroy("semaphore");
        }

        unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
            assert!(signaled);
            Ok(vk::Fence::from_raw(self.create("fence")))
        }

        unsafe fn destroy_fence(&self, fence: vk::Fence) {
            self.0.borrow_mut().unsignaled.remove(&fence.as_raw());
            self.destroy("fence");
        }

        unsafe fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
            Ok(vk::CommandBuffer::from_raw(self.create("command_buffer")))
        }

        unsafe fn free_command_buffer(&self, _cmd: vk::CommandBuffer) {
            self.destroy("command_buffer");
        }

        unsafe fn acquire_image(
            &self,
            _swapchain: vk::SwapchainKHR,
            _signal: vk::Semaphore,
        ) -> VkResult<(u32, bool)> {
            let mut log = self.0.borrow_mut();
            log.acquires += 1;
            match log.acquire_result.take() {
                Some(e) => Err(e),
                None => Ok((0, false)),
            }
        }

        unsafe fn submit(
            &self,
            _cmd: vk::CommandBuffer,
            _wait: vk::Semaphore,
            _signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> Result<()> {
            let mut log = self.0.borrow_mut();
            if log.fail_submit {
                return Err(RenderError::failed(
                    "vkQueueSubmit",
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ));
            }
            log.submits += 1;
            // Work completes at once; the fence is signalled.
            log.unsignaled.remove(&fence.as_raw());
            Ok(())
        }

        unsafe fn present(
            &self,
            _family: u32,
            _swapchain: vk::SwapchainKHR,
            _image_index: u32,
            _wait: vk::Semaphore,
        ) -> VkResult<bool> {
            let mut log = self.0.borrow_mut();
            log.presents += 1;
            match log.present_result.take() {
                Some(e) => Err(e),
                None => Ok(false),
            }
        }

        unsafe fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
            assert!(
                !self.0.borrow().unsignaled.contains(&fence.as_raw()),
                "waiting on a reset fence with no submit behind it never returns"
            );
            Ok(())
        }

        unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
            self.0.borrow_mut().unsignaled.insert(fence.as_raw());
            Ok(())
        }

        unsafe fn wait_idle(&self) -> Result<()> {
            Ok(())
        }

        unsafe fn destroy_surface(&self, _surface: vk::SurfaceKHR) {
            self.destroy("surface");
        }
    }

    fn settings() -> SurfaceSettings {
        SurfaceSettings {
            formats: vec![vk::Format::B8G8R8A8_SRGB],
            vsync: true,
            prefer_mailbox: true,
            depth: true,
            min_image_count: 3,
            frames_in_flight: 2,
        }
    }

    fn configured(backend: &FakeBackend) -> VkSurface<FakeBackend> {
        let mut surface = VkSurface::new(
            vk::SurfaceKHR::from_raw(1),
            0,
            RenderSize {
                width: 640,
                height: 480,
            },
            settings(),
        );
        backend.create("surface");
        unsafe {
            surface.update_surface_capabilities(backend).unwrap();
            surface.create_swap_chain(backend).unwrap();
        }
        assert_eq!(surface.state(), SurfaceState::Configured);
        surface
    }

    #[test]
    fn configure_builds_everything_once() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);

        assert_eq!(backend.created("swapchain"), 1);
        assert_eq!(backend.created("view"), 3);
        assert_eq!(backend.created("depth"), 1);
        assert_eq!(backend.created("render_pass"), 1);
        assert_eq!(backend.created("framebuffer"), 3);
        assert_eq!(backend.created("fence"), 2);
        assert_eq!(
            surface.extent(),
            Some(vk::Extent2D {
                width: 640,
                height: 480
            })
        );

        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn preferred_format_is_used_and_unmatched_falls_back() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        assert_eq!(surface.color_format(), Some(vk::Format::B8G8R8A8_SRGB));
        unsafe { surface.destroy(&backend) };

        let backend = FakeBackend::new(640, 480);
        backend.0.borrow_mut().formats.remove(1);
        let mut surface = configured(&backend);
        assert_eq!(surface.color_format(), Some(vk::Format::B8G8R8A8_UNORM));
        unsafe { surface.destroy(&backend) };
    }

    #[test]
    fn repeated_resizes_keep_counts_balanced() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);

        for _ in 0..2 {
            let size = RenderSize {
                width: 800,
                height: 600,
            };
            backend.0.borrow_mut().current_extent = vk::Extent2D {
                width: 800,
                height: 600,
            };
            unsafe { surface.resize_surface(&backend, size).unwrap() };
            assert_eq!(surface.state(), SurfaceState::Configured);
            assert_eq!(surface.size(), size);
        }

        assert_eq!(backend.created("swapchain"), 3);
        assert_eq!(backend.destroyed("swapchain"), 2);
        assert_eq!(backend.created("framebuffer") - backend.destroyed("framebuffer"), 3);
        // Sync objects survive resizes.
        assert_eq!(backend.created("fence"), 2);
        assert_eq!(backend.destroyed("fence"), 0);

        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn teardown_order_is_framebuffers_render_pass_swapchain() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 640,
                        height: 480,
                    },
                )
                .unwrap()
        };

        let order = backend.0.borrow().order.clone();
        let last_fb = order.iter().rposition(|k| *k == "framebuffer").unwrap();
        let rp = order.iter().position(|k| *k == "render_pass").unwrap();
        let sc = order.iter().position(|k| *k == "swapchain").unwrap();
        assert!(last_fb < rp && rp < sc, "{order:?}");

        unsafe { surface.destroy(&backend) };
    }

    #[test]
    fn failed_resize_leaves_the_surface_invalid() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);

        backend.0.borrow_mut().fail_framebuffer_after = Some(4);
        let err = unsafe {
            surface.resize_surface(
                &backend,
                RenderSize {
                    width: 320,
                    height: 240,
                },
            )
        }
        .unwrap_err();
        assert!(matches!(err, RenderError::OperationFailed { .. }));
        assert_eq!(surface.state(), SurfaceState::Invalid);
        // Nothing half-built survives: only sync objects and the surface remain.
        assert_eq!(backend.created("swapchain"), backend.destroyed("swapchain"));
        assert_eq!(backend.created("view"), backend.destroyed("view"));
        assert_eq!(backend.created("framebuffer"), backend.destroyed("framebuffer"));
        assert_eq!(backend.created("render_pass"), backend.destroyed("render_pass"));
        assert_eq!(
            unsafe { surface.acquire_next_image(&backend) },
            Err(RenderError::SwapchainOutOfDate)
        );

        backend.0.borrow_mut().fail_framebuffer_after = None;
        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 320,
                        height: 240,
                    },
                )
                .unwrap()
        };
        assert_eq!(surface.state(), SurfaceState::Configured);
        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn swapchain_failure_during_resize_is_invalid_not_partial() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        backend.0.borrow_mut().fail_swapchain = true;
        assert!(unsafe {
            surface.resize_surface(
                &backend,
                RenderSize {
                    width: 100,
                    height: 100,
                },
            )
        }
        .is_err());
        assert_eq!(surface.state(), SurfaceState::Invalid);
        assert_eq!(surface.render_pass(), vk::RenderPass::null());
        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn zero_size_defers_until_next_resize() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 0,
                        height: 0,
                    },
                )
                .unwrap()
        };
        assert_eq!(surface.state(), SurfaceState::Invalid);
        assert_eq!(surface.extent(), None);
        assert_eq!(backend.created("swapchain"), 1);

        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 640,
                        height: 480,
                    },
                )
                .unwrap()
        };
        assert_eq!(surface.state(), SurfaceState::Configured);
        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn out_of_date_acquire_is_reported_and_recoverable() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);

        backend.0.borrow_mut().acquire_result = Some(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let err = unsafe { surface.acquire_next_image(&backend) }.unwrap_err();
        assert!(err.is_out_of_date());

        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 640,
                        height: 480,
                    },
                )
                .unwrap();
            let index = surface.acquire_next_image(&backend).unwrap();
            assert_eq!(index, 0);
            let cmd = surface.frame_command_buffer().unwrap();
            surface.submit_and_present(&backend, cmd).unwrap();
            surface.destroy(&backend);
        }
        assert_eq!(backend.0.borrow().presents, 1);
        backend.assert_balanced();
    }

    #[test]
    fn other_acquire_errors_are_fatal() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        backend.0.borrow_mut().acquire_result = Some(vk::Result::ERROR_DEVICE_LOST);
        let err = unsafe { surface.acquire_next_image(&backend) }.unwrap_err();
        assert!(matches!(err, RenderError::OperationFailed { .. }));
        unsafe { surface.destroy(&backend) };
    }

    #[test]
    fn out_of_date_present_is_reported() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        backend.0.borrow_mut().present_result = Some(vk::Result::ERROR_OUT_OF_DATE_KHR);
        unsafe {
            surface.acquire_next_image(&backend).unwrap();
            let cmd = surface.frame_command_buffer().unwrap();
            assert_eq!(
                surface.submit_and_present(&backend, cmd),
                Err(RenderError::SwapchainOutOfDate)
            );
            surface.destroy(&backend);
        }
        assert_eq!(backend.0.borrow().submits, 1);
    }

    #[test]
    fn present_without_acquire_is_a_contract_violation() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        let cmd = surface.frame_command_buffer().unwrap();
        let err = unsafe { surface.submit_and_present(&backend, cmd) }.unwrap_err();
        assert!(matches!(err, RenderError::ContractViolation(_)));
        unsafe { surface.destroy(&backend) };
    }

    #[test]
    fn destroy_is_idempotent() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            surface.destroy(&backend);
            surface.destroy(&backend);
        }
        assert_eq!(surface.state(), SurfaceState::Destroyed);
        assert_eq!(backend.destroyed("surface"), 1);
        assert_eq!(backend.destroyed("swapchain"), 1);
        backend.assert_balanced();

        let err = unsafe {
            surface.resize_surface(
                &backend,
                RenderSize {
                    width: 1,
                    height: 1,
                },
            )
        }
        .unwrap_err();
        assert!(matches!(err, RenderError::ContractViolation(_)));
    }

    #[test]
    fn failed_submit_keeps_the_image_for_the_next_frame() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            let index = surface.acquire_next_image(&backend).unwrap();
            let cmd = surface.frame_command_buffer().unwrap();

            backend.0.borrow_mut().fail_submit = true;
            let err = surface.submit_and_present(&backend, cmd).unwrap_err();
            assert!(matches!(err, RenderError::OperationFailed { .. }));
            assert_eq!(backend.0.borrow().presents, 0);

            // Same slot, same image, no second acquire and no wait on the
            // fence that was reset for the failed submit.
            backend.0.borrow_mut().fail_submit = false;
            assert_eq!(surface.acquire_next_image(&backend).unwrap(), index);
            assert_eq!(surface.frame_command_buffer(), Some(cmd));
            assert_eq!(backend.0.borrow().acquires, 1);

            surface.submit_and_present(&backend, cmd).unwrap();
            assert_eq!(backend.0.borrow().presents, 1);

            // The following frame moves to the next slot as usual.
            surface.acquire_next_image(&backend).unwrap();
            assert_ne!(surface.frame_command_buffer(), Some(cmd));
            assert_eq!(backend.0.borrow().acquires, 2);
            surface.destroy(&backend);
        }
        backend.assert_balanced();
    }

    #[test]
    fn image_acquired_for_an_abandoned_frame_is_handed_out_again() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            let first = surface.acquire_next_image(&backend).unwrap();
            // Recording failed before submit; the caller simply tries again.
            let again = surface.acquire_next_image(&backend).unwrap();
            assert_eq!(first, again);
            assert_eq!(backend.0.borrow().acquires, 1);
            let cmd = surface.frame_command_buffer().unwrap();
            surface.submit_and_present(&backend, cmd).unwrap();
            surface.destroy(&backend);
        }
        assert_eq!(backend.0.borrow().submits, 1);
        backend.assert_balanced();
    }

    #[test]
    fn resize_with_an_unsubmitted_image_rebuilds_frame_sync() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        unsafe {
            surface.acquire_next_image(&backend).unwrap();
            let cmd = surface.frame_command_buffer().unwrap();
            backend.0.borrow_mut().fail_submit = true;
            assert!(surface.submit_and_present(&backend, cmd).is_err());
            backend.0.borrow_mut().fail_submit = false;

            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 640,
                        height: 480,
                    },
                )
                .unwrap();
            assert_eq!(backend.destroyed("fence"), 2);
            assert_eq!(backend.created("fence"), 4);

            surface.acquire_next_image(&backend).unwrap();
            assert_eq!(backend.0.borrow().acquires, 2);
            let cmd = surface.frame_command_buffer().unwrap();
            surface.submit_and_present(&backend, cmd).unwrap();
            surface.destroy(&backend);
        }
        backend.assert_balanced();
    }

    #[test]
    fn resize_to_the_same_size_keeps_extent_and_image_count() {
        let backend = FakeBackend::new(640, 480);
        let mut surface = configured(&backend);
        let extent = surface.extent();
        let images = backend.created("view");

        unsafe {
            surface
                .resize_surface(
                    &backend,
                    RenderSize {
                        width: 640,
                        height: 480,
                    },
                )
                .unwrap()
        };
        assert_eq!(surface.state(), SurfaceState::Configured);
        assert_eq!(surface.extent(), extent);
        assert_eq!(backend.created("view") - backend.destroyed("view"), images);
        assert_eq!(
            backend.created("framebuffer") - backend.destroyed("framebuffer"),
            images
        );
        assert_eq!(backend.created("swapchain"), 2);

        unsafe { surface.destroy(&backend) };
        backend.assert_balanced();
    }

    #[test]
    fn missing_depth_format_fails_configuration() {
        let backend = FakeBackend::new(640, 480);
        backend.0.borrow_mut().no_depth_format = true;
        let mut surface = VkSurface::new(
            vk::SurfaceKHR::from_raw(1),
            0,
            RenderSize {
                width: 640,
                height: 480,
            },
            settings(),
        );
        let err = unsafe { surface.update_surface_capabilities(&backend) }.unwrap_err();
        assert!(matches!(err, RenderError::OperationFailed { .. }));
        assert_eq!(surface.state(), SurfaceState::Uninitialized);
        assert_eq!(backend.created("swapchain"), 0);
        assert_eq!(
            unsafe { surface.create_swap_chain(&backend) },
            Err(RenderError::contract(
                "create_swap_chain before update_surface_capabilities"
            ))
        );
        unsafe { surface.destroy(&backend) };
    }
}
