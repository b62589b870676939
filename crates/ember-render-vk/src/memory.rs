//! Buffer and image creation, staging uploads, layout transitions and mip
//! chains. Everything here borrows the shared `VkContext` explicitly.

use ash::vk;
use ember_render::{RenderError, Result};
use tracing::debug;

use crate::commands::one_shot;
use crate::context::VkContext;
use crate::error::VkResultExt;

/// Lowest memory type index allowed by `type_bits` whose flags contain `required`.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RenderError::NoSuitableMemoryType)
}

/// The single block of device memory behind one buffer or image.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
}

impl Allocation {
    unsafe fn new(
        ctx: &VkContext,
        req: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let memory_type = find_memory_type(&ctx.memory_properties, req.memory_type_bits, flags)?;
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: memory_type,
            ..Default::default()
        };
        let memory = ctx
            .device
            .allocate_memory(&mai, None)
            .op("vkAllocateMemory")?;
        debug!("allocated {} bytes from memory type {memory_type}", req.size);
        Ok(Self { memory, offset: 0 })
    }

    unsafe fn free(self, ctx: &VkContext) {
        ctx.device.free_memory(self.memory, None);
    }
}

pub(crate) struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: vk::DeviceSize,
    host_visible: bool,
}

impl GpuBuffer {
    pub unsafe fn new(
        ctx: &VkContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RenderError::contract("zero-sized buffer"));
        }
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = ctx.device.create_buffer(&bci, None).op("vkCreateBuffer")?;
        let req = ctx.device.get_buffer_memory_requirements(buffer);

        let allocation = match Allocation::new(ctx, req, flags) {
            Ok(a) => a,
            Err(e) => {
                ctx.device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        if let Err(e) = ctx
            .device
            .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
            .op("vkBindBufferMemory")
        {
            ctx.device.destroy_buffer(buffer, None);
            allocation.free(ctx);
            return Err(e);
        }

        Ok(Self {
            buffer,
            allocation,
            size,
            host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        })
    }

    pub unsafe fn host_visible(
        ctx: &VkContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(
            ctx,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Map, copy, unmap. Only valid on host-visible memory.
    pub unsafe fn write(&self, ctx: &VkContext, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        if !self.host_visible {
            return Err(RenderError::contract(
                "write to device-local buffer; use a staging upload",
            ));
        }
        let len = bytes.len() as vk::DeviceSize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(RenderError::contract(format!(
                "write of {len} bytes at {offset} overruns buffer of {} bytes",
                self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let ptr = ctx
            .device
            .map_memory(
                self.allocation.memory,
                self.allocation.offset + offset,
                len,
                vk::MemoryMapFlags::empty(),
            )
            .op("vkMapMemory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        ctx.device.unmap_memory(self.allocation.memory);
        Ok(())
    }

    /// Creates a device-local buffer holding `bytes`, filled through a
    /// throwaway staging buffer and a one-shot copy.
    pub unsafe fn device_local_with_data(
        ctx: &VkContext,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = Self::host_visible(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let uploaded = staging.write(ctx, 0, bytes).and_then(|_| {
            let dst = Self::new(
                ctx,
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            match copy_buffer(ctx, staging.buffer, dst.buffer, size) {
                Ok(()) => Ok(dst),
                Err(e) => {
                    dst.destroy(ctx);
                    Err(e)
                }
            }
        });
        staging.destroy(ctx);
        uploaded
    }

    pub unsafe fn destroy(self, ctx: &VkContext) {
        ctx.device.destroy_buffer(self.buffer, None);
        self.allocation.free(ctx);
    }
}

pub(crate) unsafe fn copy_buffer(
    ctx: &VkContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    one_shot(ctx, "copy_buffer", |device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        device.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
        Ok(())
    })
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ImageRequest {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

pub(crate) struct GpuImage {
    pub image: vk::Image,
    pub allocation: Allocation,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub aspect: vk::ImageAspectFlags,
}

impl GpuImage {
    pub unsafe fn new(ctx: &VkContext, req: ImageRequest) -> Result<Self> {
        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: req.format,
            extent: vk::Extent3D {
                width: req.extent.width,
                height: req.extent.height,
                depth: 1,
            },
            mip_levels: req.mip_levels.max(1),
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: req.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = ctx.device.create_image(&ici, None).op("vkCreateImage")?;
        let mem_req = ctx.device.get_image_memory_requirements(image);

        let allocation =
            match Allocation::new(ctx, mem_req, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                Ok(a) => a,
                Err(e) => {
                    ctx.device.destroy_image(image, None);
                    return Err(e);
                }
            };
        if let Err(e) = ctx
            .device
            .bind_image_memory(image, allocation.memory, allocation.offset)
            .op("vkBindImageMemory")
        {
            ctx.device.destroy_image(image, None);
            allocation.free(ctx);
            return Err(e);
        }

        Ok(Self {
            image,
            allocation,
            extent: req.extent,
            format: req.format,
            mip_levels: req.mip_levels.max(1),
            aspect: req.aspect,
        })
    }

    pub unsafe fn create_view(&self, ctx: &VkContext) -> Result<vk::ImageView> {
        create_image_view(ctx, self.image, self.format, self.aspect, self.mip_levels)
    }

    /// Copies `bytes` into mip 0 through a staging buffer and leaves every
    /// level in SHADER_READ_ONLY_OPTIMAL, generating the chain when the image
    /// has more than one level.
    pub unsafe fn upload(&self, ctx: &VkContext, bytes: &[u8]) -> Result<()> {
        let staging =
            GpuBuffer::host_visible(ctx, bytes.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let result = staging.write(ctx, 0, bytes).and_then(|_| {
            transition_image_layout(
                ctx,
                self,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            copy_buffer_to_image(ctx, staging.buffer, self)?;
            if self.mip_levels > 1 {
                generate_mipmaps(ctx, self)
            } else {
                transition_image_layout(
                    ctx,
                    self,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }
        });
        staging.destroy(ctx);
        result
    }

    pub unsafe fn destroy(self, ctx: &VkContext) {
        ctx.device.destroy_image(self.image, None);
        self.allocation.free(ctx);
    }
}

pub(crate) unsafe fn create_image_view(
    ctx: &VkContext,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    ctx.device
        .create_image_view(&view_ci, None)
        .op("vkCreateImageView")
}

pub(crate) type BarrierMasks = (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
);

/// Access masks and stages for each supported `(old, new)` layout pair.
pub(crate) fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<BarrierMasks> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::empty(), A::SHADER_READ, S::TOP_OF_PIPE, S::FRAGMENT_SHADER)
        }
        (L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::FRAGMENT_SHADER,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::SHADER_READ,
            A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::LATE_FRAGMENT_TESTS,
            S::FRAGMENT_SHADER,
        ),
        _ => {
            return Err(RenderError::UnsupportedLayoutTransition {
                from: format!("{old:?}"),
                to: format!("{new:?}"),
            })
        }
    };
    Ok(masks)
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn record_layout_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    base_mip: u32,
    level_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old, new)?;
    let barrier = vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout: old,
        new_layout: new,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: base_mip,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        std::slice::from_ref(&barrier),
    );
    Ok(())
}

/// One-shot transition of every mip level of `image`.
pub(crate) unsafe fn transition_image_layout(
    ctx: &VkContext,
    image: &GpuImage,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    // Reject before paying for a submission.
    transition_masks(old, new)?;
    one_shot(ctx, "transition_image_layout", |device, cmd| {
        record_layout_transition(
            device,
            cmd,
            image.image,
            image.aspect,
            0,
            image.mip_levels,
            old,
            new,
        )
    })
}

/// Copies a tightly packed buffer into mip 0. The image must already be in
/// TRANSFER_DST_OPTIMAL.
pub(crate) unsafe fn copy_buffer_to_image(
    ctx: &VkContext,
    buffer: vk::Buffer,
    image: &GpuImage,
) -> Result<()> {
    one_shot(ctx, "copy_buffer_to_image", |device, cmd| {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: image.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            },
        };
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
        Ok(())
    })
}

/// `floor(log2(max(w, h))) + 1`
pub(crate) fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

fn half(v: i32) -> i32 {
    if v > 1 {
        v / 2
    } else {
        1
    }
}

/// Builds levels 1.. by successive half-size blits, starting with every level
/// in TRANSFER_DST_OPTIMAL and ending with every level SHADER_READ_ONLY_OPTIMAL.
pub(crate) unsafe fn generate_mipmaps(ctx: &VkContext, image: &GpuImage) -> Result<()> {
    let features = ctx.format_features(image.format);
    if !features
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    {
        return Err(RenderError::OperationFailed {
            op: "generate_mipmaps",
            result: format!("{:?} does not support linear blits", image.format),
        });
    }

    let width = i32::try_from(image.extent.width)
        .map_err(|_| RenderError::contract("image too wide for blit offsets"))?;
    let height = i32::try_from(image.extent.height)
        .map_err(|_| RenderError::contract("image too tall for blit offsets"))?;

    debug!(
        "generating {} mip levels for {}x{} {:?}",
        image.mip_levels, width, height, image.format
    );

    one_shot(ctx, "generate_mipmaps", |device, cmd| {
        let (mut w, mut h) = (width, height);
        for level in 1..image.mip_levels {
            let src = level - 1;
            record_layout_transition(
                device,
                cmd,
                image.image,
                image.aspect,
                src,
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;

            let (nw, nh) = (half(w), half(h));
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: image.aspect,
                    mip_level: src,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D { x: w, y: h, z: 1 },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: image.aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D { x: nw, y: nh, z: 1 },
                ],
            };
            device.cmd_blit_image(
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&blit),
                vk::Filter::LINEAR,
            );

            record_layout_transition(
                device,
                cmd,
                image.image,
                image.aspect,
                src,
                1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
            w = nw;
            h = nh;
        }

        // The last level was only ever written.
        record_layout_transition(
            device,
            cmd,
            image.image,
            image.aspect,
            image.mip_levels - 1,
            1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    })
}

pub(crate) fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

pub(crate) fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Depth formats in order of preference; pure depth before packed stencil.
const DEPTH_FORMATS: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First of [`DEPTH_FORMATS`] that `supports` accepts.
pub(crate) fn first_depth_format(supports: impl Fn(vk::Format) -> bool) -> Result<vk::Format> {
    DEPTH_FORMATS
        .into_iter()
        .find(|&fmt| supports(fmt))
        .ok_or(RenderError::OperationFailed {
            op: "pick_depth_format",
            result: "no depth format usable as an optimal-tiling attachment".to_owned(),
        })
}

pub(crate) unsafe fn pick_depth_format(ctx: &VkContext) -> Result<vk::Format> {
    first_depth_format(|fmt| {
        ctx.format_features(fmt)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

pub(crate) struct DepthTarget {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl DepthTarget {
    pub unsafe fn new(ctx: &VkContext, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let image = GpuImage::new(
            ctx,
            ImageRequest {
                extent,
                format,
                mip_levels: 1,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: depth_aspect(format),
            },
        )?;
        let ready = transition_image_layout(
            ctx,
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .and_then(|_| image.create_view(ctx));
        match ready {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                image.destroy(ctx);
                Err(e)
            }
        }
    }

    pub unsafe fn destroy(self, ctx: &VkContext) {
        ctx.device.destroy_image_view(self.view, None);
        self.image.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            p.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        p
    }

    #[test]
    fn lowest_matching_memory_type_wins() {
        use vk::MemoryPropertyFlags as M;
        let p = props(&[
            M::DEVICE_LOCAL,
            M::HOST_VISIBLE | M::HOST_COHERENT,
            M::DEVICE_LOCAL | M::HOST_VISIBLE | M::HOST_COHERENT,
            M::HOST_VISIBLE | M::HOST_COHERENT | M::HOST_CACHED,
        ]);

        assert_eq!(find_memory_type(&p, 0b1111, M::HOST_VISIBLE).unwrap(), 1);
        assert_eq!(find_memory_type(&p, 0b1100, M::HOST_VISIBLE).unwrap(), 2);
        assert_eq!(find_memory_type(&p, 0b1111, M::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(find_memory_type(&p, 0b1000, M::HOST_CACHED).unwrap(), 3);
    }

    #[test]
    fn memory_type_without_match_fails() {
        use vk::MemoryPropertyFlags as M;
        let p = props(&[M::DEVICE_LOCAL, M::HOST_VISIBLE]);
        assert_eq!(
            find_memory_type(&p, 0b01, M::HOST_VISIBLE),
            Err(RenderError::NoSuitableMemoryType)
        );
        assert_eq!(
            find_memory_type(&p, 0b11, M::LAZILY_ALLOCATED),
            Err(RenderError::NoSuitableMemoryType)
        );
        // Bits past memory_type_count are ignored.
        assert!(find_memory_type(&p, 1 << 5, M::empty()).is_err());
    }

    #[test]
    fn known_transitions_have_masks() {
        use vk::ImageLayout as L;
        let (src, dst, src_stage, dst_stage) =
            transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (_, dst, _, dst_stage) =
            transition_masks(L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let (_, dst, _, dst_stage) =
            transition_masks(L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert!(dst.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        use vk::ImageLayout as L;
        let err = transition_masks(L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedLayoutTransition { .. }));
        assert!(transition_masks(L::SHADER_READ_ONLY_OPTIMAL, L::UNDEFINED).is_err());
    }

    #[test]
    fn mip_levels_halve_down_to_one() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(512, 300), 10);
        assert_eq!(mip_level_count(1000, 7), 10);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn stencil_formats_get_both_aspects() {
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn depth_format_falls_through_unsupported_candidates() {
        assert_eq!(first_depth_format(|_| true).unwrap(), vk::Format::D32_SFLOAT);
        assert_eq!(
            first_depth_format(|f| f == vk::Format::D16_UNORM || f == vk::Format::D32_SFLOAT_S8_UINT)
                .unwrap(),
            vk::Format::D32_SFLOAT_S8_UINT
        );
    }

    #[test]
    fn no_supported_depth_format_is_an_error() {
        let err = first_depth_format(|_| false).unwrap_err();
        assert!(matches!(
            err,
            RenderError::OperationFailed {
                op: "pick_depth_format",
                ..
            }
        ));
    }
}
