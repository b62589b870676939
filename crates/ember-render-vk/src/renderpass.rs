use ash::vk;
use ember_render::{LoadOp, Result};

use crate::error::VkResultExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AttachmentSpec {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// Layout an offscreen texture sits in between passes.
pub(crate) fn resting_layout(depth: bool, sampled: bool) -> vk::ImageLayout {
    match (depth, sampled) {
        (_, true) => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        (false, false) => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

/// Offscreen attachments start and end the pass in their resting layout, so
/// consecutive passes and sampling need no extra barriers. Contents that will
/// be cleared or discarded may start from UNDEFINED.
pub(crate) fn offscreen_attachment(
    format: vk::Format,
    depth: bool,
    load: LoadOp,
    sampled_after: bool,
) -> AttachmentSpec {
    let resting = resting_layout(depth, sampled_after);
    let (load_op, initial_layout) = match load {
        LoadOp::Load => (vk::AttachmentLoadOp::LOAD, resting),
        LoadOp::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED),
        LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ImageLayout::UNDEFINED),
    };
    AttachmentSpec {
        format,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout,
        final_layout: resting,
    }
}

/// Colour target of a window: cleared every frame, handed to the presentation engine.
pub(crate) fn present_attachment(format: vk::Format) -> AttachmentSpec {
    AttachmentSpec {
        format,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Per-frame depth of a window; contents do not outlive the pass.
pub(crate) fn transient_depth_attachment(format: vk::Format) -> AttachmentSpec {
    AttachmentSpec {
        format,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

fn describe(spec: &AttachmentSpec) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format: spec.format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: spec.load_op,
        store_op: spec.store_op,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: spec.initial_layout,
        final_layout: spec.final_layout,
        ..Default::default()
    }
}

/// Single-subpass render pass over `colors` plus an optional depth attachment.
pub(crate) unsafe fn create_render_pass(
    device: &ash::Device,
    colors: &[AttachmentSpec],
    depth: Option<AttachmentSpec>,
) -> Result<vk::RenderPass> {
    let mut attachments: Vec<vk::AttachmentDescription> = colors.iter().map(describe).collect();
    let color_refs: Vec<vk::AttachmentReference> = (0..colors.len() as u32)
        .map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();
    let depth_ref = depth.map(|d| {
        attachments.push(describe(&d));
        vk::AttachmentReference {
            attachment: colors.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    });

    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: color_refs.len() as u32,
        p_color_attachments: color_refs.as_ptr(),
        p_depth_stencil_attachment: depth_ref
            .as_ref()
            .map_or(std::ptr::null(), |r| r as *const _),
        ..Default::default()
    };

    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let attachment_writes =
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: attachment_stages,
            src_access_mask: attachment_writes,
            dst_access_mask: attachment_writes
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            ..Default::default()
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: attachment_stages,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: attachment_writes,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            ..Default::default()
        },
    ];

    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };
    device
        .create_render_pass(&ci, None)
        .op("vkCreateRenderPass")
}

pub(crate) unsafe fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    attachments: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let ci = vk::FramebufferCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
        render_pass,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        width: extent.width,
        height: extent.height,
        layers: 1,
        ..Default::default()
    };
    device
        .create_framebuffer(&ci, None)
        .op("vkCreateFramebuffer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_attachments_start_in_their_resting_layout() {
        let spec = offscreen_attachment(vk::Format::R8G8B8A8_UNORM, false, LoadOp::Load, true);
        assert_eq!(spec.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(spec.initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(spec.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn cleared_attachments_discard_previous_contents() {
        let spec = offscreen_attachment(vk::Format::D32_SFLOAT, true, LoadOp::Clear, false);
        assert_eq!(spec.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            spec.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(spec.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn window_attachments_end_presentable() {
        let color = present_attachment(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        let depth = transient_depth_attachment(vk::Format::D32_SFLOAT);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
    }
}
