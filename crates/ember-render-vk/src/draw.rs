//! Draw-list recording helpers and the redundant-bind filter.

use ash::vk;
use ember_render::{ClearValues, RenderError, Result};

use crate::error::VkResultExt;

/// Guaranteed minimum of `maxBoundDescriptorSets`.
pub(crate) const MAX_BOUND_SETS: usize = 4;
pub(crate) const MAX_VERTEX_BINDINGS: usize = 16;

/// What the open command buffer currently has bound. Each `set_*` returns
/// whether the bind actually needs recording.
#[derive(Debug, Default)]
pub(crate) struct DrawState {
    pipeline: Option<vk::Pipeline>,
    sets: [Option<vk::DescriptorSet>; MAX_BOUND_SETS],
    vertex_buffers: [Option<vk::Buffer>; MAX_VERTEX_BINDINGS],
    index_buffer: Option<(vk::Buffer, vk::IndexType)>,
}

impl DrawState {
    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn index_type(&self) -> Option<vk::IndexType> {
        self.index_buffer.map(|(_, t)| t)
    }

    /// A new pipeline may have a different layout, so set bindings are dropped.
    pub fn set_pipeline(&mut self, pipeline: vk::Pipeline) -> bool {
        if self.pipeline == Some(pipeline) {
            return false;
        }
        self.pipeline = Some(pipeline);
        self.sets = [None; MAX_BOUND_SETS];
        true
    }

    pub fn set_uniform_set(&mut self, slot: u32, set: vk::DescriptorSet) -> Result<bool> {
        let entry = self.sets.get_mut(slot as usize).ok_or_else(|| {
            RenderError::contract(format!(
                "uniform set slot {slot} out of range (max {MAX_BOUND_SETS})"
            ))
        })?;
        if *entry == Some(set) {
            return Ok(false);
        }
        *entry = Some(set);
        Ok(true)
    }

    pub fn set_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer) -> Result<bool> {
        let entry = self.vertex_buffers.get_mut(binding as usize).ok_or_else(|| {
            RenderError::contract(format!(
                "vertex binding {binding} out of range (max {MAX_VERTEX_BINDINGS})"
            ))
        })?;
        if *entry == Some(buffer) {
            return Ok(false);
        }
        *entry = Some(buffer);
        Ok(true)
    }

    pub fn set_index_buffer(&mut self, buffer: vk::Buffer, index_type: vk::IndexType) -> bool {
        if self.index_buffer == Some((buffer, index_type)) {
            return false;
        }
        self.index_buffer = Some((buffer, index_type));
        true
    }
}

/// Colour clears for each colour attachment, then depth/stencil if present.
pub(crate) fn clear_values(color_count: u32, has_depth: bool, clear: &ClearValues) -> Vec<vk::ClearValue> {
    let mut values: Vec<vk::ClearValue> = (0..color_count)
        .map(|_| vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear.color,
            },
        })
        .collect();
    if has_depth {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: clear.depth,
                stencil: clear.stencil,
            },
        });
    }
    values
}

pub(crate) unsafe fn begin_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device
        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .op("vkResetCommandBuffer")?;
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &bi)
        .op("vkBeginCommandBuffer")
}

/// Begins the pass and sets a full-extent viewport and scissor.
pub(crate) unsafe fn begin_render_pass(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clears: &[vk::ClearValue],
) {
    let area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let rpbi = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass,
        framebuffer,
        render_area: area,
        clear_value_count: clears.len() as u32,
        p_clear_values: clears.as_ptr(),
        ..Default::default()
    };
    device.cmd_begin_render_pass(cmd, &rpbi, vk::SubpassContents::INLINE);

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
    device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));
}
