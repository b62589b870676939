use ash::vk;
use ember_render::Result;
use tracing::debug;

use crate::context::VkContext;
use crate::error::VkResultExt;

/// Records `record` into a fresh transient command buffer, submits it to the
/// graphics queue and blocks until the queue is idle.
///
/// Every upload, copy and layout change outside a draw list goes through
/// here. It is one full CPU<->GPU round trip per call; nothing is pipelined.
/// The command buffer is freed on every path, including failures.
pub(crate) unsafe fn one_shot<F>(ctx: &VkContext, label: &'static str, record: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
{
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: ctx.transient_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = ctx
        .device
        .allocate_command_buffers(&ai)
        .op("vkAllocateCommandBuffers(one_shot)")?[0];

    let result = submit_and_wait(ctx, cmd, record);
    ctx.device
        .free_command_buffers(ctx.transient_pool, std::slice::from_ref(&cmd));
    debug!("one-shot '{label}' done (ok={})", result.is_ok());
    result
}

unsafe fn submit_and_wait<F>(ctx: &VkContext, cmd: vk::CommandBuffer, record: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
{
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    ctx.device
        .begin_command_buffer(cmd, &bi)
        .op("vkBeginCommandBuffer(one_shot)")?;

    if let Err(e) = record(&ctx.device, cmd) {
        // Leave the buffer in a state the pool may free.
        ctx.device.end_command_buffer(cmd).ok();
        return Err(e);
    }
    ctx.device
        .end_command_buffer(cmd)
        .op("vkEndCommandBuffer(one_shot)")?;

    let si = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        ..Default::default()
    };
    ctx.device
        .queue_submit(ctx.graphics_queue, std::slice::from_ref(&si), vk::Fence::null())
        .op("vkQueueSubmit(one_shot)")?;
    ctx.device
        .queue_wait_idle(ctx.graphics_queue)
        .op("vkQueueWaitIdle(one_shot)")
}
