//! Vulkan backend for `ember-render`, built on `ash`.
#![allow(clippy::missing_safety_doc)]

mod commands;
mod config;
mod context;
mod convert;
mod descriptor;
mod device;
mod draw;
mod error;
mod memory;
mod pipeline;
mod renderpass;
mod surface;
mod swapchain;

pub use config::DeviceConfig;
pub use context::VkContext;
pub use device::VkRenderDevice;
