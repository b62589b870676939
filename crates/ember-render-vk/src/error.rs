use ash::prelude::VkResult;
use ember_render::{RenderError, Result};

/// Turns a raw Vulkan status into `OperationFailed`, tagged with the call name.
pub(crate) trait VkResultExt<T> {
    fn op(self, what: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn op(self, what: &'static str) -> Result<T> {
        self.map_err(|e| RenderError::failed(what, e))
    }
}
