// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;

/// Longest message carried by a [`RenderError`] built from free text.
pub const MAX_MESSAGE_LEN: usize = 256;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A value with no mapping crossed the API boundary.
    #[error("invalid enum value: {0}")]
    InvalidEnum(&'static str),

    /// The graphics API returned a non-success status.
    #[error("{op} failed: {result}")]
    OperationFailed { op: &'static str, result: String },

    /// Lifetime rules were broken by the caller.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("handle not found")]
    NotFound,

    #[error("invalid handle (already destroyed or never created)")]
    InvalidHandle,

    #[error("unsupported layout transition: {from} -> {to}")]
    UnsupportedLayoutTransition { from: String, to: String },

    #[error("no memory type matches the requested properties")]
    NoSuitableMemoryType,

    /// The swapchain no longer matches the surface; resize, then retry.
    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    #[error("window handle unavailable: {0}")]
    Window(String),
}

impl RenderError {
    pub fn contract(msg: impl Into<String>) -> Self {
        RenderError::ContractViolation(bounded(msg.into()))
    }

    pub fn window(msg: impl Into<String>) -> Self {
        RenderError::Window(bounded(msg.into()))
    }

    pub fn failed(op: &'static str, result: impl std::fmt::Debug) -> Self {
        RenderError::OperationFailed {
            op,
            result: bounded(format!("{result:?}")),
        }
    }

    /// True for the one condition callers are expected to recover from.
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, RenderError::SwapchainOutOfDate)
    }
}

fn bounded(mut s: String) -> String {
    if s.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let msg = "é".repeat(MAX_MESSAGE_LEN);
        match RenderError::contract(msg) {
            RenderError::ContractViolation(s) => {
                assert!(s.len() <= MAX_MESSAGE_LEN);
                assert!(s.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_out_of_date_is_recoverable() {
        assert!(RenderError::SwapchainOutOfDate.is_out_of_date());
        assert!(!RenderError::InvalidHandle.is_out_of_date());
        assert!(!RenderError::failed("vkQueueSubmit", "ERROR_DEVICE_LOST").is_out_of_date());
    }
}
