//! Pure swapchain parameter selection. Nothing here touches the driver.

use ash::vk;
use ember_render::{RenderError, RenderSize, Result};

/// First preferred format in the sRGB-nonlinear colour space the surface
/// offers, else whatever the driver lists first.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: &[vk::Format],
) -> Result<vk::SurfaceFormatKHR> {
    let first = formats.first().copied().ok_or(RenderError::OperationFailed {
        op: "vkGetPhysicalDeviceSurfaceFormatsKHR",
        result: "surface reports no formats".to_owned(),
    })?;
    Ok(preferred
        .iter()
        .find_map(|&want| {
            formats.iter().copied().find(|f| {
                f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .unwrap_or(first))
}

/// FIFO is the only mode every driver must offer, so it is the fallback.
pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    prefer_mailbox: bool,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match (vsync, prefer_mailbox) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, true) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, false) => &[vk::PresentModeKHR::FIFO],
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// `current_extent.width == u32::MAX` means the window lets us pick.
pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, wanted: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: wanted
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: wanted
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// `max_image_count == 0` means no upper limit.
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, min_wanted: u32) -> u32 {
    let count = min_wanted.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        count
    } else {
        count.min(caps.max_image_count)
    }
}

pub(crate) fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn preferred_format_wins_in_preference_order() {
        let offered = [
            sf(vk::Format::B8G8R8A8_UNORM),
            sf(vk::Format::R8G8B8A8_SRGB),
            sf(vk::Format::B8G8R8A8_SRGB),
        ];
        let got = choose_surface_format(
            &offered,
            &[vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB],
        )
        .unwrap();
        assert_eq!(got.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn unmatched_preferences_fall_back_to_first_format() {
        let offered = [sf(vk::Format::A2B10G10R10_UNORM_PACK32), sf(vk::Format::B8G8R8A8_UNORM)];
        let got = choose_surface_format(&offered, &[vk::Format::R8G8B8A8_SRGB]).unwrap();
        assert_eq!(got, offered[0]);

        // Right format in the wrong colour space does not count.
        let hdr = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        }];
        let got = choose_surface_format(&hdr, &[vk::Format::B8G8R8A8_SRGB]).unwrap();
        assert_eq!(got, hdr[0]);
    }

    #[test]
    fn empty_format_list_is_an_error() {
        let err = choose_surface_format(&[], &[vk::Format::B8G8R8A8_SRGB]).unwrap_err();
        assert!(matches!(err, RenderError::OperationFailed { .. }));
    }

    #[test]
    fn present_mode_follows_vsync_and_mailbox() {
        use vk::PresentModeKHR as P;
        let all = [P::FIFO, P::MAILBOX, P::IMMEDIATE];
        assert_eq!(choose_present_mode(&all, true, true), P::MAILBOX);
        assert_eq!(choose_present_mode(&all, true, false), P::FIFO);
        assert_eq!(choose_present_mode(&all, false, true), P::IMMEDIATE);
        assert_eq!(choose_present_mode(&[P::FIFO], true, true), P::FIFO);
        assert_eq!(choose_present_mode(&[P::FIFO, P::MAILBOX], false, false), P::MAILBOX);
    }

    #[test]
    fn extent_is_clamped_only_when_free() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let wanted = RenderSize {
            width: 4000,
            height: 300,
        };
        assert_eq!(
            choose_extent(&caps, wanted),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );

        caps.current_extent.width = u32::MAX;
        assert_eq!(
            choose_extent(&caps, wanted),
            vk::Extent2D {
                width: 1024,
                height: 300
            }
        );
    }

    #[test]
    fn image_count_respects_driver_limits() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps, 3), 3);
        assert_eq!(choose_image_count(&caps, 1), 2);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps, 3), 2);
    }
}
