use std::ffi::{CStr, CString};

use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use ember_render::{RenderError, Result};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::error::VkResultExt;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance, device, queues and the command pools every subsystem borrows.
///
/// Built once by the device and handed down as `&VkContext`. Creation order is
/// instance -> debug messenger -> device -> pools; `Drop` walks it backwards.
pub struct VkContext {
    pub(crate) entry: Entry,
    pub(crate) instance: Instance,
    messenger: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(crate) surface_loader: surface::Instance,

    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) swapchain_loader: swapchain::Device,

    pub(crate) graphics_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    queues: Vec<vk::Queue>,
    queue_families: Vec<vk::QueueFamilyProperties>,

    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) anisotropy: bool,

    /// One-shot transfer work only (`commands::one_shot`).
    pub(crate) transient_pool: vk::CommandPool,
    /// Per-frame and offscreen draw lists; buffers are reset individually.
    pub(crate) graphics_pool: vk::CommandPool,

    device_name: String,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

unsafe fn layer_available(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == name)
}

unsafe fn create_instance(
    entry: &Entry,
    display: Option<RawDisplayHandle>,
    cfg: &DeviceConfig,
) -> Result<(Instance, bool)> {
    let app_name = CString::new(cfg.app_name.as_str())
        .map_err(|_| RenderError::contract("app_name contains a NUL byte"))?;

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: c"ember".as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_1,
        ..Default::default()
    };

    let mut extensions: Vec<*const std::os::raw::c_char> = match display {
        Some(dh) => ash_window::enumerate_required_extensions(dh)
            .op("enumerate_required_extensions")?
            .to_vec(),
        None => Vec::new(),
    };

    let validation = cfg.validation && layer_available(entry, VALIDATION_LAYER);
    if cfg.validation && !validation {
        warn!("validation requested but {:?} is not installed", VALIDATION_LAYER);
    }
    let layers = [VALIDATION_LAYER.as_ptr()];
    if validation {
        extensions.push(ext_debug::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
        pp_enabled_layer_names: if validation {
            layers.as_ptr()
        } else {
            std::ptr::null()
        },
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .op("vkCreateInstance")?;
    Ok((instance, validation))
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .op("vkCreateDebugUtilsMessengerEXT")?;
    Ok((loader, messenger))
}

unsafe fn supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME)
}

/// First device with a graphics queue and swapchain support; discrete GPUs win.
unsafe fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let mut best: Option<(vk::PhysicalDevice, u32, bool)> = None;
    for phys in instance
        .enumerate_physical_devices()
        .op("vkEnumeratePhysicalDevices")?
    {
        if !supports_swapchain(instance, phys) {
            continue;
        }
        let families = instance.get_physical_device_queue_family_properties(phys);
        let Some(graphics) = families
            .iter()
            .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        else {
            continue;
        };
        let discrete = instance.get_physical_device_properties(phys).device_type
            == vk::PhysicalDeviceType::DISCRETE_GPU;
        match best {
            Some((_, _, true)) => {}
            Some(_) if !discrete => {}
            _ => best = Some((phys, graphics as u32, discrete)),
        }
    }
    best.map(|(p, g, _)| (p, g)).ok_or(RenderError::OperationFailed {
        op: "pick_physical_device",
        result: "no device with graphics + swapchain support".to_owned(),
    })
}

pub(crate) fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x1002 => "AMD",
        0x10DE => "NVIDIA",
        0x8086 => "Intel",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        0x106B => "Apple",
        0x1010 => "ImgTec",
        _ => "Unknown",
    }
}

/// Undo steps for a half-built context, run newest first on drop unless
/// `disarm` was called.
#[derive(Default)]
struct Rollback(Vec<Box<dyn FnOnce()>>);

impl Rollback {
    fn push(&mut self, undo: impl FnOnce() + 'static) {
        self.0.push(Box::new(undo));
    }

    fn disarm(mut self) {
        self.0.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(undo) = self.0.pop() {
            undo();
        }
    }
}

impl VkContext {
    /// `display` is needed when surfaces will be created; headless use passes `None`.
    pub unsafe fn new(display: Option<RawDisplayHandle>, cfg: &DeviceConfig) -> Result<Self> {
        let entry = Entry::linked();
        let (instance, validation) = create_instance(&entry, display, cfg)?;
        let mut rollback = Rollback::default();
        {
            let instance = instance.clone();
            rollback.push(move || unsafe { instance.destroy_instance(None) });
        }

        let messenger = if validation {
            match create_debug_messenger(&entry, &instance) {
                Ok((loader, messenger)) => {
                    let undo = loader.clone();
                    rollback.push(move || unsafe {
                        undo.destroy_debug_utils_messenger(messenger, None)
                    });
                    Some((loader, messenger))
                }
                Err(e) => {
                    warn!("debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let (phys, graphics_family) = pick_physical_device(&instance)?;
        let queue_families = instance.get_physical_device_queue_family_properties(phys);

        // One queue from every family, so whichever family a surface can
        // present from already has a queue waiting.
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = (0..queue_families.len() as u32)
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let supported = instance.get_physical_device_features(phys);
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: supported.sampler_anisotropy,
            ..Default::default()
        };

        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };
        let device = instance
            .create_device(phys, &dinfo, None)
            .op("vkCreateDevice")?;
        {
            let device = device.clone();
            rollback.push(move || unsafe { device.destroy_device(None) });
        }

        let queues: Vec<vk::Queue> = (0..queue_families.len() as u32)
            .map(|family| device.get_device_queue(family, 0))
            .collect();
        let graphics_queue = queues[graphics_family as usize];

        let transient_pool = device
            .create_command_pool(
                &vk::CommandPoolCreateInfo {
                    s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                    queue_family_index: graphics_family,
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    ..Default::default()
                },
                None,
            )
            .op("vkCreateCommandPool(transient)")?;
        {
            let device = device.clone();
            rollback.push(move || unsafe { device.destroy_command_pool(transient_pool, None) });
        }
        let graphics_pool = device
            .create_command_pool(
                &vk::CommandPoolCreateInfo {
                    s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                    queue_family_index: graphics_family,
                    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    ..Default::default()
                },
                None,
            )
            .op("vkCreateCommandPool(graphics)")?;

        let properties = instance.get_physical_device_properties(phys);
        let memory_properties = instance.get_physical_device_memory_properties(phys);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        info!(
            "vk: {} ({}), graphics family {}, {} queue families, validation={}",
            device_name,
            vendor_name(properties.vendor_id),
            graphics_family,
            queue_families.len(),
            messenger.is_some()
        );

        rollback.disarm();
        Ok(Self {
            entry,
            instance,
            messenger,
            surface_loader,
            phys,
            device,
            swapchain_loader,
            graphics_family,
            graphics_queue,
            queues,
            queue_families,
            memory_properties,
            properties,
            anisotropy: supported.sampler_anisotropy == vk::TRUE,
            transient_pool,
            graphics_pool,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn vendor_name(&self) -> &'static str {
        vendor_name(self.properties.vendor_id)
    }

    pub(crate) fn queue(&self, family: u32) -> vk::Queue {
        self.queues[family as usize]
    }

    /// Picks the family that presents to `surface`, preferring the graphics one.
    pub(crate) unsafe fn present_family(&self, surface: vk::SurfaceKHR) -> Result<u32> {
        let supports = |family: u32| {
            self.surface_loader
                .get_physical_device_surface_support(self.phys, family, surface)
                .unwrap_or(false)
        };
        if supports(self.graphics_family) {
            return Ok(self.graphics_family);
        }
        (0..self.queue_families.len() as u32)
            .find(|&f| supports(f))
            .ok_or(RenderError::OperationFailed {
                op: "vkGetPhysicalDeviceSurfaceSupportKHR",
                result: "no queue family can present to this surface".to_owned(),
            })
    }

    pub(crate) unsafe fn format_features(&self, format: vk::Format) -> vk::FormatProperties {
        self.instance
            .get_physical_device_format_properties(self.phys, format)
    }

    pub(crate) unsafe fn create_fence_raw(&self, signaled: bool) -> Result<vk::Fence> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        self.device.create_fence(&ci, None).op("vkCreateFence")
    }

    /// A resettable primary buffer from the graphics pool.
    pub(crate) unsafe fn allocate_graphics_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.graphics_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        Ok(self
            .device
            .allocate_command_buffers(&ai)
            .op("vkAllocateCommandBuffers")?[0])
    }

    pub(crate) unsafe fn wait_idle(&self) -> Result<()> {
        self.device.device_wait_idle().op("vkDeviceWaitIdle")
    }
}

impl Drop for VkContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.graphics_pool, None);
            self.device.destroy_command_pool(self.transient_pool, None);
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{vendor_name, Rollback};

    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, steps: &[&'static str]) -> Rollback {
        let mut rollback = Rollback::default();
        for &step in steps {
            let log = Rc::clone(log);
            rollback.push(move || log.borrow_mut().push(step));
        }
        rollback
    }

    #[test]
    fn failed_construction_unwinds_newest_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        drop(recording(&log, &["instance", "messenger", "device", "transient_pool"]));
        assert_eq!(
            *log.borrow(),
            ["transient_pool", "device", "messenger", "instance"]
        );
    }

    #[test]
    fn completed_construction_keeps_everything() {
        let log = Rc::new(RefCell::new(Vec::new()));
        recording(&log, &["instance", "device"]).disarm();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn known_vendors_are_named() {
        assert_eq!(vendor_name(0x10DE), "NVIDIA");
        assert_eq!(vendor_name(0x1002), "AMD");
        assert_eq!(vendor_name(0x8086), "Intel");
        assert_eq!(vendor_name(0xBEEF), "Unknown");
    }
}
