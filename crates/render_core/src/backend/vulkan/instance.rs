//! Vulkan instance creation with optional validation and debug messenger

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

use crate::error::{VulkanError, VulkanResult};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Loaded entry point and instance, destroyed together
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Instance dispatch table
    pub instance: Instance,
    /// Debug utilities loader and messenger, present when validation is enabled
    pub debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance
    ///
    /// `display` adds the surface extensions required by the windowing system.
    /// Validation is silently skipped when the layer is not installed.
    pub fn new(
        app_name: &str,
        display: Option<RawDisplayHandle>,
        enable_validation: bool,
        api_version: u32,
    ) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid app name: {e}")))?;
        let engine_name_cstr = CString::new("render_core")
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let core_version = vk::make_api_version(0, 0, 1, 0);
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .engine_name(&engine_name_cstr)
            .engine_version(core_version)
            .api_version(api_version);

        let mut extensions: Vec<*const c_char> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)
                .map_err(VulkanError::Api)?
                .to_vec(),
            None => Vec::new(),
        };

        let validation = enable_validation && Self::validation_available(&entry);
        if enable_validation && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&instance_info, None) }.map_err(VulkanError::Api)?;

        let debug = if validation {
            let loader = DebugUtils::new(&entry, &instance);
            match Self::create_messenger(&loader) {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!(
            "Created Vulkan instance (validation: {}, surface extensions: {})",
            validation,
            display.is_some()
        );

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                    name == VALIDATION_LAYER
                })
            })
            .unwrap_or(false)
    }

    fn create_messenger(loader: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
        use vk::DebugUtilsMessageTypeFlagsEXT as Kind;

        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(Severity::INFO | Severity::WARNING | Severity::ERROR)
            .message_type(Kind::GENERAL | Kind::VALIDATION | Kind::PERFORMANCE)
            .pfn_user_callback(Some(log_validation_message));
        unsafe { loader.create_debug_utils_messenger(&messenger_info, None) }.map_err(VulkanError::Api)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = &self.debug {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Forward a validation layer message to `log` at the matching level
unsafe extern "system" fn log_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let Some(data) = data.as_ref() else {
        return vk::FALSE;
    };
    if data.p_message.is_null() {
        return vk::FALSE;
    }
    let text = CStr::from_ptr(data.p_message).to_string_lossy();
    let source = if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };

    let level = if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Trace
    };
    log::log!(target: "render_core::vulkan", level, "{source}: {text}");

    vk::FALSE
}
