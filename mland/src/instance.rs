// Vulkan rendering instance
//
// This holds the instance-level vulkan state and enumerates the
// presentation-capable GPUs into Device objects.

use ash::ext;
use ash::khr;
use ash::{vk, Entry};

use crate::device::{Device, DeviceId};
use crate::{Backend, MlandError, Result};
use utils::log;

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::sync::{Arc, Mutex};

// this happy little debug callback prints any errors/warnings the
// validation layers throw at us
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {:?}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {:?}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {:?}", message_types, message);
    }
    vk::FALSE
}

/// A Vulkan Instance
///
/// Owns the entry loader, the vkInstance, and every Device created from
/// it. The controller drops all displays before this is torn down.
pub struct Instance {
    /// the entry just loads function pointers from the dynamic library
    pub(crate) i_entry: Entry,
    /// the big vulkan instance
    pub(crate) i_inst: ash::Instance,
    /// debug callback sugar mentioned earlier
    i_debug: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    /// surface query entry points, shared by every display
    pub(crate) i_surface_loader: khr::surface::Instance,
    /// every accepted GPU, keyed by the driver-reported device id
    i_devices: Mutex<HashMap<DeviceId, Arc<Device>>>,
}

impl Instance {
    /// Creates a new debug reporter and registers our callback so
    /// validation failures show up in the log
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let loader = ext::debug_utils::Instance::new(entry, instance);
        let messenger = unsafe {
            loader
                .create_debug_utils_messenger(&debug_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_INSTANCE))?
        };
        Ok((loader, messenger))
    }

    /// Create a vkInstance
    ///
    /// The extension set is the universal surface stack plus whatever
    /// the backend needs to reach its outputs. Failure here is fatal to
    /// the process, there is nothing to render with.
    pub fn new(backend: &dyn Backend, enable_validation: bool) -> Result<Arc<Self>> {
        let entry = Entry::linked();
        let app_name = CString::new("MephLand Compositor").unwrap();

        let mut layer_names = Vec::new();
        if enable_validation {
            log::info!("Enabling validation layers");
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        let layer_names_raw: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let mut extension_names: Vec<CString> = vec![
            khr::surface::NAME.to_owned(),
            khr::get_surface_capabilities2::NAME.to_owned(),
            ext::surface_maintenance1::NAME.to_owned(),
        ];
        extension_names.extend(backend.required_instance_extensions());
        if enable_validation {
            extension_names.push(ext::debug_utils::NAME.to_owned());
        }
        let extension_names_raw: Vec<*const i8> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let appinfo = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(|e| {
                    log::error!("Failed to create vulkan instance: {:?}", e);
                    MlandError::COULD_NOT_CREATE_INSTANCE
                })?
        };

        let debug = if enable_validation {
            Some(Self::setup_debug(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = khr::surface::Instance::new(&entry, &instance);

        Ok(Arc::new(Self {
            i_entry: entry,
            i_inst: instance,
            i_debug: debug,
            i_surface_loader: surface_loader,
            i_devices: Mutex::new(HashMap::new()),
        }))
    }

    /// Check that a physical device advertises every extension in `required`
    fn has_extensions(&self, pdev: vk::PhysicalDevice, required: &[CString]) -> bool {
        let avail = match unsafe { self.i_inst.enumerate_device_extension_properties(pdev) } {
            Ok(props) => props,
            Err(_) => return false,
        };

        required.iter().all(|req| {
            avail.iter().any(|prop| {
                prop.extension_name_as_c_str()
                    .map(|name| name == req.as_c_str())
                    .unwrap_or(false)
            })
        })
    }

    /// Whether this device advertises the Vulkan 1.2 timeline semaphore
    /// feature, which the submission model depends on
    fn has_timeline_semaphores(&self, pdev: vk::PhysicalDevice) -> bool {
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12);
        unsafe { self.i_inst.get_physical_device_features2(pdev, &mut features) };

        vk12.timeline_semaphore == vk::TRUE
    }

    /// Enumerate the physical devices and accept the usable ones
    ///
    /// A device is accepted iff every required extension is present,
    /// timeline semaphores are supported, and the backend's own
    /// predicate passes. Returns the ids of all healthy devices, old
    /// and new, so callers can re-walk their monitors. Takes the Arc
    /// because every created Device keeps a reference to us.
    pub fn refresh_devices(instance: &Arc<Self>, backend: &dyn Backend) -> Vec<DeviceId> {
        let this = instance;
        log::debug!("Reloading devices");
        let mut ret = Vec::new();

        let mut device_extensions: Vec<CString> = vec![
            khr::swapchain::NAME.to_owned(),
            ext::swapchain_maintenance1::NAME.to_owned(),
        ];
        device_extensions.extend(backend.required_device_extensions());

        let pdevices = match unsafe { this.i_inst.enumerate_physical_devices() } {
            Ok(devs) => devs,
            Err(e) => {
                log::error!("Failed to enumerate physical devices: {:?}", e);
                return ret;
            }
        };

        for pdev in pdevices {
            let props = unsafe { this.i_inst.get_physical_device_properties(pdev) };
            let name = props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|_| String::from("unknown"));
            let id: DeviceId = props.device_id;

            if this.i_devices.lock().unwrap().contains_key(&id) {
                log::debug!("Device {} already exists", name);
                ret.push(id);
                continue;
            }

            if !this.has_extensions(pdev, &device_extensions) {
                log::warn!(
                    "{} {}",
                    name,
                    MlandError::VK_NOT_ALL_EXTENSIONS_AVAILABLE
                );
                continue;
            }
            if !backend.device_good(this, pdev) {
                continue;
            }
            if !this.has_timeline_semaphores(pdev) {
                log::debug!("Device {} does not support timeline semaphores", name);
                continue;
            }

            match Device::new(this.clone(), pdev, name.clone(), id, &device_extensions) {
                Ok(dev) => {
                    log::debug!("Created device {}", name);
                    this.i_devices.lock().unwrap().insert(id, dev);
                    ret.push(id);
                }
                Err(e) => {
                    log::error!("Failed to create device {}: {}", name, e);
                }
            }
        }

        ret
    }

    pub fn get_device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.i_devices.lock().unwrap().get(&id).cloned()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::debug!("Destroying vulkan instance");
        // devices reference the instance, they go first
        self.i_devices.lock().unwrap().clear();
        unsafe {
            if let Some((loader, messenger)) = self.i_debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.i_inst.destroy_instance(None);
        }
    }
}
