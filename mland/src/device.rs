// Vulkan device representation
//
// This stores per-GPU state: the logical device, the chosen queue
// families, the queues themselves behind their submission locks, and
// the compiled shader modules every display pipeline links against.

use ash::ext;
use ash::khr;
use ash::vk;

use crate::instance::Instance;
use crate::shaders;
use crate::{MlandError, Result};
use utils::log;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, Mutex};

pub type DeviceId = u32;

/// MephLand Device
///
/// Immutable after creation. Displays hold an Arc back to this; the
/// controller guarantees every display is joined before the instance
/// (and with it this device) is dropped.
pub struct Device {
    pub(crate) d_inst: Arc<Instance>,
    /// the physical device backing us
    pub(crate) d_pdev: vk::PhysicalDevice,
    /// the logical device we are using
    pub(crate) d_dev: ash::Device,
    pub d_id: DeviceId,
    pub d_name: String,
    /// first queue family advertising GRAPHICS|TRANSFER
    pub d_graphics_index: u32,
    /// TRANSFER family with the fewest flag bits set. Ties back to the
    /// graphics family on GPUs without a dedicated DMA queue.
    pub d_transfer_index: u32,
    /// Vulkan requires external synchronization of queue handles, so
    /// every queue lives behind a mutex. When graphics and transfer
    /// share a family there is exactly one entry, and one lock.
    d_queues: HashMap<u32, Mutex<vk::Queue>>,
    d_vert_shader: vk::ShaderModule,
    d_frag_shader: vk::ShaderModule,
    /// loads swapchain extension entry points
    pub(crate) d_swapchain_loader: khr::swapchain::Device,
    /// swapchain_maintenance1: present fences + explicit image release
    pub(crate) d_swap_maint_loader: ext::swapchain_maintenance1::Device,
}

impl Device {
    /// Pick the graphics and transfer queue families
    ///
    /// Graphics takes the first family carrying GRAPHICS|TRANSFER.
    /// Transfer prefers the family with the smallest number of flag
    /// bits that still carries TRANSFER, which lands on a dedicated
    /// DMA queue when the hardware has one.
    fn select_queue_families(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> Result<(u32, u32)> {
        let families = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        let mut graphics = None;
        let mut transfer = None;
        let mut transfer_bits = u32::MAX;

        for (index, info) in families.iter().enumerate() {
            let index = index as u32;
            let graphics_flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
            if graphics.is_none() && info.queue_flags.contains(graphics_flags) {
                log::debug!(
                    "Found graphics queue family {:?} index {}",
                    info.queue_flags,
                    index
                );
                graphics = Some(index);
            }
            let bits = info.queue_flags.as_raw().count_ones();
            if info.queue_flags.contains(vk::QueueFlags::TRANSFER) && bits < transfer_bits {
                transfer = Some(index);
                transfer_bits = bits;
            }
        }

        match (graphics, transfer) {
            (Some(g), Some(t)) => Ok((g, t)),
            _ => Err(MlandError::COULD_NOT_CREATE_DEVICE),
        }
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// One queue per chosen family is requested at priority 1.0, and
    /// the timeline semaphore feature is enabled.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_families: &[u32],
        extensions: &[CString],
    ) -> Result<ash::Device> {
        let extension_names_raw: Vec<*const i8> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut vulkan12_features =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names_raw)
            .push_next(&mut vulkan12_features);

        unsafe {
            inst.create_device(pdev, &create_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_DEVICE))
        }
    }

    pub(crate) fn new(
        instance: Arc<Instance>,
        pdev: vk::PhysicalDevice,
        name: String,
        id: DeviceId,
        extensions: &[CString],
    ) -> Result<Arc<Self>> {
        let (graphics_index, transfer_index) =
            Self::select_queue_families(&instance.i_inst, pdev)?;
        log::debug!(
            "{} Using graphics family {} transfer family {}",
            name,
            graphics_index,
            transfer_index
        );

        let mut families = vec![graphics_index];
        if transfer_index != graphics_index {
            families.push(transfer_index);
        }

        let dev = Self::create_device(&instance.i_inst, pdev, &families, extensions)?;

        let mut queues = HashMap::new();
        for &family in families.iter() {
            let queue = unsafe { dev.get_device_queue(family, 0) };
            queues.insert(family, Mutex::new(queue));
        }

        // Shaders are created eagerly, a device that cannot link the
        // fullscreen pass is useless to us
        let vert_shader = shaders::create_shader_module(&dev, &shaders::VERT_SHADER);
        let frag_shader = shaders::create_shader_module(&dev, &shaders::FRAG_SHADER);
        let (vert_shader, frag_shader) = match (vert_shader, frag_shader) {
            (Ok(v), Ok(f)) => (v, f),
            (v, f) => {
                unsafe {
                    if let Ok(v) = v {
                        dev.destroy_shader_module(v, None);
                    }
                    if let Ok(f) = f {
                        dev.destroy_shader_module(f, None);
                    }
                    dev.destroy_device(None);
                }
                return Err(MlandError::INVALID_SHADER);
            }
        };

        let swapchain_loader = khr::swapchain::Device::new(&instance.i_inst, &dev);
        let swap_maint_loader = ext::swapchain_maintenance1::Device::new(&instance.i_inst, &dev);

        Ok(Arc::new(Self {
            d_inst: instance,
            d_pdev: pdev,
            d_dev: dev,
            d_id: id,
            d_name: name,
            d_graphics_index: graphics_index,
            d_transfer_index: transfer_index,
            d_queues: queues,
            d_vert_shader: vert_shader,
            d_frag_shader: frag_shader,
            d_swapchain_loader: swapchain_loader,
            d_swap_maint_loader: swap_maint_loader,
        }))
    }

    pub(crate) fn get_vert(&self) -> vk::ShaderModule {
        self.d_vert_shader
    }

    pub(crate) fn get_frag(&self) -> vk::ShaderModule {
        self.d_frag_shader
    }

    /// returns a new vkCommandPool for `queue_family`
    ///
    /// Pools are created with individual command-buffer reset; buffers
    /// are reset at the start of each use and pools are never reset
    /// wholesale.
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.d_dev
                .create_command_pool(&pool_create_info, None)
                .or(Err(MlandError::INVALID))
        }
    }

    /// Allocate one primary command buffer from `pool`
    pub(crate) fn create_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let bufs = unsafe {
            self.d_dev
                .allocate_command_buffers(&alloc_info)
                .or(Err(MlandError::INVALID))?
        };
        Ok(bufs[0])
    }

    /// Submit to the queue of `queue_family`
    ///
    /// Holds the family's lock for the duration of the call and never
    /// waits on the GPU.
    pub(crate) fn submit(
        &self,
        queue_family: u32,
        submit_info: vk::SubmitInfo,
        fence: vk::Fence,
    ) -> Result<()> {
        let queue = self
            .d_queues
            .get(&queue_family)
            .ok_or(MlandError::INVALID)?
            .lock()
            .unwrap();

        unsafe {
            self.d_dev
                .queue_submit(*queue, &[submit_info], fence)
                .or(Err(MlandError::SUBMIT_FAILED))
        }
    }

    /// Present on the queue of `queue_family`
    ///
    /// Same serialization as submit. The raw driver result is handed
    /// back so the caller can classify OutOfDate/Suboptimal itself;
    /// Ok(true) is the suboptimal case.
    pub(crate) fn present(
        &self,
        queue_family: u32,
        present_info: &vk::PresentInfoKHR,
    ) -> std::result::Result<bool, vk::Result> {
        let queue = self
            .d_queues
            .get(&queue_family)
            .ok_or(vk::Result::ERROR_UNKNOWN)?
            .lock()
            .unwrap();

        unsafe { self.d_swapchain_loader.queue_present(*queue, present_info) }
    }

    /// Drain the queue of `queue_family`. Teardown only.
    pub(crate) fn wait_idle(&self, queue_family: u32) {
        if let Some(queue) = self.d_queues.get(&queue_family) {
            let queue = queue.lock().unwrap();
            unsafe {
                if let Err(e) = self.d_dev.queue_wait_idle(*queue) {
                    log::error!("{} Failed to wait for queue idle: {:?}", self.d_name, e);
                }
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("{} Destroying device", self.d_name);
        unsafe {
            self.d_dev.device_wait_idle().ok();
            self.d_dev.destroy_shader_module(self.d_vert_shader, None);
            self.d_dev.destroy_shader_module(self.d_frag_shader, None);
            self.d_dev.destroy_device(None);
        }
    }
}
