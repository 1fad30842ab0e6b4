// The MephLand display-render core
//
// This crate owns everything between a GPU and a lit monitor: instance
// and device enumeration, per-display render workers, and the global
// render trigger. It knows nothing about the Wayland protocol; the
// compositor binary plugs in through the small traits at the bottom of
// this file.

pub mod device;
pub mod display;
pub mod instance;
mod shaders;
pub mod trigger;

pub use device::{Device, DeviceId};
pub use display::state::DisplayState;
pub use display::Display;
pub use instance::Instance;
pub use trigger::RenderTrigger;

#[macro_use]
extern crate bitflags;
extern crate thiserror;

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

/// Errors of the render core
///
/// The render workers do not propagate these; they fold them into the
/// display state machine. Constructors and the enumeration path return
/// them directly.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum MlandError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("This surface no longer matches the swapchain")]
    SUBOPTIMAL,
    #[error("Vulkan surface is not supported by this device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Vulkan does not support all the required extensions")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Could not create the vulkan instance")]
    COULD_NOT_CREATE_INSTANCE,
    #[error("Could not create a logical device")]
    COULD_NOT_CREATE_DEVICE,
    #[error("Could not create a surface for this display")]
    COULD_NOT_CREATE_SURFACE,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not create an image or image view")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not create the render pipeline")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("Could not create synchronization primitives")]
    COULD_NOT_CREATE_SYNC_OBJS,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Could not record or submit a command buffer")]
    SUBMIT_FAILED,
    #[error("Presentation to this display failed")]
    PRESENT_FAILED,
    #[error("Could not load a shader module")]
    INVALID_SHADER,
    #[error("No usable DRM devices were found")]
    NO_DRM_DEVICES,
    #[error("The operation is invalid")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, MlandError>;

bitflags! {
    /// How a display is being driven
    ///
    /// HDR and the tearing modes are reserved for future extensions,
    /// the plumbing carries the flags so they do not force a redesign.
    pub struct RenderingMode: u32 {
        const DIRECT = 1 << 0;
        const HDR = 1 << 1;
        const TEARING_FULLSCREEN = 1 << 2;
    }
}

/// Static description of one output, consumed by the protocol layer
#[derive(Debug, Clone)]
pub struct OutputParams {
    pub op_make: String,
    pub op_model: String,
    /// Physical size in millimeters
    pub op_phys_size: (u32, u32),
    /// Refresh rate in mHz
    pub op_refresh_mhz: u32,
    /// True iff the driven mode is the output's preferred mode,
    /// sourced from the DRM mode flags
    pub op_preferred: bool,
}

/// The backend-specific half of display enumeration
///
/// A backend owns the OS resources needed to put pixels somewhere: the
/// DRM inventory under master, or a set of SDL windows. It is driven
/// from the controller thread only and does not need to be Send.
pub trait Backend {
    /// Instance extensions this backend needs on top of the universal
    /// surface set
    fn required_instance_extensions(&self) -> Vec<CString>;

    /// Device extensions on top of swapchain + swapchain_maintenance1
    fn required_device_extensions(&self) -> Vec<CString>;

    /// Re-scan the OS-level inventory (DRM nodes, windows)
    fn refresh(&mut self) {}

    /// Whether this physical device can present for this backend
    fn device_good(&self, inst: &Instance, pdev: vk::PhysicalDevice) -> bool;

    /// Produce displays for outputs of `dev` that are not yet driven
    fn update_monitors(
        &mut self,
        dev: &Arc<Device>,
        trigger: &Arc<RenderTrigger>,
    ) -> Vec<Arc<Display>>;

    /// Pump backend events. Returning false requests compositor
    /// shutdown (window closed, quit key).
    fn poll_events(&mut self) -> bool {
        true
    }
}

/// The two hooks the render core needs from its surface factory
pub trait SurfaceProvider: Send {
    /// Populate and return the display's surface handle
    fn create_surface(&mut self, dev: &Device) -> Result<vk::SurfaceKHR>;

    /// Release the surface. May be called multiple times.
    fn delete_surface(&mut self, dev: &Device);

    fn output_params(&self) -> OutputParams;
}

/// Receiver for swapchain extent changes, implemented by the wl_output
/// binding in the compositor binary
pub trait OutputSink: Send + Sync {
    fn update_extent(&self, width: u32, height: u32);
}
