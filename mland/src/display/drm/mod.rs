// The DRM direct-mode backend
//
// Presents straight to the hardware: every /dev/dri/card* node we can
// master goes into the inventory, physical devices are matched to
// nodes by their primary (major, minor), and displays are leased from
// the kernel through VK_EXT_acquire_drm_display.

pub mod drm_device;

use ash::ext;
use ash::khr;
use ash::vk;

use crate::device::Device;
use crate::display::Display;
use crate::instance::Instance;
use crate::trigger::RenderTrigger;
use crate::{
    Backend, MlandError, OutputParams, RenderingMode, Result, SurfaceProvider,
};
pub use drm_device::{DrmDevice, DrmId};
use utils::log;

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Weak};

/// User-specified DRM node selection, from MLAND_DRM_DEVICES
///
/// A non-empty include list overrides everything; otherwise the scan
/// of /dev/dri minus the exclude list is used.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrmPaths {
    pub dp_explicit_include: Vec<String>,
    pub dp_explicit_exclude: Vec<String>,
}

pub struct DrmBackend {
    db_paths: DrmPaths,
    /// Mastered primary nodes, by device-number identity
    db_devices: HashMap<DrmId, Arc<DrmDevice>>,
    /// Connectors that already have a display driving them
    db_connectors: HashMap<(DrmId, u32), Weak<Display>>,
}

impl DrmBackend {
    /// Build the backend and take master on the configured nodes
    ///
    /// An empty inventory is fatal here; main falls back to the
    /// windowed backend in that case.
    pub fn new(paths: DrmPaths) -> Result<Self> {
        let mut ret = Self {
            db_paths: paths,
            db_devices: HashMap::new(),
            db_connectors: HashMap::new(),
        };
        ret.refresh_inventory();
        if ret.db_devices.is_empty() {
            return Err(MlandError::NO_DRM_DEVICES);
        }
        Ok(ret)
    }

    /// All card nodes under /dev/dri
    fn list_drm_devices() -> Vec<String> {
        let mut devices = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/dev/dri") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("card") {
                    devices.push(format!("/dev/dri/{}", name));
                }
            }
        }
        devices.sort();
        devices
    }

    fn refresh_inventory(&mut self) {
        let paths = if !self.db_paths.dp_explicit_include.is_empty() {
            self.db_paths.dp_explicit_include.clone()
        } else {
            Self::list_drm_devices()
                .into_iter()
                .filter(|path| !self.db_paths.dp_explicit_exclude.contains(path))
                .collect()
        };

        for path in paths {
            if path.is_empty() {
                continue;
            }
            let mut dev = match DrmDevice::open(&path) {
                Some(dev) => dev,
                None => continue,
            };
            if self.db_devices.contains_key(&dev.id()) {
                log::debug!("Device {} already exists", path);
                continue;
            }
            if !dev.become_master() {
                continue;
            }
            self.db_devices.insert(dev.id(), Arc::new(dev));
        }
    }

    /// The primary node identity Vulkan reports for this GPU
    fn primary_node_id(inst: &Instance, pdev: vk::PhysicalDevice) -> Option<DrmId> {
        let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
        let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut drm_props);
        unsafe { inst.i_inst.get_physical_device_properties2(pdev, &mut props) };

        if drm_props.has_primary == vk::FALSE {
            log::debug!("Device does not have a primary node");
            return None;
        }
        Some(DrmId {
            major: drm_props.primary_major as u64,
            minor: drm_props.primary_minor as u64,
        })
    }

    /// Lease one connector from the kernel and spin up a display on it
    fn create_drm_display(
        &self,
        dev: &Arc<Device>,
        trigger: &Arc<RenderTrigger>,
        drm_dev: &Arc<DrmDevice>,
        display_loader: &khr::display::Instance,
        acquire_loader: &ext::acquire_drm_display::Instance,
        connector: u32,
    ) -> Result<Arc<Display>> {
        let pdev = dev.d_pdev;
        let fd = drm_dev.raw_fd();

        let display = unsafe { acquire_loader.get_drm_display(pdev, fd, connector) }
            .or(Err(MlandError::COULD_NOT_CREATE_SURFACE))?;
        unsafe { acquire_loader.acquire_drm_display(pdev, fd, display) }
            .or(Err(MlandError::COULD_NOT_CREATE_SURFACE))?;

        let all_props = unsafe {
            display_loader
                .get_physical_device_display_properties(pdev)
                .or(Err(MlandError::INVALID))?
        };
        let props = all_props
            .iter()
            .find(|prop| prop.display == display)
            .ok_or(MlandError::INVALID)?;

        let display_name = if props.display_name.is_null() {
            String::from("display")
        } else {
            unsafe { CStr::from_ptr(props.display_name) }
                .to_string_lossy()
                .into_owned()
        };
        let phys_size = props.physical_dimensions;
        let native_res = props.physical_resolution;

        // The mode to drive: native resolution at the highest refresh
        let modes = unsafe {
            display_loader
                .get_display_mode_properties(pdev, display)
                .or(Err(MlandError::INVALID))?
        };
        let mut best: Option<vk::DisplayModePropertiesKHR> = None;
        for mode in modes.iter() {
            let params = mode.parameters;
            log::debug!(
                "{} Found mode: {} Hz, {}x{}",
                display_name,
                params.refresh_rate as f64 / 1000.0,
                params.visible_region.width,
                params.visible_region.height
            );
            if params.visible_region.width != native_res.width
                || params.visible_region.height != native_res.height
            {
                continue;
            }
            if best
                .as_ref()
                .map(|b| params.refresh_rate > b.parameters.refresh_rate)
                .unwrap_or(true)
            {
                best = Some(*mode);
            }
        }
        let mode = best
            .or_else(|| modes.first().cloned())
            .ok_or(MlandError::INVALID)?;
        log::info!(
            "{} Best mode: {} Hz, {}x{}",
            display_name,
            mode.parameters.refresh_rate as f64 / 1000.0,
            mode.parameters.visible_region.width,
            mode.parameters.visible_region.height
        );

        let preferred = drm_dev
            .preferred_mode_size(connector)
            .map(|(w, h)| {
                w == mode.parameters.visible_region.width
                    && h == mode.parameters.visible_region.height
            })
            .unwrap_or(false);

        let name = format!("{} {}", dev.d_name, display_name);
        let params = OutputParams {
            op_make: dev.d_name.clone(),
            op_model: display_name,
            op_phys_size: (phys_size.width, phys_size.height),
            op_refresh_mhz: mode.parameters.refresh_rate,
            op_preferred: preferred,
        };
        let provider = DrmSurfaceProvider {
            sp_drm: drm_dev.clone(),
            sp_connector: connector,
            sp_display: display,
            sp_display_loader: display_loader.clone(),
            sp_mode: mode,
            sp_params: params,
            sp_surface: vk::SurfaceKHR::null(),
        };

        Display::new(
            name,
            dev.clone(),
            trigger.clone(),
            Box::new(provider),
            RenderingMode::DIRECT,
        )
    }
}

impl Backend for DrmBackend {
    fn required_instance_extensions(&self) -> Vec<CString> {
        vec![
            khr::display::NAME.to_owned(),
            ext::direct_mode_display::NAME.to_owned(),
            ext::acquire_drm_display::NAME.to_owned(),
        ]
    }

    fn required_device_extensions(&self) -> Vec<CString> {
        vec![ext::physical_device_drm::NAME.to_owned()]
    }

    fn refresh(&mut self) {
        self.refresh_inventory();
        self.db_connectors
            .retain(|_, weak| weak.upgrade().is_some());
    }

    /// A device is good iff its primary node is one we hold master on
    fn device_good(&self, inst: &Instance, pdev: vk::PhysicalDevice) -> bool {
        let id = match Self::primary_node_id(inst, pdev) {
            Some(id) => id,
            None => return false,
        };
        match self.db_devices.contains_key(&id) {
            true => {
                log::debug!("Found matching DRM device");
                true
            }
            false => {
                log::info!("No matching DRM device");
                false
            }
        }
    }

    fn update_monitors(
        &mut self,
        dev: &Arc<Device>,
        trigger: &Arc<RenderTrigger>,
    ) -> Vec<Arc<Display>> {
        log::debug!("Updating monitors for device {}", dev.d_name);
        let inst = &dev.d_inst;

        let id = match Self::primary_node_id(inst, dev.d_pdev) {
            Some(id) => id,
            None => return Vec::new(),
        };
        let drm_dev = match self.db_devices.get(&id) {
            Some(drm_dev) => drm_dev.clone(),
            None => return Vec::new(),
        };

        let display_loader = khr::display::Instance::new(&inst.i_entry, &inst.i_inst);
        let acquire_loader =
            ext::acquire_drm_display::Instance::new(&inst.i_entry, &inst.i_inst);

        let mut ret = Vec::new();
        for connector in drm_dev.refresh_connectors() {
            if let Some(weak) = self.db_connectors.get(&(id, connector)) {
                if weak.upgrade().is_some() {
                    log::debug!(
                        "{} Already have display for connector {}",
                        dev.d_name,
                        connector
                    );
                    continue;
                }
            }

            match self.create_drm_display(
                dev,
                trigger,
                &drm_dev,
                &display_loader,
                &acquire_loader,
                connector,
            ) {
                Ok(display) => {
                    log::info!("{} Found display for connector {}", dev.d_name, connector);
                    self.db_connectors
                        .insert((id, connector), Arc::downgrade(&display));
                    ret.push(display);
                }
                Err(e) => {
                    log::error!(
                        "{} Failed to get display for connector {}: {}",
                        dev.d_name,
                        connector,
                        e
                    );
                }
            }
        }
        ret
    }
}

/// Surface factory for a leased DRM display
///
/// Creates a DisplayPlaneSurface on plane 0 for the chosen mode. Holds
/// its DrmDevice alive so master is not dropped while the display is
/// still presenting.
pub struct DrmSurfaceProvider {
    #[allow(dead_code)]
    sp_drm: Arc<DrmDevice>,
    sp_connector: u32,
    sp_display: vk::DisplayKHR,
    sp_display_loader: khr::display::Instance,
    sp_mode: vk::DisplayModePropertiesKHR,
    sp_params: OutputParams,
    sp_surface: vk::SurfaceKHR,
}

impl SurfaceProvider for DrmSurfaceProvider {
    fn create_surface(&mut self, dev: &Device) -> Result<vk::SurfaceKHR> {
        log::debug!(
            "{} Creating surface for connector {}",
            dev.d_name,
            self.sp_connector
        );
        self.delete_surface(dev);

        let surface_info = vk::DisplaySurfaceCreateInfoKHR::default()
            .display_mode(self.sp_mode.display_mode)
            .plane_index(0)
            .plane_stack_index(0)
            .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::PER_PIXEL)
            .image_extent(self.sp_mode.parameters.visible_region);

        let surface = unsafe {
            self.sp_display_loader
                .create_display_plane_surface(&surface_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_SURFACE))?
        };
        self.sp_surface = surface;
        Ok(surface)
    }

    fn delete_surface(&mut self, dev: &Device) {
        if self.sp_surface != vk::SurfaceKHR::null() {
            unsafe {
                dev.d_inst
                    .i_surface_loader
                    .destroy_surface(self.sp_surface, None);
            }
            self.sp_surface = vk::SurfaceKHR::null();
        }
    }

    fn output_params(&self) -> OutputParams {
        self.sp_params.clone()
    }
}
