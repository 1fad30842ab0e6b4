// The SDL windowed backend
//
// The fallback presentation path when no DRM node can be acquired:
// each display is an ordinary window. SDL's types must stay on the
// thread that initialized the video subsystem, so surfaces are created
// here on the controller thread and handed to the workers fully
// formed.

extern crate sdl2;

use ash::vk;
use sdl2::event::{Event, WindowEvent};

use crate::device::Device;
use crate::display::Display;
use crate::trigger::RenderTrigger;
use crate::{
    Backend, Instance, MlandError, OutputParams, RenderingMode, Result, SurfaceProvider,
};
use utils::log;

use std::ffi::CString;
use std::sync::{Arc, Weak};

const WINDOW_NAME: &str = "MephLand Compositor";
const WINDOW_WIDTH: u32 = 800;
const WINDOW_HEIGHT: u32 = 600;
/// Windows have no modeline to report, pretend 60 Hz
const WINDOW_REFRESH_MHZ: u32 = 60_000;

pub struct SdlBackend {
    /// Keep the contexts alive for as long as the windows are up
    #[allow(dead_code)]
    sb_sdl: sdl2::Sdl,
    #[allow(dead_code)]
    sb_video: sdl2::VideoSubsystem,
    sb_event_pump: sdl2::EventPump,
    sb_windows: Vec<sdl2::video::Window>,
    /// Display driving each window, if one exists
    sb_displays: Vec<Weak<Display>>,
    sb_display_count: u32,
}

impl SdlBackend {
    pub fn new(max_windows: u32) -> Result<Self> {
        log::debug!("Creating SDL backend");
        let sdl = sdl2::init().map_err(|e| {
            log::error!("Failed to create SDL backend: {}", e);
            MlandError::INVALID
        })?;
        let video = sdl.video().map_err(|e| {
            log::error!("Failed to init SDL video: {}", e);
            MlandError::INVALID
        })?;
        let event_pump = sdl.event_pump().or(Err(MlandError::INVALID))?;

        let mut windows = Vec::new();
        for _ in 0..max_windows.max(1) {
            let window = video
                .window(WINDOW_NAME, WINDOW_WIDTH, WINDOW_HEIGHT)
                .vulkan()
                .resizable()
                .build()
                .map_err(|e| {
                    log::error!("Failed to create window: {}", e);
                    MlandError::INVALID
                })?;
            windows.push(window);
        }
        let count = windows.len();

        Ok(Self {
            sb_sdl: sdl,
            sb_video: video,
            sb_event_pump: event_pump,
            sb_windows: windows,
            sb_displays: vec![Weak::new(); count],
            sb_display_count: 0,
        })
    }

    fn create_window_surface(
        window: &sdl2::video::Window,
        inst: &Instance,
    ) -> Result<vk::SurfaceKHR> {
        use vk::Handle;

        // we need to convert our ash instance into the raw vk instance
        // pointer SDL expects
        let raw_surf = window
            .vulkan_create_surface(inst.i_inst.handle().as_raw() as usize)
            .map_err(|e| {
                log::error!("SDL vulkan_create_surface failed: {}", e);
                MlandError::COULD_NOT_CREATE_SURFACE
            })?;

        Ok(vk::SurfaceKHR::from_raw(raw_surf))
    }
}

impl Backend for SdlBackend {
    fn required_instance_extensions(&self) -> Vec<CString> {
        let exts = match self.sb_windows.first() {
            Some(window) => window.vulkan_instance_extensions().unwrap_or_default(),
            None => Vec::new(),
        };
        exts.into_iter()
            .map(|ext| CString::new(ext).unwrap())
            .collect()
    }

    fn required_device_extensions(&self) -> Vec<CString> {
        Vec::new()
    }

    fn device_good(&self, _inst: &Instance, _pdev: vk::PhysicalDevice) -> bool {
        true
    }

    fn update_monitors(
        &mut self,
        dev: &Arc<Device>,
        trigger: &Arc<RenderTrigger>,
    ) -> Vec<Arc<Display>> {
        log::debug!("Updating monitors for device {}", dev.d_name);
        let mut ret = Vec::new();

        for index in 0..self.sb_windows.len() {
            if self.sb_displays[index].upgrade().is_some() {
                continue;
            }

            let surface =
                match Self::create_window_surface(&self.sb_windows[index], &dev.d_inst) {
                    Ok(surface) => surface,
                    Err(e) => {
                        log::error!("{} Failed to create window surface: {}", dev.d_name, e);
                        continue;
                    }
                };

            let name = format!("SdlDisplay {}", self.sb_display_count);
            self.sb_display_count += 1;

            let provider = SdlSurfaceProvider {
                sp_surface: surface,
                sp_params: OutputParams {
                    op_make: String::from("MephLand"),
                    op_model: String::from("SDL Window"),
                    op_phys_size: (0, 0),
                    op_refresh_mhz: WINDOW_REFRESH_MHZ,
                    op_preferred: false,
                },
            };

            match Display::new(
                name,
                dev.clone(),
                trigger.clone(),
                Box::new(provider),
                RenderingMode::empty(),
            ) {
                Ok(display) => {
                    self.sb_displays[index] = Arc::downgrade(&display);
                    ret.push(display);
                }
                Err(e) => log::error!("{} Failed to start display: {}", dev.d_name, e),
            }
        }

        ret
    }

    /// Pump the SDL event queue. A quit event or a window close asks
    /// the whole compositor to stop.
    fn poll_events(&mut self) -> bool {
        while let Some(event) = self.sb_event_pump.poll_event() {
            match event {
                Event::Quit { .. }
                | Event::Window {
                    win_event: WindowEvent::Close,
                    ..
                } => {
                    log::info!("Received quit event");
                    return false;
                }
                _ => {}
            }
        }
        true
    }
}

/// Wraps a surface pre-created from an SDL window
///
/// The window itself cannot leave the controller thread, so by the
/// time the render worker asks, the surface already exists.
pub struct SdlSurfaceProvider {
    sp_surface: vk::SurfaceKHR,
    sp_params: OutputParams,
}

impl SurfaceProvider for SdlSurfaceProvider {
    fn create_surface(&mut self, _dev: &Device) -> Result<vk::SurfaceKHR> {
        match self.sp_surface {
            surface if surface != vk::SurfaceKHR::null() => Ok(surface),
            _ => Err(MlandError::COULD_NOT_CREATE_SURFACE),
        }
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
