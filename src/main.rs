// MephLand: a wayland compositor that drives displays straight through
// the vulkan presentation stack
mod controller;
mod env;
mod ways;

use controller::Controller;
use mland::display::drm::DrmBackend;
use mland::display::sdl::SdlBackend;
use mland::{Backend, Instance, RenderTrigger};
use utils::log;
use ways::WlServer;

use std::sync::Arc;

fn main() {
    // a bad log level is a configuration error, not a default
    if let Err(e) = env::get_log_level() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    log::info!("Starting MephLand compositor");
    let validation = env::get_validation_layers();

    let backend: Box<dyn Backend> = match DrmBackend::new(env::get_drm_paths()) {
        Ok(drm) => Box::new(drm),
        Err(e) => {
            log::error!("Failed to create DRM backend: {}", e);
            log::info!("Falling back to SDL backend");
            match SdlBackend::new(env::get_max_windows()) {
                Ok(sdl) => Box::new(sdl),
                Err(e) => {
                    log::error!("Failed to create SDL backend: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    let instance = match Instance::new(backend.as_ref(), validation) {
        Ok(instance) => instance,
        Err(e) => {
            log::error!("Failed to create vulkan instance: {}", e);
            std::process::exit(1);
        }
    };

    let trigger = Arc::new(RenderTrigger::new());
    let server = match WlServer::new(trigger.clone()) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to create wayland server: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Wayland socket: {}", server.socket_name());

    let mut controller = Controller::new(backend, instance, server, trigger);
    controller.run();
}
