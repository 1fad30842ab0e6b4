// The controller
//
// Owns the backend, the vulkan instance, the render trigger, the
// display collection, and the wayland server; glues their lifecycles
// together. Runs on the main thread, which is also where signals land.

use crate::ways::output::Output;
use crate::ways::{compositor, WlServer};
use mland::{Backend, Display, Instance, RenderTrigger};
use utils::log;

use nix::sys::signal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Set from the signal handler, observed by the run loop. A handler
/// can do nothing more than flip this.
static STOP_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: i32) {
    STOP_SIGNAL.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    let handler = signal::SigHandler::Handler(handle_signal);
    unsafe {
        signal::signal(signal::Signal::SIGINT, handler).ok();
        signal::signal(signal::Signal::SIGTERM, handler).ok();
    }
}

pub struct Controller {
    /// declared before the instance so the displays drop first
    c_displays: Mutex<Vec<Arc<Display>>>,
    c_backend: Box<dyn Backend>,
    c_instance: Arc<Instance>,
    c_trigger: Arc<RenderTrigger>,
    c_server: Arc<WlServer>,
}

impl Controller {
    pub fn new(
        backend: Box<dyn Backend>,
        instance: Arc<Instance>,
        server: Arc<WlServer>,
        trigger: Arc<RenderTrigger>,
    ) -> Self {
        log::debug!("Controller created");
        Self {
            c_displays: Mutex::new(Vec::new()),
            c_backend: backend,
            c_instance: instance,
            c_trigger: trigger,
            c_server: server,
        }
    }

    /// Re-walk devices and outputs
    ///
    /// Displays that went unhealthy are dropped (stopping and joining
    /// their workers); every new healthy display is bound to the
    /// protocol server and added to the collection.
    pub fn refresh_monitors(&mut self) {
        log::debug!("Refreshing monitors");
        {
            let mut displays = self.c_displays.lock().unwrap();
            displays.retain(|display| display.is_good());
        }

        self.c_backend.refresh();
        let mut bound = 0;
        for id in Instance::refresh_devices(&self.c_instance, self.c_backend.as_ref()) {
            let dev = match self.c_instance.get_device(id) {
                Some(dev) => dev,
                None => continue,
            };
            for display in self.c_backend.update_monitors(&dev, &self.c_trigger) {
                if !display.is_good() {
                    continue;
                }
                let output = Output::new(&self.c_server, &display);
                display.bind_output(output);
                self.c_displays.lock().unwrap().push(display);
                bound += 1;
            }
        }

        if bound > 0 {
            // light up the new outputs now instead of at the deadline
            self.request_render();
        }
    }

    /// Ask every display for one frame
    pub fn request_render(&self) {
        log::debug!("Requesting render");
        self.c_trigger.request_render();
    }

    /// Main loop: babysit the server, the backend event pump, and the
    /// signal latch until shutdown
    pub fn run(&mut self) {
        log::debug!("Running controller");
        install_signal_handlers();

        compositor::create_global(&self.c_server);
        self.refresh_monitors();
        self.c_trigger
            .set_max_time_between_frames(Duration::from_millis(50));

        log::debug!("Starting server");
        while !self.c_server.stopped() {
            if STOP_SIGNAL.swap(false, Ordering::AcqRel) {
                log::info!("Caught stop signal, stopping server");
                self.c_server.request_stop();
            }
            if !self.c_backend.poll_events() {
                self.c_server.request_stop();
            }
            thread::sleep(Duration::from_millis(100));
        }
        self.c_server.wait_for_stop();

        self.stop();
    }

    /// Tear down: server first, then every display (joined), leaving
    /// the instance to drop last
    pub fn stop(&mut self) {
        log::debug!("Stopping controller");
        self.c_server.stop();

        let displays: Vec<Arc<Display>> =
            self.c_displays.lock().unwrap().drain(..).collect();
        for display in displays {
            display.stop();
        }
    }
}
