// The wayland protocol server
//
// Runs the libwayland-equivalent event loop on its own thread: accept
// clients on the auto-bound socket, dispatch their requests, flush
// outgoing events. The render side talks to clients through the
// Output bindings, which are thread-safe, so nothing here touches
// Vulkan.

pub mod compositor;
pub mod output;

use wayland_server::{Display as WlDisplay, DisplayHandle, ListeningSocket};

use utils::fdwatch::FdWatch;
use utils::log;

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Dispatch target for every global we advertise
///
/// Per-object state lives in the resources' user data; the state
/// itself only carries the render trigger, so client activity can
/// demand frames.
pub struct WlState {
    pub ws_trigger: Arc<mland::RenderTrigger>,
}

pub struct ClientState;

impl wayland_server::backend::ClientData for ClientState {
    fn initialized(&self, _client_id: wayland_server::backend::ClientId) {}
    fn disconnected(
        &self,
        _client_id: wayland_server::backend::ClientId,
        _reason: wayland_server::backend::DisconnectReason,
    ) {
    }
}

pub struct WlServer {
    ws_dh: DisplayHandle,
    ws_socket_name: String,
    ws_stop: Arc<AtomicBool>,
    ws_stopped: Arc<AtomicBool>,
    ws_thread: Mutex<Option<thread::JoinHandle<()>>>,
    /// The protocol display is parked here when the loop exits, so the
    /// output bindings of stopping render workers still have a live
    /// backend. It dies with this struct, after every display.
    #[allow(dead_code)]
    ws_display: Arc<Mutex<Option<WlDisplay<WlState>>>>,
}

impl WlServer {
    pub fn new(trigger: Arc<mland::RenderTrigger>) -> anyhow::Result<Arc<Self>> {
        log::debug!("Creating wayland server");
        let display = WlDisplay::<WlState>::new()?;
        let dh = display.handle();

        let socket = ListeningSocket::bind_auto("wayland", 1..33)?;
        let socket_name = socket
            .socket_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let display_slot = Arc::new(Mutex::new(None));

        let thread_stop = stop.clone();
        let thread_stopped = stopped.clone();
        let thread_slot = display_slot.clone();
        let thread_name = socket_name.clone();
        let handle = thread::Builder::new()
            .name(String::from("wayland_server"))
            .spawn(move || {
                Self::run(
                    display,
                    socket,
                    thread_name,
                    trigger,
                    thread_slot,
                    thread_stop,
                    thread_stopped,
                )
            })?;

        Ok(Arc::new(Self {
            ws_dh: dh,
            ws_socket_name: socket_name,
            ws_stop: stop,
            ws_stopped: stopped,
            ws_thread: Mutex::new(Some(handle)),
            ws_display: display_slot,
        }))
    }

    fn run(
        mut display: WlDisplay<WlState>,
        socket: ListeningSocket,
        socket_name: String,
        trigger: Arc<mland::RenderTrigger>,
        display_slot: Arc<Mutex<Option<WlDisplay<WlState>>>>,
        stop: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    ) {
        log::info!("Starting wayland server on {}", socket_name);
        let mut state = WlState {
            ws_trigger: trigger,
        };
        let mut dh = display.handle();

        let socket_fd = socket.as_raw_fd();
        let display_fd = display.backend().poll_fd().as_raw_fd();
        let mut watch = FdWatch::new();
        watch.add_fd(socket_fd);
        watch.add_fd(display_fd);

        while !stop.load(Ordering::Acquire) {
            // wake on client traffic, or time out so a stop request is
            // noticed promptly
            watch.wait_for_events(Some(100));

            match socket.accept() {
                Ok(Some(stream)) => {
                    log::debug!("Client connected");
                    if let Err(e) = dh.insert_client(stream, Arc::new(ClientState)) {
                        log::error!("Failed to insert client: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to accept client: {}", e),
            }

            if let Err(e) = display.dispatch_clients(&mut state) {
                log::error!("Failed to dispatch clients: {}", e);
            }
            if let Err(e) = display.flush_clients() {
                log::error!("Failed to flush clients: {}", e);
            }
        }

        display.flush_clients().ok();
        *display_slot.lock().unwrap() = Some(display);

        log::info!("Wayland server stopped");
        stopped.store(true, Ordering::Release);
    }

    pub fn handle(&self) -> DisplayHandle {
        self.ws_dh.clone()
    }

    pub fn socket_name(&self) -> &str {
        &self.ws_socket_name
    }

    /// Ask the server loop to wind down. Safe from a signal-adjacent
    /// context: only flips the latch.
    pub fn request_stop(&self) {
        self.ws_stop.store(true, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.ws_stopped.load(Ordering::Acquire)
    }

    /// Join the server thread. Idempotent.
    pub fn wait_for_stop(&self) {
        if let Some(handle) = self.ws_thread.lock().unwrap().take() {
            handle.join().ok();
        }
    }

    /// Stop and join
    pub fn stop(&self) {
        if self.ws_stop.swap(true, Ordering::AcqRel) {
            self.wait_for_stop();
            return;
        }
        log::debug!("Stopping wayland server");
        self.wait_for_stop();
    }
}

impl Drop for WlServer {
    fn drop(&mut self) {
        log::debug!("Destroying wayland server");
        self.stop();
    }
}
