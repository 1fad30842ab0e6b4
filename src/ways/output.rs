// The wl_output binding
//
// One global per display. Clients that bind get the full burst
// (geometry, mode, name, done); when the render worker rebuilds its
// swapchain the new extent goes out as geometry + done to every bound
// client. The render thread reaches us through mland's OutputSink
// seam, so everything in here has to be thread-safe.

use wayland_server::protocol::wl_output;
use wayland_server::Resource;

use crate::ways::{WlServer, WlState};
use mland::{Display, OutputSink};
use utils::log;

use std::sync::{Arc, Mutex};

/// The per-display output global
pub struct Output {
    o_dh: wayland_server::DisplayHandle,
    o_global: wayland_server::backend::GlobalId,
    o_inner: Arc<OutputInner>,
}

/// Shared between the dispatch machinery (server thread) and the
/// render worker (extent updates)
pub struct OutputInner {
    oi_name: String,
    oi_make: String,
    oi_model: String,
    /// physical size in millimeters
    oi_phys_size: (u32, u32),
    oi_refresh_mhz: u32,
    oi_preferred: bool,
    oi_extent: Mutex<(u32, u32)>,
    /// every wl_output resource currently bound by a client
    oi_clients: Mutex<Vec<wl_output::WlOutput>>,
    oi_dh: wayland_server::DisplayHandle,
}

/// Compose the wl_output.mode flags: always current, preferred iff the
/// driven mode really is the output's preferred one
pub fn mode_flags(preferred: bool) -> wl_output::Mode {
    match preferred {
        true => wl_output::Mode::Current | wl_output::Mode::Preferred,
        false => wl_output::Mode::Current,
    }
}

impl Output {
    /// Publish a wl_output global describing `display`
    pub fn new(server: &WlServer, display: &Display) -> Arc<Self> {
        let params = display.output_params();
        let dh = server.handle();
        let inner = Arc::new(OutputInner {
            oi_name: display.name().to_string(),
            oi_make: params.op_make.clone(),
            oi_model: params.op_model.clone(),
            oi_phys_size: params.op_phys_size,
            oi_refresh_mhz: params.op_refresh_mhz,
            oi_preferred: params.op_preferred,
            oi_extent: Mutex::new(display.current_extent()),
            oi_clients: Mutex::new(Vec::new()),
            oi_dh: dh.clone(),
        });

        let global = dh.create_global::<WlState, wl_output::WlOutput, Arc<OutputInner>>(
            4,
            inner.clone(),
        );

        Arc::new(Self {
            o_dh: dh,
            o_global: global,
            o_inner: inner,
        })
    }
}

impl OutputSink for Output {
    fn update_extent(&self, width: u32, height: u32) {
        self.o_inner.update_extent(width, height);
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        log::debug!("{} Removing output global", self.o_inner.oi_name);
        self.o_dh.remove_global::<WlState>(self.o_global.clone());
    }
}

impl OutputInner {
    /// geometry carries the pixel extent and the physical dimensions
    fn send_geometry(&self, output: &wl_output::WlOutput) {
        let extent = *self.oi_extent.lock().unwrap();
        output.geometry(
            extent.0 as i32,
            extent.1 as i32,
            self.oi_phys_size.0 as i32,
            self.oi_phys_size.1 as i32,
            wl_output::Subpixel::Unknown,
            self.oi_make.clone(),
            self.oi_model.clone(),
            wl_output::Transform::Normal,
        );
    }

    fn send_mode(&self, output: &wl_output::WlOutput) {
        let extent = *self.oi_extent.lock().unwrap();
        output.mode(
            mode_flags(self.oi_preferred),
            extent.0 as i32,
            extent.1 as i32,
            self.oi_refresh_mhz as i32,
        );
    }

    /// The initial burst for a fresh binding
    fn send_all(&self, output: &wl_output::WlOutput) {
        self.send_geometry(output);
        self.send_mode(output);
        if output.version() >= 4 {
            output.name(self.oi_name.clone());
        }
        output.done();
    }

    /// Re-announce the geometry after a swapchain rebuild
    fn update_extent(&self, width: u32, height: u32) {
        *self.oi_extent.lock().unwrap() = (width, height);
        let clients = self.oi_clients.lock().unwrap();
        for output in clients.iter() {
            self.send_geometry(output);
            output.done();
        }
        drop(clients);
        self.oi_dh.clone().flush_clients().ok();
    }
}

impl wayland_server::GlobalDispatch<wl_output::WlOutput, Arc<OutputInner>> for WlState {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_output::WlOutput>,
        global_data: &Arc<OutputInner>,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        log::debug!("{} Binding output", global_data.oi_name);
        let output = data_init.init(resource, global_data.clone());
        global_data.send_all(&output);
        global_data.oi_clients.lock().unwrap().push(output);
    }
}

impl wayland_server::Dispatch<wl_output::WlOutput, Arc<OutputInner>> for WlState {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_output::WlOutput,
        _request: wl_output::Request,
        _data: &Arc<OutputInner>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        // the only request, release, is a destructor; the destroyed
        // callback below does the bookkeeping
    }

    fn destroyed(
        _state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_output::WlOutput,
        data: &Arc<OutputInner>,
    ) {
        data.oi_clients
            .lock()
            .unwrap()
            .retain(|output| output != resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags_carry_current_and_preferred() {
        assert_eq!(mode_flags(false).bits(), 0x1);
        assert_eq!(mode_flags(true).bits(), 0x3);
    }
}
