// The wl_compositor global
//
// Clients need wl_compositor to exist before they will do anything
// interesting. Surfaces created through it are accepted and tracked by
// the protocol machinery but not yet composited; frame callbacks are
// answered immediately so well-behaved clients keep running.

use wayland_server::protocol::{wl_callback, wl_compositor, wl_region, wl_surface};

use crate::ways::{WlServer, WlState};
use utils::log;
use utils::timing::get_current_millis;

/// Advertise wl_compositor
pub fn create_global(server: &WlServer) {
    log::debug!("Creating compositor global");
    server
        .handle()
        .create_global::<WlState, wl_compositor::WlCompositor, ()>(6, ());
}

impl wayland_server::GlobalDispatch<wl_compositor::WlCompositor, ()> for WlState {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        log::debug!("Binding compositor");
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_compositor::WlCompositor, ()> for WlState {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                log::debug!("Creating surface");
                data_init.init(id, ());
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, ());
            }
            _ => {}
        }
    }
}

impl wayland_server::Dispatch<wl_surface::WlSurface, ()> for WlState {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            // surface contents are not composited yet, but frame
            // callbacks must fire or clients stall
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                callback.done(get_current_millis() as u32);
            }
            // committed content is what demands a new frame
            wl_surface::Request::Commit => {
                state.ws_trigger.request_render();
            }
            _ => {}
        }
    }
}

impl wayland_server::Dispatch<wl_region::WlRegion, ()> for WlState {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_region::WlRegion,
        _request: wl_region::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

impl wayland_server::Dispatch<wl_callback::WlCallback, ()> for WlState {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
