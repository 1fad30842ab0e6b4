// DRM device access
//
// One of these is held per /dev/dri/cardN primary node we managed to
// become DRM master on. The fd stays open (and mastered) for the
// device's whole lifetime; Vulkan leases displays from it through
// VK_EXT_acquire_drm_display.

extern crate drm;

use drm::control::{connector, Device as ControlDevice, ModeTypeFlags};
use drm::Device;

use utils::log;

use std::fs::OpenOptions;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsFd, BorrowedFd};

/// Primary-node identity: the (major, minor) pair of the device number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmId {
    pub major: u64,
    pub minor: u64,
}

/// Our DRM node accessor
///
/// This provides drm-rs with access to the DRM fd and gives us a place
/// to make calls to DRM.
pub struct DrmDevice {
    dd_fd: std::fs::File,
    dd_id: DrmId,
    dd_path: String,
    dd_master: bool,
}

/// Implementing `AsFd` is a prerequisite to implementing the traits
/// found in the drm crate. Here, we are just calling `as_fd()` on the
/// inner File.
impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.dd_fd.as_fd()
    }
}

impl Device for DrmDevice {}
impl ControlDevice for DrmDevice {}

impl DrmDevice {
    /// Open a primary node and record its (major, minor) identity
    ///
    /// Master is taken separately with become_master once the caller
    /// has decided this node is actually new to it.
    pub fn open(path: &str) -> Option<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);
        let file = match options.open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Failed to open {}: {}", path, e);
                return None;
            }
        };

        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Failed to stat {}: {}", path, e);
                return None;
            }
        };
        let id = DrmId {
            major: nix::sys::stat::major(meta.rdev()),
            minor: nix::sys::stat::minor(meta.rdev()),
        };

        Some(DrmDevice {
            dd_fd: file,
            dd_id: id,
            dd_path: path.to_string(),
            dd_master: false,
        })
    }

    /// Take DRM master on the node
    ///
    /// Fails when another compositor owns the device. Master is held
    /// until this object drops.
    pub fn become_master(&mut self) -> bool {
        if let Err(e) = self.acquire_master_lock() {
            log::warn!("Failed to set master on {}: {}", self.dd_path, e);
            return false;
        }
        log::debug!("Set master on {}", self.dd_path);
        self.dd_master = true;
        true
    }

    pub fn id(&self) -> DrmId {
        self.dd_id
    }

    pub fn path(&self) -> &str {
        &self.dd_path
    }

    pub fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.dd_fd.as_raw_fd()
    }

    /// List the ids of every connector with something plugged into it
    pub fn refresh_connectors(&self) -> Vec<u32> {
        log::debug!("Refreshing connectors for {}", self.dd_path);
        let res = match self.resource_handles() {
            Ok(res) => res,
            Err(e) => {
                log::warn!("Failed to get resources for {}: {}", self.dd_path, e);
                return Vec::new();
            }
        };

        res.connectors()
            .iter()
            .filter_map(|handle| {
                let info = match self.get_connector(*handle, false) {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!(
                            "Failed to get connector {:?} for {}: {}",
                            handle,
                            self.dd_path,
                            e
                        );
                        return None;
                    }
                };
                match info.state() {
                    connector::State::Connected => Some(u32::from(*handle)),
                    _ => None,
                }
            })
            .collect()
    }

    /// The pixel size of the connector's PREFERRED mode, if it has one
    ///
    /// The wl_output "preferred" flag is sourced from this rather than
    /// assumed, so a mode forced by configuration reports honestly.
    pub fn preferred_mode_size(&self, connector_id: u32) -> Option<(u32, u32)> {
        let res = self.resource_handles().ok()?;
        let handle = res
            .connectors()
            .iter()
            .find(|handle| u32::from(**handle) == connector_id)?;
        let info = self.get_connector(*handle, false).ok()?;

        info.modes()
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .map(|mode| {
                let (w, h) = mode.size();
                (w as u32, h as u32)
            })
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        if self.dd_master {
            log::debug!("Dropping master on {}", self.dd_path);
            self.release_master_lock().ok();
        }
    }
}
