// Helper class for watching file descriptors
//
// The Wayland server loop blocks here on its listening socket and the
// display's poll fd, waking on client traffic or after a timeout so it
// can notice a stop request.
extern crate nix;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use std::os::unix::io::{BorrowedFd, RawFd};

// A file descriptor watcher
//
// The fds registered here are borrowed, not owned. The caller is
// responsible for keeping them open for the lifetime of the watcher.
pub struct FdWatch {
    // Fds to watch for readability
    fdw_fds: Vec<RawFd>,
}

impl FdWatch {
    pub fn new() -> FdWatch {
        FdWatch { fdw_fds: Vec::new() }
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_fds.push(fd);
    }

    // Wait for one of the fds to become readable. Timeout is in ms,
    // None blocks forever. Returns true if any fd is ready.
    pub fn wait_for_events(&mut self, timeout: Option<u16>) -> bool {
        // The raw fds outlive this call, see above
        let borrowed: Vec<BorrowedFd> = self
            .fdw_fds
            .iter()
            .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut pollfds: Vec<PollFd> = borrowed
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        let timeout = match timeout {
            Some(ms) => PollTimeout::from(ms),
            None => PollTimeout::NONE,
        };

        match poll(&mut pollfds, timeout) {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn wakes_on_readable_fd() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(reader.as_raw_fd());

        writer.write_all(b"x").unwrap();
        assert!(watch.wait_for_events(Some(1000)));
    }

    #[test]
    fn times_out_on_idle_fd() {
        let (_writer, reader) = UnixStream::pair().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(reader.as_raw_fd());

        let start = Instant::now();
        assert!(!watch.wait_for_events(Some(50)));
        assert!(start.elapsed().as_millis() >= 50);
    }
}
