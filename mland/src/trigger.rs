// The global render trigger
//
// Demand-driven frames are fanned out from here. Every display worker
// parks on the counting semaphore with a deadline; request_render
// releases exactly as many permits as there are displays that have
// declared themselves idle since the last call, so one call produces at
// most one frame per display.
//
// No display-owned primitive is ever shared through this object, so a
// display can tear down at any point without another thread holding its
// synchronization state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Permit cap. Stops a pathological release loop from winding the
/// counter up unboundedly; surplus permits drain as no-op wake-ups.
const MAX_PERMITS: u32 = u8::MAX as u32;

const DEFAULT_MAX_TIME_BETWEEN_FRAMES_MS: u64 = 500;

pub struct RenderTrigger {
    /// Counting semaphore: permit count + wake-up
    rt_permits: Mutex<u32>,
    rt_cond: Condvar,
    /// Displays that went idle after a demand-driven frame
    rt_ready_displays: AtomicU32,
    /// Deadline for the periodic frame, in milliseconds
    rt_max_time_between_frames: AtomicU64,
}

impl RenderTrigger {
    pub fn new() -> Self {
        Self {
            rt_permits: Mutex::new(0),
            rt_cond: Condvar::new(),
            rt_ready_displays: AtomicU32::new(0),
            rt_max_time_between_frames: AtomicU64::new(DEFAULT_MAX_TIME_BETWEEN_FRAMES_MS),
        }
    }

    fn release(&self, count: u32) {
        if count == 0 {
            return;
        }
        let mut permits = self.rt_permits.lock().unwrap();
        *permits = (*permits + count).min(MAX_PERMITS);
        self.rt_cond.notify_all();
    }

    /// Wake every display that is waiting for work
    ///
    /// Releases one permit per registered idle display and resets the
    /// count, so a burst of calls cannot over-permit.
    pub fn request_render(&self) {
        let ready = self.rt_ready_displays.swap(0, Ordering::AcqRel);
        self.release(ready);
    }

    /// Declare this display idle-waiting
    ///
    /// Called by a worker right before it parks, iff its previous
    /// wake-up was demand-driven rather than a deadline.
    pub fn register_ready(&self) {
        self.rt_ready_displays.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a single permit
    ///
    /// Used to break a peer out of a fence wait during stop or a
    /// busy-slot drain. Not tied to the ready count.
    pub fn pulse(&self) {
        self.release(1);
    }

    /// Take one permit, or time out at `deadline`
    ///
    /// Returns true for a demand-driven wake-up, false for a deadline.
    pub fn acquire_until(&self, deadline: Instant) -> bool {
        let mut permits = self.rt_permits.lock().unwrap();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .rt_cond
                .wait_timeout(permits, deadline - now)
                .unwrap();
            permits = guard;
        }
    }

    pub fn max_time_between_frames(&self) -> Duration {
        Duration::from_millis(self.rt_max_time_between_frames.load(Ordering::Acquire))
    }

    pub fn set_max_time_between_frames(&self, dur: Duration) {
        self.rt_max_time_between_frames
            .store(dur.as_millis() as u64, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired() -> Instant {
        Instant::now()
    }

    #[test]
    fn one_wakeup_per_ready_display() {
        let trigger = RenderTrigger::new();
        // Two displays park
        trigger.register_ready();
        trigger.register_ready();

        trigger.request_render();
        assert!(trigger.acquire_until(expired()));
        assert!(trigger.acquire_until(expired()));
        // No third permit for two displays
        assert!(!trigger.acquire_until(expired()));

        // A second request with no new ready displays is a no-op
        trigger.request_render();
        assert!(!trigger.acquire_until(expired()));
    }

    #[test]
    fn deadline_wakeup_reports_timeout() {
        let trigger = RenderTrigger::new();
        let start = Instant::now();
        let woke = trigger.acquire_until(start + Duration::from_millis(30));
        assert!(!woke);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn permits_are_capped() {
        let trigger = RenderTrigger::new();
        for _ in 0..(MAX_PERMITS * 2) {
            trigger.register_ready();
        }
        trigger.request_render();

        let mut granted = 0;
        while trigger.acquire_until(expired()) {
            granted += 1;
        }
        assert_eq!(granted, MAX_PERMITS);
    }

    #[test]
    fn pulse_survives_display_teardown() {
        // A display that registered ready and then dropped leaves only
        // a surplus permit behind; the next waiter consumes it.
        let trigger = RenderTrigger::new();
        trigger.register_ready();
        trigger.request_render();
        // the registering display is gone, someone else drains it
        assert!(trigger.acquire_until(expired()));
        assert!(!trigger.acquire_until(expired()));
    }

    #[test]
    fn demand_wakes_a_parked_worker() {
        use std::sync::Arc;

        let trigger = Arc::new(RenderTrigger::new());
        let t2 = trigger.clone();
        let waiter = std::thread::spawn(move || {
            t2.register_ready();
            t2.acquire_until(Instant::now() + Duration::from_secs(5))
        });

        // Keep demanding until the worker has registered and woken;
        // extra calls with a zero ready-count are no-ops
        for _ in 0..200 {
            trigger.request_render();
            if waiter.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(waiter.join().unwrap());
    }
}
