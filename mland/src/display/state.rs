// The display state machine
//
// A display's lifecycle is a monotonically non-decreasing walk through
// these states, with one sanctioned exception: a successful swapchain
// rebuild steps back from SwapOutOfDate to Idle. Everything below Error
// is healthy; Error and above are terminal classes.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DisplayState {
    /// Worker thread is still building the swapchain world
    PreInit,
    /// Rendering normally
    Idle,
    /// Swapchain invalidated, worker is rebuilding
    SwapOutOfDate,
    /// Unrecoverable; the worker stops itself
    Error,
    /// External stop requested
    Stop,
    /// Worker has drained and parked
    Stopped,
    /// Worker thread has been joined
    Joined,
}

impl DisplayState {
    pub fn is_healthy(&self) -> bool {
        *self < DisplayState::Error
    }
}

/// State field + mutex + condvar, the way every display publishes its
/// lifecycle to external readers.
pub struct StateCell {
    sc_state: Mutex<DisplayState>,
    sc_cond: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            sc_state: Mutex::new(DisplayState::PreInit),
            sc_cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        self.sc_state.lock().unwrap()
    }

    pub fn get(&self) -> DisplayState {
        *self.lock()
    }

    /// Move the state forward to `target`
    ///
    /// A lower target than the current state is ignored, which is what
    /// makes the per-frame error paths safe to run concurrently with an
    /// external stop.
    pub fn advance(&self, target: DisplayState) {
        let mut state = self.lock();
        if *state < target {
            *state = target;
            self.sc_cond.notify_all();
        }
    }

    /// The one legal backward transition: rebuild finished, back to
    /// rendering. Does nothing once the display left the healthy class.
    pub fn recovered(&self) {
        let mut state = self.lock();
        if *state == DisplayState::SwapOutOfDate {
            *state = DisplayState::Idle;
            self.sc_cond.notify_all();
        }
    }

    /// Claim the role of initiating stopper
    ///
    /// Returns true for exactly one caller; everyone else should wait
    /// for Joined instead.
    pub fn try_begin_stop(&self) -> bool {
        let mut state = self.lock();
        if *state < DisplayState::Stop {
            *state = DisplayState::Stop;
            self.sc_cond.notify_all();
            return true;
        }
        false
    }

    /// Block until the worker has published a definite state
    pub fn wait_past_preinit(&self) -> DisplayState {
        let mut state = self.lock();
        while *state == DisplayState::PreInit {
            state = self.sc_cond.wait(state).unwrap();
        }
        *state
    }

    /// Block until the state reaches at least `target`
    pub fn wait_for(&self, target: DisplayState) {
        let mut state = self.lock();
        while *state < target {
            state = self.sc_cond.wait(state).unwrap();
        }
    }

    /// Block until the state reaches at least `target`, running
    /// `on_timeout` every `period` while it has not.
    ///
    /// Used by stop to keep pumping the render trigger so a worker
    /// parked on the semaphore gets a chance to observe the stop.
    pub fn wait_for_pulsed<F: FnMut()>(
        &self,
        target: DisplayState,
        period: Duration,
        mut on_timeout: F,
    ) {
        let mut state = self.lock();
        while *state < target {
            let (guard, timeout) = self.sc_cond.wait_timeout(state, period).unwrap();
            state = guard;
            if timeout.timed_out() && *state < target {
                on_timeout();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn advance_is_monotonic() {
        let cell = StateCell::new();
        cell.advance(DisplayState::Idle);
        cell.advance(DisplayState::Error);
        // per-frame transitions lose against terminal states
        cell.advance(DisplayState::SwapOutOfDate);
        assert_eq!(cell.get(), DisplayState::Error);
        cell.advance(DisplayState::Stop);
        assert_eq!(cell.get(), DisplayState::Stop);
    }

    #[test]
    fn recovered_only_leaves_swap_out_of_date() {
        let cell = StateCell::new();
        cell.advance(DisplayState::Idle);
        cell.advance(DisplayState::SwapOutOfDate);
        cell.recovered();
        assert_eq!(cell.get(), DisplayState::Idle);

        // once in Error, a rebuild cannot resurrect the display
        cell.advance(DisplayState::Error);
        cell.recovered();
        assert_eq!(cell.get(), DisplayState::Error);
    }

    #[test]
    fn exactly_one_initiating_stopper() {
        let cell = StateCell::new();
        cell.advance(DisplayState::Idle);
        assert!(cell.try_begin_stop());
        assert!(!cell.try_begin_stop());
        assert!(!cell.try_begin_stop());
    }

    #[test]
    fn readers_block_until_past_preinit() {
        let cell = Arc::new(StateCell::new());
        let c2 = cell.clone();
        let reader = std::thread::spawn(move || c2.wait_past_preinit());

        std::thread::sleep(Duration::from_millis(50));
        cell.advance(DisplayState::Idle);
        assert_eq!(reader.join().unwrap(), DisplayState::Idle);
    }

    #[test]
    fn worker_lifecycle_walks_the_full_path() {
        // PreInit -> Idle -> SwapOutOfDate -> Idle -> Stop -> Stopped
        // -> Joined, the longest healthy walk a display makes
        let cell = StateCell::new();
        assert_eq!(cell.get(), DisplayState::PreInit);

        cell.advance(DisplayState::Idle);
        assert!(cell.get().is_healthy());

        cell.advance(DisplayState::SwapOutOfDate);
        assert!(cell.get().is_healthy());
        cell.recovered();
        assert_eq!(cell.get(), DisplayState::Idle);

        assert!(cell.try_begin_stop());
        assert_eq!(cell.get(), DisplayState::Stop);
        assert!(!cell.get().is_healthy());

        cell.advance(DisplayState::Stopped);
        cell.advance(DisplayState::Joined);
        assert_eq!(cell.get(), DisplayState::Joined);

        // terminal means terminal
        cell.recovered();
        cell.advance(DisplayState::Idle);
        assert_eq!(cell.get(), DisplayState::Joined);
    }

    #[test]
    fn pulsed_wait_fires_callback() {
        let cell = Arc::new(StateCell::new());
        let c2 = cell.clone();
        let waiter = std::thread::spawn(move || {
            let mut pulses = 0;
            c2.wait_for_pulsed(DisplayState::Stopped, Duration::from_millis(20), || {
                pulses += 1;
            });
            pulses
        });

        // Let it time out a few times before releasing it
        std::thread::sleep(Duration::from_millis(100));
        cell.advance(DisplayState::Stopped);
        let pulses = waiter.join().unwrap();
        assert!(pulses >= 1);

        let start = Instant::now();
        cell.wait_for(DisplayState::Stopped);
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
