// Sync-slot bookkeeping
//
// Each in-flight frame borrows a slot of sync objects. Slots cycle
// through three places: the free stack, the busy map (keyed by the
// swapchain image the slot is guarding), or limbo when a failed
// present leaves a semaphore in an unknown state and the slot is
// abandoned until teardown. The pool grows on demand and never shrinks
// while the worker is running.

use std::collections::HashMap;

pub(crate) struct SlotPool<T> {
    sp_objs: Vec<T>,
    /// free-list stack of slot indices
    sp_free: Vec<u32>,
    /// swapchain image index -> slot guarding its in-flight present
    sp_busy: HashMap<u32, u32>,
}

impl<T> SlotPool<T> {
    pub fn new() -> Self {
        Self {
            sp_objs: Vec::new(),
            sp_free: Vec::new(),
            sp_busy: HashMap::new(),
        }
    }

    /// Pop a recycled slot, if any
    pub fn pop_free(&mut self) -> Option<u32> {
        self.sp_free.pop()
    }

    /// Grow the pool with a freshly created slot and hand it out
    pub fn push(&mut self, obj: T) -> u32 {
        self.sp_objs.push(obj);
        (self.sp_objs.len() - 1) as u32
    }

    pub fn get(&self, slot: u32) -> &T {
        &self.sp_objs[slot as usize]
    }

    /// Associate `slot` with the swapchain image it now guards.
    /// At most one slot guards a given image at a time.
    pub fn mark_busy(&mut self, image_index: u32, slot: u32) {
        let prev = self.sp_busy.insert(image_index, slot);
        debug_assert!(prev.is_none(), "image already had an in-flight slot");
    }

    /// Detach the slot guarding `image_index`, if any. The caller owns
    /// draining it before recycling.
    pub fn take_busy(&mut self, image_index: u32) -> Option<u32> {
        self.sp_busy.remove(&image_index)
    }

    /// Return a drained slot to the free stack
    pub fn recycle(&mut self, slot: u32) {
        debug_assert!(!self.sp_free.contains(&slot));
        self.sp_free.push(slot);
    }

    /// Detach every busy slot for a rebuild or teardown drain
    pub fn drain_busy(&mut self) -> Vec<(u32, u32)> {
        self.sp_busy.drain().collect()
    }

    pub fn busy_is_empty(&self) -> bool {
        self.sp_busy.is_empty()
    }

    /// Tear down the whole pool, yielding every slot ever created
    pub fn drain_all(&mut self) -> Vec<T> {
        self.sp_free.clear();
        self.sp_busy.clear();
        std::mem::take(&mut self.sp_objs)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.sp_objs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_on_demand_and_recycles() {
        let mut pool: SlotPool<&'static str> = SlotPool::new();
        assert!(pool.pop_free().is_none());

        let a = pool.push("a");
        let b = pool.push("b");
        assert_eq!(pool.len(), 2);

        pool.mark_busy(0, a);
        pool.mark_busy(1, b);

        let got = pool.take_busy(0).unwrap();
        assert_eq!(got, a);
        pool.recycle(got);

        // the recycled slot is handed out before the pool grows
        assert_eq!(pool.pop_free(), Some(a));
        // the pool never shrank
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn busy_map_is_a_function_of_image_index() {
        let mut pool: SlotPool<u32> = SlotPool::new();
        let a = pool.push(1);
        pool.mark_busy(3, a);

        // an image must be drained before it can be re-entered
        assert_eq!(pool.take_busy(3), Some(a));
        assert_eq!(pool.take_busy(3), None);

        let b = pool.push(2);
        pool.mark_busy(3, b);
        assert_eq!(pool.take_busy(3), Some(b));
    }

    #[test]
    fn drain_busy_detaches_everything() {
        let mut pool: SlotPool<u32> = SlotPool::new();
        let a = pool.push(1);
        let b = pool.push(2);
        pool.mark_busy(0, a);
        pool.mark_busy(2, b);

        let mut drained = pool.drain_busy();
        drained.sort();
        assert_eq!(drained, vec![(0, a), (2, b)]);
        assert!(pool.busy_is_empty());

        // abandoned slots are still owned by the pool for teardown
        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.drain_all().len(), 2);
    }
}
