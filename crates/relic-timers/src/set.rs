use crate::queue::TimerQueue;

/// Handle to a timer owned by a device for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u32);

struct Slot<P> {
    payload: P,
    enabled: bool,
    // Bumped on every disable/re-arm; queued expirations carry the
    // generation they were armed under and are dropped on mismatch. This is
    // what guarantees a disabled timer never fires.
    generation: u32,
    deadline_ns: u64,
    period_ns: Option<u64>,
}

/// Handle-based timer scheduler.
///
/// Timers are allocated disabled, armed with [`TimerSet::set_delay`], and
/// optionally made periodic. Expiration callbacks run inside
/// [`TimerSet::advance`] and may freely re-arm or disable any timer,
/// including the one that just fired.
pub struct TimerSet<P> {
    slots: Vec<Option<Slot<P>>>,
    free: Vec<u32>,
    queue: TimerQueue<(u32, u32)>,
}

impl<P> Default for TimerSet<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> TimerSet<P> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queue: TimerQueue::new(),
        }
    }

    /// Allocates a disabled timer.
    pub fn add(&mut self, payload: P) -> TimerHandle {
        let slot = Slot {
            payload,
            enabled: false,
            generation: 0,
            deadline_ns: 0,
            period_ns: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                TimerHandle(idx)
            }
            None => {
                self.slots.push(Some(slot));
                TimerHandle(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Destroys a timer; any queued expiration becomes inert.
    pub fn remove(&mut self, h: TimerHandle) {
        if let Some(slot) = self.slots.get_mut(h.0 as usize) {
            if slot.take().is_some() {
                self.free.push(h.0);
            }
        }
    }

    fn slot_mut(&mut self, h: TimerHandle) -> &mut Slot<P> {
        self.slots[h.0 as usize]
            .as_mut()
            .expect("timer handle used after remove")
    }

    /// Arms the timer to fire at `now + delta` and enables it.
    pub fn set_delay(&mut self, h: TimerHandle, now_ns: u64, delta_ns: u64) {
        let slot = self.slot_mut(h);
        slot.generation = slot.generation.wrapping_add(1);
        slot.enabled = true;
        slot.deadline_ns = now_ns.saturating_add(delta_ns);
        let key = (h.0, slot.generation);
        let deadline = slot.deadline_ns;
        self.queue.schedule_at(deadline, key);
    }

    /// Makes the timer re-arm itself by `period` on each expiration.
    /// `None` reverts to one-shot behavior.
    pub fn set_period(&mut self, h: TimerHandle, period_ns: Option<u64>) {
        self.slot_mut(h).period_ns = period_ns;
    }

    /// Removes the timer from the active set without destroying the handle.
    pub fn disable(&mut self, h: TimerHandle) {
        let slot = self.slot_mut(h);
        slot.enabled = false;
        slot.generation = slot.generation.wrapping_add(1);
    }

    pub fn is_enabled(&self, h: TimerHandle) -> bool {
        self.slots[h.0 as usize]
            .as_ref()
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    pub fn deadline_ns(&self, h: TimerHandle) -> Option<u64> {
        let slot = self.slots.get(h.0 as usize)?.as_ref()?;
        slot.enabled.then_some(slot.deadline_ns)
    }

    fn entry_is_live(&self, idx: u32, generation: u32) -> bool {
        matches!(
            self.slots.get(idx as usize).and_then(|s| s.as_ref()),
            Some(slot) if slot.enabled && slot.generation == generation
        )
    }

    /// Earliest live deadline; stale queue heads are discarded on the way.
    pub fn next_deadline_ns(&mut self) -> Option<u64> {
        loop {
            let (deadline, &(idx, generation)) = self.queue.peek()?;
            if self.entry_is_live(idx, generation) {
                return Some(deadline);
            }
            self.queue.pop();
        }
    }

}

impl<P: Clone> TimerSet<P> {
    /// Drains every timer due at `now_ns`, invoking `fire` for each.
    ///
    /// Periodic timers are re-armed by `deadline += period` *before* the
    /// callback so a callback that disables or re-arms the firing timer wins.
    /// One-shot timers expire disabled but keep their handle.
    pub fn advance(
        &mut self,
        now_ns: u64,
        mut fire: impl FnMut(&mut Self, TimerHandle, u64, P),
    ) {
        loop {
            let Some((deadline, &(idx, generation))) = self.queue.peek() else {
                return;
            };
            if deadline > now_ns {
                return;
            }
            self.queue.pop();
            if !self.entry_is_live(idx, generation) {
                continue;
            }

            let handle = TimerHandle(idx);
            let payload;
            {
                let slot = self.slot_mut(handle);
                payload = slot.payload.clone();
                match slot.period_ns {
                    Some(period) => {
                        // Advance from the old deadline, not from `now`, so
                        // periodic timers do not drift.
                        slot.deadline_ns = slot.deadline_ns.saturating_add(period.max(1));
                        let key = (idx, slot.generation);
                        let next = slot.deadline_ns;
                        self.queue.schedule_at(next, key);
                    }
                    None => {
                        slot.enabled = false;
                        slot.generation = slot.generation.wrapping_add(1);
                    }
                }
            }
            fire(self, handle, deadline, payload);
        }
    }
}
