use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Reset requests surfaced to the machine's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    /// Full machine reset (port 0xCF9, keyboard-controller pulse).
    System,
    /// CPU-only reset (port 0x92 fast reset, triple fault recovery).
    Cpu,
}

/// Shared handle devices use to request a reset. The platform drains the
/// queue between instruction batches; requests are never acted on inline.
#[derive(Clone, Default)]
pub struct ResetLine {
    queue: Rc<RefCell<VecDeque<ResetEvent>>>,
}

impl ResetLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, event: ResetEvent) {
        self.queue.borrow_mut().push_back(event);
    }

    pub fn take_events(&self) -> Vec<ResetEvent> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn is_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
}
