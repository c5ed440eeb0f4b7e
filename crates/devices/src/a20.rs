use std::cell::Cell;
use std::rc::Rc;

/// Shared A20 gate state. Port 0x92 and the keyboard controller both drive
/// it; the platform applies it to the memory map before each access batch.
#[derive(Clone, Default)]
pub struct A20Gate {
    enabled: Rc<Cell<bool>>,
}

impl A20Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }
}
