use std::cell::RefCell;
use std::rc::Rc;

/// Anything that exposes numbered interrupt-request lines (the PIC pair, or a
/// test recorder).
pub trait InterruptController {
    fn set_irq_line(&mut self, line: u8, high: bool);
}

/// A single IRQ line handle a device holds for its lifetime. Cloning is
/// cheap; the controller itself is owned by the platform.
#[derive(Clone)]
pub struct IrqLine {
    ctrl: Rc<RefCell<dyn InterruptController>>,
    line: u8,
}

impl IrqLine {
    pub fn new(ctrl: Rc<RefCell<dyn InterruptController>>, line: u8) -> Self {
        Self { ctrl, line }
    }

    pub fn line(&self) -> u8 {
        self.line
    }

    pub fn raise(&self) {
        self.ctrl.borrow_mut().set_irq_line(self.line, true);
    }

    pub fn lower(&self) {
        self.ctrl.borrow_mut().set_irq_line(self.line, false);
    }

    /// Rising edge followed by release, for edge-triggered pulse sources
    /// like the PIT in mode 2.
    pub fn pulse(&self) {
        self.raise();
        self.lower();
    }
}

/// Discards everything; placeholder while wiring partial platforms.
#[derive(Default)]
pub struct NullInterruptController;

impl InterruptController for NullInterruptController {
    fn set_irq_line(&mut self, _line: u8, _high: bool) {}
}
