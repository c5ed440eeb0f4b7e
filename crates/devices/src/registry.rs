//! Device instance registry and lifecycle.
//!
//! A machine composes itself by constructing device models and handing them
//! to the registry. Construction is fallible; a failure during composition
//! makes the machine drop every instance already registered, in reverse
//! order, so a machine is either fully up or not at all. Reset and
//! speed-change broadcasts walk the registry in registration order.

use std::fmt;

/// Bus attachment of a device, for availability filtering by the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBus {
    Isa,
    Mca,
    Pci,
    Agp,
    System,
}

/// A registered device instance.
///
/// `reset` restores power-on state. `speed_changed` is broadcast when the
/// emulated CPU clock changes so devices can rescale derived timings;
/// `force_redraw` when the front-end invalidates its surface.
pub trait DeviceModel {
    fn name(&self) -> &str;
    fn reset(&mut self);
    fn speed_changed(&mut self) {}
    fn force_redraw(&mut self) {}
}

/// Why a device could not be brought up.
#[derive(Debug)]
pub struct DeviceInitError {
    pub device: String,
    pub reason: String,
}

impl fmt::Display for DeviceInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device '{}' failed to initialize: {}", self.device, self.reason)
    }
}

impl std::error::Error for DeviceInitError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

pub struct DeviceRegistry {
    devices: Vec<(DeviceBus, Box<dyn DeviceModel>)>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    pub fn add(&mut self, bus: DeviceBus, device: Box<dyn DeviceModel>) -> DeviceId {
        log::debug!("device_add: {}", device.name());
        self.devices.push((bus, device));
        DeviceId(self.devices.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn name(&self, id: DeviceId) -> &str {
        self.devices[id.0].1.name()
    }

    pub fn reset_all(&mut self) {
        for (_, device) in self.devices.iter_mut() {
            device.reset();
        }
    }

    pub fn speed_changed_all(&mut self) {
        for (_, device) in self.devices.iter_mut() {
            device.speed_changed();
        }
    }

    pub fn force_redraw_all(&mut self) {
        for (_, device) in self.devices.iter_mut() {
            device.force_redraw();
        }
    }

    /// Shutdown: drop instances in reverse registration order.
    pub fn close_all(&mut self) {
        while let Some((_, device)) = self.devices.pop() {
            log::debug!("device_close: {}", device.name());
            drop(device);
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
