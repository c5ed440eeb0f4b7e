//! The machine catalog: concrete board compositions in the common-init →
//! chipset → expansion order.

use std::cell::RefCell;
use std::rc::Rc;

use relic_devices::mca::McaCard;
use relic_devices::registry::{DeviceBus, DeviceModel, DeviceRegistry};
use relic_pc_platform::{PcPlatform, PcPlatformConfig};

use crate::machine::{MachineConfig, MachineError, MachineKind};

/// Registry adapter over the `Rc<RefCell<_>>` device cells the platform
/// shares with its port map.
struct SharedDevice<T: 'static> {
    name: &'static str,
    cell: Rc<RefCell<T>>,
    reset: fn(&mut T),
}

impl<T> DeviceModel for SharedDevice<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn reset(&mut self) {
        (self.reset)(&mut self.cell.borrow_mut());
    }
}

fn platform_config(cfg: &MachineConfig) -> PcPlatformConfig {
    match cfg.kind {
        MachineKind::Scamp486Isa => PcPlatformConfig {
            ram_size: cfg.ram_size_bytes,
            enable_pci: false,
            enable_mca: false,
            enable_isapnp: true,
            northbridge_id: (0, 0),
        },
        MachineKind::Ps2Model80Mca => PcPlatformConfig {
            ram_size: cfg.ram_size_bytes,
            enable_pci: false,
            enable_mca: true,
            enable_isapnp: false,
            northbridge_id: (0, 0),
        },
        MachineKind::PentiumPci => PcPlatformConfig {
            ram_size: cfg.ram_size_bytes,
            enable_pci: true,
            enable_mca: false,
            enable_isapnp: true,
            northbridge_id: (0x8086, 0x1237),
        },
    }
}

/// The planar's own POS identity on MCA machines.
struct PlanarPos {
    regs: [u8; 8],
}

impl McaCard for PlanarPos {
    fn pos_read(&mut self, reg: u8) -> u8 {
        match reg {
            0 => 0xFF,
            1 => 0xEF,
            r => self.regs[r as usize],
        }
    }

    fn pos_write(&mut self, reg: u8, value: u8) {
        if reg >= 2 {
            self.regs[reg as usize] = value;
        }
    }

    fn reset(&mut self) {
        self.regs = [0; 8];
    }
}

/// `machine_common_init` and the board-specific steps: builds the platform
/// and fills the registry in bring-up order.
pub fn compose(
    cfg: &MachineConfig,
    registry: &mut DeviceRegistry,
) -> Result<PcPlatform, MachineError> {
    if cfg.ram_size_bytes < 640 * 1024 {
        return Err(MachineError::DeviceInit {
            device: "ram".into(),
            reason: format!("{} bytes is below the 640K floor", cfg.ram_size_bytes),
        });
    }
    let platform = PcPlatform::new_with_config(platform_config(cfg));

    registry.add(
        DeviceBus::System,
        Box::new(SharedDevice {
            name: "i8259",
            cell: platform.pic.clone(),
            reset: |d| d.reset(),
        }),
    );
    registry.add(
        DeviceBus::System,
        Box::new(SharedDevice {
            name: "i8254",
            cell: platform.pit.clone(),
            reset: |d| d.reset(),
        }),
    );
    registry.add(
        DeviceBus::System,
        Box::new(SharedDevice {
            name: "i8237",
            cell: platform.dma.clone(),
            reset: |d| d.reset(),
        }),
    );
    registry.add(
        DeviceBus::System,
        Box::new(SharedDevice {
            name: "cmos",
            cell: platform.cmos.clone(),
            reset: |d| d.reset(),
        }),
    );
    registry.add(
        DeviceBus::System,
        Box::new(SharedDevice {
            name: "scamp",
            cell: platform.chipset.clone(),
            reset: |d| d.reset(),
        }),
    );
    registry.add(
        DeviceBus::Isa,
        Box::new(SharedDevice {
            name: "post",
            cell: platform.post.clone(),
            reset: |d| d.reset(),
        }),
    );

    if let Some(mca) = &platform.mca {
        let planar = Rc::new(RefCell::new(PlanarPos { regs: [0; 8] }));
        mca.borrow_mut().add_card(planar);
        registry.add(
            DeviceBus::Mca,
            Box::new(SharedDevice {
                name: "mca-planar",
                cell: mca.clone(),
                reset: |d| d.reset(),
            }),
        );
    }

    Ok(platform)
}
