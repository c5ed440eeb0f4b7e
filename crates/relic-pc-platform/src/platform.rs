//! `PcPlatform`: composition of the memory map, port map, and board devices
//! shared by every machine in the catalog.

use std::cell::RefCell;
use std::rc::Rc;

use memory::shadow::set_shadow;
use memory::smram::SmramRegion;
use memory::{DenseMemory, GuestMemory, MemAccess, MemoryMap};
use relic_devices::a20::A20Gate;
use relic_devices::chipset::{MemUpdate, ScampChipset};
use relic_devices::cmos::Cmos;
use relic_devices::dma8237::DmaController;
use relic_devices::irq::IrqLine;
use relic_devices::isapnp::IsaPnpBus;
use relic_devices::mca::McaBus;
use relic_devices::nmi::NmiLine;
use relic_devices::pic8259::Pic8259Pair;
use relic_devices::pit8254::Pit;
use relic_devices::port92::Port92;
use relic_devices::post::PostCard;
use relic_devices::DeviceTimer;
use relic_pci::{IntxRouter, PciBdf, PciConfigSpace, PciDevice, PciHost, SlotKind};
use relic_platform::io::{IoHandlerId, IoPortBus};
use relic_platform::reset::{ResetEvent, ResetLine};
use relic_time::ManualClock;
use relic_timers::TimerQueue;

use crate::adapters::{CmosPorts, PitPorts, PortB};

/// The PCI host bridge function at 00:00.0.
struct HostBridge {
    cfg: PciConfigSpace,
}

impl PciDevice for HostBridge {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

#[derive(Debug, Clone)]
pub struct PcPlatformConfig {
    pub ram_size: u64,
    pub enable_pci: bool,
    pub enable_mca: bool,
    pub enable_isapnp: bool,
    /// Vendor/device of the host bridge at 00:00.0 when PCI is enabled.
    pub northbridge_id: (u16, u16),
}

impl Default for PcPlatformConfig {
    fn default() -> Self {
        Self {
            ram_size: 2 * 1024 * 1024,
            enable_pci: true,
            enable_mca: false,
            enable_isapnp: true,
            northbridge_id: (0x8086, 0x1237),
        }
    }
}

pub struct PcPlatform {
    pub memory: MemoryMap,
    pub io: IoPortBus,
    pub clock: ManualClock,
    pub timers: Rc<RefCell<TimerQueue<DeviceTimer>>>,
    pub pic: Rc<RefCell<Pic8259Pair>>,
    pub pit: Rc<RefCell<Pit>>,
    pub dma: Rc<RefCell<DmaController>>,
    pub cmos: Rc<RefCell<Cmos>>,
    pub chipset: Rc<RefCell<ScampChipset>>,
    pub post: Rc<RefCell<PostCard>>,
    pub pci: Option<PciHost>,
    pub intx: IntxRouter,
    pub mca: Option<Rc<RefCell<McaBus>>>,
    pub isapnp: Option<Rc<RefCell<IsaPnpBus>>>,
    isapnp_claim: Option<IoHandlerId>,
    pub a20: A20Gate,
    pub nmi: NmiLine,
    pub reset_line: ResetLine,
    pub smram: SmramRegion,
    /// Set when mapping structure changed (shadow/SMRAM/A20); drained by
    /// the machine to drop derived caches.
    structure_dirty: bool,
    config: PcPlatformConfig,
}

impl PcPlatform {
    pub fn new(ram_size: u64) -> Self {
        Self::new_with_config(PcPlatformConfig {
            ram_size,
            ..Default::default()
        })
    }

    pub fn new_with_config(config: PcPlatformConfig) -> Self {
        let ram = DenseMemory::new(config.ram_size).expect("guest RAM allocation");
        Self::new_with_config_and_ram(Box::new(ram), config)
    }

    pub fn new_with_config_and_ram(ram: Box<dyn GuestMemory>, config: PcPlatformConfig) -> Self {
        let mut memory = MemoryMap::new(ram);
        // The ISA hole: A0000–FFFFF decodes to the external stack (adapter
        // memory, ROM) until shadow control says otherwise.
        memory.set_access(0xA0000, 0x60000, MemAccess::EXTERNAL);

        let mut io = IoPortBus::new();
        let clock = ManualClock::new();
        let timers = Rc::new(RefCell::new(TimerQueue::new()));
        let a20 = A20Gate::new();
        let nmi = NmiLine::new();
        let reset_line = ResetLine::new();

        let pic = Rc::new(RefCell::new(Pic8259Pair::new()));
        io.register(0x20, 2, pic.clone());
        io.register(0xA0, 2, pic.clone());
        io.register(0x4D0, 2, pic.clone());

        let pit = Rc::new(RefCell::new(Pit::new()));
        pit.borrow_mut().set_irq0(IrqLine::new(pic.clone(), 0));
        io.register(
            0x40,
            4,
            Rc::new(RefCell::new(PitPorts {
                pit: pit.clone(),
                clock: clock.clone(),
                timers: timers.clone(),
            })),
        );
        io.register(
            0x61,
            1,
            Rc::new(RefCell::new(PortB::new(pit.clone(), clock.clone()))),
        );

        let dma = Rc::new(RefCell::new(DmaController::new()));
        io.register(0x00, 16, dma.clone());
        io.register(0xC0, 32, dma.clone());
        // Page registers, leaving 0x80 to the POST latch.
        io.register(0x81, 15, dma.clone());

        let post = Rc::new(RefCell::new(PostCard::new()));
        io.register(0x80, 1, post.clone());

        let cmos = Rc::new(RefCell::new(Cmos::new()));
        {
            let mut c = cmos.borrow_mut();
            c.set_irq8(IrqLine::new(pic.clone(), 8));
            c.set_nmi(nmi.clone());
            c.set_time(1997, 8, 26, 12, 0, 0);
        }
        io.register(
            0x70,
            2,
            Rc::new(RefCell::new(CmosPorts {
                cmos: cmos.clone(),
                clock: clock.clone(),
                timers: timers.clone(),
            })),
        );

        io.register(
            0x92,
            1,
            Rc::new(RefCell::new(Port92::new(a20.clone(), reset_line.clone()))),
        );

        let chipset = Rc::new(RefCell::new(ScampChipset::new()));
        io.register(0x22, 2, chipset.clone());

        let mut intx = IntxRouter::new();
        let pci = if config.enable_pci {
            let host = PciHost::new();
            host.mech1.borrow_mut().set_reset_line(reset_line.clone());
            host.attach(&mut io);
            let mut bridge_cfg = PciConfigSpace::new(config.northbridge_id.0, config.northbridge_id.1);
            bridge_cfg.set_class(0x06, 0x00, 0x00);
            host.bus.borrow_mut().add_device(
                PciBdf::new(0, 0, 0),
                Box::new(HostBridge { cfg: bridge_cfg }),
            );
            intx.register_slot(0, 0, SlotKind::Northbridge, [0, 1, 2, 3]);
            Some(host)
        } else {
            None
        };

        let mca = if config.enable_mca {
            let bus = Rc::new(RefCell::new(McaBus::new()));
            io.register(0x96, 1, bus.clone());
            io.register(0x100, 8, bus.clone());
            Some(bus)
        } else {
            None
        };

        let (isapnp, isapnp_claim) = if config.enable_isapnp {
            let bus = Rc::new(RefCell::new(IsaPnpBus::new()));
            io.register(0x279, 1, bus.clone());
            io.register(0xA79, 1, bus.clone());
            let read_port = bus.borrow().read_port();
            let claim = io.register(read_port, 1, bus.clone());
            (Some(bus), Some(claim))
        } else {
            (None, None)
        };

        // SMRAM: the classic A0000 overlay over the DRAM beneath the video
        // hole; the chipset's SMRAM register drives the state flags.
        let smram = SmramRegion::new(
            &mut memory,
            0xA0000,
            0xA0000,
            0x20000,
            MemAccess::EXTERNAL,
            MemAccess::RAM,
        );

        let mut platform = Self {
            memory,
            io,
            clock,
            timers,
            pic,
            pit,
            dma,
            cmos,
            chipset,
            post,
            pci,
            intx,
            mca,
            isapnp,
            isapnp_claim,
            a20,
            nmi,
            reset_line,
            smram,
            structure_dirty: false,
            config,
        };
        platform.program_cmos_memory_size();
        platform
    }

    pub fn config(&self) -> &PcPlatformConfig {
        &self.config
    }

    /// Standard CMOS memory-size registers from the configured RAM.
    fn program_cmos_memory_size(&mut self) {
        let ram = self.config.ram_size;
        let mut cmos = self.cmos.borrow_mut();
        cmos.write_reg(0x15, 640u16.to_le_bytes()[0]);
        cmos.write_reg(0x16, 640u16.to_le_bytes()[1]);
        let ext_kib = (ram.saturating_sub(1024 * 1024) / 1024).min(0xFFFF) as u16;
        cmos.write_reg(0x17, ext_kib.to_le_bytes()[0]);
        cmos.write_reg(0x18, ext_kib.to_le_bytes()[1]);
        cmos.write_reg(0x30, ext_kib.to_le_bytes()[0]);
        cmos.write_reg(0x31, ext_kib.to_le_bytes()[1]);
    }

    /// Maps a BIOS image at the top of the first megabyte and at the top of
    /// the 32-bit space (the reset alias).
    pub fn load_bios(&mut self, image: Vec<u8>) {
        let len = image.len() as u64;
        assert!(len <= 0x2_0000 && len.is_power_of_two(), "BIOS image size");
        log::debug!("BIOS mapped at {:#x} and the reset alias", 0x10_0000 - len);
        let rom = Rc::new(RefCell::new(image));
        self.memory.add_rom(0x10_0000 - len, rom.clone());
        self.memory.add_rom(0x1_0000_0000 - len, rom);
        self.memory
            .set_access(0x10_0000 - len, len, MemAccess::EXTERNAL);
    }

    /// Applies queued chipset register effects to the memory map.
    pub fn apply_chipset_updates(&mut self) {
        let updates = self.chipset.borrow_mut().take_updates();
        for update in updates {
            self.structure_dirty = true;
            match update {
                MemUpdate::Shadow {
                    base,
                    size,
                    read,
                    write,
                } => set_shadow(&mut self.memory, base, size, read, write),
                MemUpdate::Smram { smm, open } => {
                    let flags = if open {
                        MemAccess::RAM
                    } else if smm {
                        MemAccess::DISABLED
                    } else {
                        MemAccess::EXTERNAL
                    };
                    self.smram.state_change(&mut self.memory, smm, flags);
                }
            }
        }
        // ISAPnP read-port relocation re-registers the claim.
        if let (Some(bus), Some(claim)) = (&self.isapnp, &mut self.isapnp_claim) {
            if let Some(port) = bus.borrow_mut().take_read_port_change() {
                self.io.unregister(*claim);
                *claim = self.io.register(port, 1, bus.clone());
            }
        }
        // A20 changes route every aliased page differently.
        if self.a20.enabled() != self.memory.a20_enabled() {
            let enabled = self.a20.enabled();
            self.memory.set_a20_enabled(enabled);
            self.structure_dirty = true;
        }
    }

    /// True once when shadow/SMRAM/A20 structure changed; derived caches
    /// (TLB, block cache) must drop.
    pub fn take_structure_dirty(&mut self) -> bool {
        let dirty = self.structure_dirty || !self.memory.take_changes().is_empty();
        self.structure_dirty = false;
        dirty
    }

    /// Drains expired device timers at the current virtual time, letting
    /// each device raise IRQs and re-arm.
    pub fn process_timers(&mut self) {
        let now = self.clock.now_ns();
        loop {
            let event = self.timers.borrow_mut().pop_due(now);
            let Some(event) = event else { break };
            match event.payload {
                DeviceTimer::PitChannel0 => {
                    let mut timers = self.timers.borrow_mut();
                    self.pit
                        .borrow_mut()
                        .handle_timer_event(event.deadline_ns, &mut timers);
                }
                DeviceTimer::RtcPeriodic => {
                    let mut timers = self.timers.borrow_mut();
                    self.cmos
                        .borrow_mut()
                        .handle_periodic(event.deadline_ns, &mut timers);
                }
                DeviceTimer::RtcSecond => {
                    let mut timers = self.timers.borrow_mut();
                    self.cmos
                        .borrow_mut()
                        .handle_second(event.deadline_ns, &mut timers);
                }
            }
        }
    }

    pub fn next_timer_deadline_ns(&self) -> Option<u64> {
        self.timers.borrow().next_deadline_ns()
    }

    pub fn take_reset_events(&mut self) -> Vec<ResetEvent> {
        self.reset_line.take_events()
    }

    /// Power-on reset of every board device. CMOS contents survive (battery
    /// backed); the timer queue restarts empty.
    pub fn reset(&mut self) {
        self.timers.borrow_mut().clear();
        self.pic.borrow_mut().reset();
        self.pit.borrow_mut().reset();
        self.dma.borrow_mut().reset();
        self.cmos.borrow_mut().reset();
        self.chipset.borrow_mut().reset();
        self.post.borrow_mut().reset();
        if let Some(pci) = &self.pci {
            pci.bus.borrow_mut().reset_all();
        }
        if let Some(mca) = &self.mca {
            mca.borrow_mut().reset();
        }
        if let Some(pnp) = &self.isapnp {
            pnp.borrow_mut().reset();
        }
        self.a20.set_enabled(false);
        self.apply_chipset_updates();
        self.structure_dirty = true;
    }
}
