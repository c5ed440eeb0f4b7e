//! The top-level machine: CPU + fabric + recompiler tier under one run
//! loop driven by a cycle budget.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use relic_cpu_core::cpuid::CpuModel;
use relic_cpu_core::exec::{run_batch, BatchExit, CpuCore};
use relic_cpu_core::interrupts::{handle_exception, CpuExit};
use relic_cpu_core::state::seg;
use relic_cpu_core::InterruptController;
use relic_cpu_core::bus::CpuBus;
use relic_devices::pic8259::Pic8259Pair;
use relic_devices::registry::DeviceRegistry;
use relic_devices::DeviceTimer;
use relic_jit::{JitConfig, JitRuntime, RunExit as BlockExit};
use relic_pc_platform::PcCpuBus;
use relic_platform::reset::ResetEvent;
use relic_platform::ui::{NullUiSink, UiSink};
use thiserror::Error;

use crate::config::{ConfigStore, ConfigValue};
use crate::machines;
use crate::nvram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    /// 486 board with the SCAMP-style index/data chipset on plain ISA.
    Scamp486Isa,
    /// Micro Channel board with the POS fabric.
    Ps2Model80Mca,
    /// Socket 5/7 board with PCI configuration mechanism #1.
    PentiumPci,
}

impl MachineKind {
    pub fn internal_name(&self) -> &'static str {
        match self {
            MachineKind::Scamp486Isa => "scamp486",
            MachineKind::Ps2Model80Mca => "ps2_m80",
            MachineKind::PentiumPci => "pentium_pci",
        }
    }

    pub fn from_internal_name(name: &str) -> Option<Self> {
        match name {
            "scamp486" => Some(MachineKind::Scamp486Isa),
            "ps2_m80" => Some(MachineKind::Ps2Model80Mca),
            "pentium_pci" => Some(MachineKind::PentiumPci),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct MachineConfig {
    pub kind: MachineKind,
    pub ram_size_bytes: u64,
    pub cpu_model: CpuModel,
    pub cpu_hz: u64,
    /// BIOS image; a machine cannot come up without one.
    pub bios: Option<Vec<u8>>,
    pub enable_jit: bool,
    pub nvram_path: Option<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kind: MachineKind::PentiumPci,
            ram_size_bytes: 2 * 1024 * 1024,
            cpu_model: CpuModel::pentium(),
            cpu_hz: 66_000_000,
            bios: None,
            enable_jit: true,
            nvram_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no BIOS ROM configured")]
    MissingRom,
    #[error("BIOS ROM size {len:#x} is not a power of two up to 128K")]
    BadRom { len: usize },
    #[error("device '{device}' failed to initialize: {reason}")]
    DeviceInit { device: String, reason: String },
    #[error("NVRAM I/O: {0}")]
    Nvram(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Cycle budget consumed.
    Completed,
    /// Halted with no timer able to wake the CPU inside the slice.
    Halted,
    /// A reset was requested through the fabric (0xCF9, port 0x92, i8042).
    ResetRequested(ResetEvent),
    /// CPU fault cascade; the caller decides between reset and shutdown.
    TripleFault,
}

struct PicCtrl(Rc<RefCell<Pic8259Pair>>);

impl InterruptController for PicCtrl {
    fn has_pending(&mut self) -> bool {
        self.0.borrow().has_pending()
    }

    fn acknowledge(&mut self) -> u8 {
        self.0.borrow_mut().ack()
    }
}

pub struct Machine {
    cpu: CpuCore,
    bus: PcCpuBus,
    jit: Option<JitRuntime>,
    registry: DeviceRegistry,
    ui: Box<dyn UiSink>,
    cpu_hz: u64,
    config: MachineConfig,
    store: ConfigStore,
    triple_fault_logged: bool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        let bios = config.bios.clone().ok_or(MachineError::MissingRom)?;
        if !bios.len().is_power_of_two() || bios.len() > 0x2_0000 || bios.len() < 0x800 {
            return Err(MachineError::BadRom { len: bios.len() });
        }

        // Devices register in bring-up order; any failure drops the
        // registry, closing them in reverse.
        let mut registry = DeviceRegistry::new();
        let mut platform = machines::compose(&config, &mut registry)?;
        platform.load_bios(bios);

        if let Some(path) = &config.nvram_path {
            nvram::load(&mut platform.cmos.borrow_mut(), path)?;
        }
        // The RTC second tick runs from power-on.
        platform
            .timers
            .borrow_mut()
            .schedule_at(1_000_000_000, DeviceTimer::RtcSecond);

        let cpu = CpuCore::new(config.cpu_model);
        let jit = config.enable_jit.then(|| JitRuntime::new(JitConfig::default()));
        let cpu_hz = config.cpu_hz;

        Ok(Self {
            cpu,
            bus: PcCpuBus::new(platform),
            jit,
            registry,
            ui: Box::new(NullUiSink),
            cpu_hz,
            config,
            store: ConfigStore::new(),
            triple_fault_logged: false,
        })
    }

    pub fn set_ui_sink(&mut self, ui: Box<dyn UiSink>) {
        self.ui = ui;
    }

    pub fn cpu(&self) -> &CpuCore {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuCore {
        &mut self.cpu
    }

    pub fn bus(&mut self) -> &mut PcCpuBus {
        &mut self.bus
    }

    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// POST codes written to port 0x80 since the last drain.
    pub fn take_post_codes(&mut self) -> Vec<u8> {
        self.bus.platform.post.borrow_mut().take_history()
    }

    pub fn cmos_reg(&self, index: u8) -> u8 {
        self.bus.platform.cmos.borrow().read_reg(index)
    }

    pub fn trigger_smi(&mut self) {
        self.cpu.request_smi();
    }

    pub fn trigger_nmi(&mut self) {
        self.cpu.request_nmi();
    }

    fn cycles_to_ns(&self, cycles: i64) -> u64 {
        (cycles.max(0) as u128 * 1_000_000_000 / self.cpu_hz as u128) as u64
    }

    fn ns_to_cycles(&self, ns: u64) -> i64 {
        (ns as u128 * self.cpu_hz as u128 / 1_000_000_000) as i64
    }

    fn drain_jit_feedback(&mut self) {
        let Some(jit) = &mut self.jit else {
            let _ = self.bus.take_write_log();
            let _ = self.bus.take_derived_flush();
            return;
        };
        for (paddr, len) in self.bus.take_write_log() {
            jit.note_write(paddr, len);
        }
        if self.bus.take_derived_flush() {
            jit.flush_all();
        }
    }

    /// Attempts one cached-block execution; returns false when the
    /// interpreter should take the instruction instead.
    fn try_block(&mut self) -> Result<bool, CpuExit> {
        let Some(jit) = &mut self.jit else {
            return Ok(false);
        };
        if self.cpu.state.halted || self.cpu.pending_boundary_events() {
            return Ok(false);
        }
        if self.bus.platform.pic.borrow().has_pending() && self.cpu.state.interrupts_open() {
            return Ok(false);
        }
        let Some(paddr) = self.bus.code_paddr(&self.cpu.state) else {
            return Ok(false);
        };
        let lin = self.cpu.state.segs[seg::CS]
            .base
            .wrapping_add(self.cpu.state.eip);
        let code32 = self.cpu.state.code_32();

        let bus = &mut self.bus;
        let handle = jit.lookup_or_compile(paddr, lin, code32, |addr| {
            use relic_cpu_core::CpuBus;
            bus.fetch_u8(addr).ok()
        });
        let Some(handle) = handle else {
            return Ok(false);
        };

        match jit.run_block(&mut self.cpu.state, &mut self.bus, &handle) {
            BlockExit::Completed | BlockExit::SelfModified | BlockExit::Halted => Ok(true),
            BlockExit::Fault(exc) => {
                handle_exception(&mut self.cpu.state, &mut self.bus, exc)?;
                Ok(true)
            }
        }
    }

    /// Runs up to `max_cycles` guest cycles, draining device timers and
    /// sampling interrupts at instruction boundaries. Virtual time advances
    /// with consumed cycles; a HLT fast-forwards to the next deadline.
    pub fn run_slice(&mut self, max_cycles: i64) -> RunExit {
        let mut remaining = max_cycles;
        let mut ctrl = PicCtrl(self.bus.platform.pic.clone());

        loop {
            self.bus.platform.process_timers();
            if let Some(event) = self.bus.platform.take_reset_events().into_iter().next() {
                return RunExit::ResetRequested(event);
            }
            if remaining <= 0 {
                return RunExit::Completed;
            }

            // Block tier first; it charges the same cycle pool.
            self.cpu.state.cycles = remaining;
            match self.try_block() {
                Ok(true) => {
                    let used = (remaining - self.cpu.state.cycles).max(1);
                    self.bus.platform.clock.advance_ns(self.cycles_to_ns(used));
                    remaining -= used;
                    self.drain_jit_feedback();
                    continue;
                }
                Ok(false) => {}
                Err(CpuExit::TripleFault) => return self.note_triple_fault(),
            }

            let chunk = remaining.min(4096);
            let result = run_batch(&mut self.cpu, &mut self.bus, &mut ctrl, chunk);
            let used = (chunk - self.cpu.state.cycles).clamp(1, chunk.max(1));
            self.bus.platform.clock.advance_ns(self.cycles_to_ns(used));
            remaining -= used;
            self.drain_jit_feedback();

            match result.exit {
                BatchExit::TripleFault => return self.note_triple_fault(),
                BatchExit::Completed => {}
                BatchExit::Halted => {
                    // Sleep virtual time forward to the next deadline.
                    let now = self.bus.platform.clock.now_ns();
                    match self.bus.platform.next_timer_deadline_ns() {
                        Some(deadline) => {
                            let skip = deadline.saturating_sub(now);
                            let skip_cycles = self.ns_to_cycles(skip).max(1);
                            if skip_cycles >= remaining {
                                return RunExit::Halted;
                            }
                            self.bus.platform.clock.set_ns(deadline);
                            remaining -= skip_cycles;
                        }
                        None => return RunExit::Halted,
                    }
                }
            }
        }
    }

    fn note_triple_fault(&mut self) -> RunExit {
        if !self.triple_fault_logged {
            log::warn!("guest triple fault; machine reset required");
            self.triple_fault_logged = true;
        }
        self.ui.status_text("triple fault");
        RunExit::TripleFault
    }

    /// Hard reset: every registered device back to power-on, CPU at the
    /// reset vector, recompiler cache dropped. CMOS survives.
    pub fn reset(&mut self) {
        self.registry.reset_all();
        self.bus.platform.reset();
        self.bus
            .platform
            .timers
            .borrow_mut()
            .schedule_at(
                self.bus.platform.clock.now_ns() + 1_000_000_000,
                DeviceTimer::RtcSecond,
            );
        self.cpu.reset();
        self.bus.flush_tlb();
        if let Some(jit) = &mut self.jit {
            jit.flush_all();
        }
        let _ = self.bus.take_write_log();
        let _ = self.bus.take_derived_flush();
        self.triple_fault_logged = false;
        self.ui.status_text("reset");
    }

    /// Emulated-speed change: rescale the cycle clock and broadcast to
    /// devices that derive timings from it.
    pub fn set_cpu_hz(&mut self, hz: u64) {
        assert!(hz > 0);
        self.cpu_hz = hz;
        self.registry.speed_changed_all();
    }

    pub fn nvram_save(&self) -> Result<(), MachineError> {
        if let Some(path) = &self.config.nvram_path {
            nvram::save(&self.bus.platform.cmos.borrow(), path)?;
        }
        Ok(())
    }

    /// Current settings as a sectioned config snapshot.
    pub fn snapshot_config(&self) -> ConfigStore {
        let mut store = self.store.clone();
        store.set(
            "machine",
            "type",
            ConfigValue::Str(self.config.kind.internal_name().into()),
        );
        store.set(
            "machine",
            "mem_size",
            ConfigValue::Int((self.config.ram_size_bytes / 1024) as i64),
        );
        store.set("machine", "jit", ConfigValue::Int(self.jit.is_some().into()));
        store.set("machine", "cpu_hz", ConfigValue::Int(self.cpu_hz as i64));
        store
    }

    /// Applies the subset of settings that can change without recomposing
    /// the machine; the rest is picked up by the front-end rebuilding it.
    pub fn apply_config(&mut self, store: &ConfigStore) {
        if let Some(hz) = store.get("machine", "cpu_hz").and_then(ConfigValue::as_int) {
            if hz > 0 && hz as u64 != self.cpu_hz {
                self.set_cpu_hz(hz as u64);
            }
        }
        self.store = store.clone();
    }
}
