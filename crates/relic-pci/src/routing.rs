use std::collections::BTreeMap;

/// What occupies a physical slot; chipset-class slots route differently in
/// some steering tables, so the machine records the kind at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Northbridge,
    Southbridge,
    Bridge,
    AgpBridge,
    Normal,
    Video,
    Scsi,
    Network,
    Ide,
    Sound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntxPin {
    IntA,
    IntB,
    IntC,
    IntD,
}

impl IntxPin {
    pub fn from_config_pin(pin: u8) -> Option<Self> {
        match pin {
            1 => Some(IntxPin::IntA),
            2 => Some(IntxPin::IntB),
            3 => Some(IntxPin::IntC),
            4 => Some(IntxPin::IntD),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            IntxPin::IntA => 0,
            IntxPin::IntB => 1,
            IntxPin::IntC => 2,
            IntxPin::IntD => 3,
        }
    }
}

/// Number of steerable interrupt links (PIRQA#..PIRQH# on the largest
/// chipsets).
pub const INTX_LINKS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    kind: SlotKind,
    // Steering link index per INTx pin.
    links: [u8; 4],
}

/// Routes a function's INTx pin through the chipset-programmed steering
/// links to a final ISA IRQ.
#[derive(Default)]
pub struct IntxRouter {
    slots: BTreeMap<(u8, u8), SlotEntry>,
    link_irqs: [Option<u8>; INTX_LINKS],
}

impl IntxRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot with its per-pin link assignment (the board-level
    /// INTx swizzle).
    pub fn register_slot(&mut self, bus: u8, device: u8, kind: SlotKind, links: [u8; 4]) {
        debug_assert!(links.iter().all(|&l| (l as usize) < INTX_LINKS));
        self.slots.insert((bus, device), SlotEntry { kind, links });
    }

    pub fn slot_kind(&self, bus: u8, device: u8) -> Option<SlotKind> {
        self.slots.get(&(bus, device)).map(|s| s.kind)
    }

    /// Chipset programming: steers a link to an ISA IRQ, or disables it.
    pub fn set_link_irq(&mut self, link: u8, irq: Option<u8>) {
        if (link as usize) < INTX_LINKS {
            self.link_irqs[link as usize] = irq;
        }
    }

    pub fn link_irq(&self, link: u8) -> Option<u8> {
        self.link_irqs.get(link as usize).copied().flatten()
    }

    /// Final ISA IRQ for `(bus, device, pin)`, or `None` when the slot is
    /// unknown or the link is unrouted.
    pub fn resolve(&self, bus: u8, device: u8, pin: IntxPin) -> Option<u8> {
        let slot = self.slots.get(&(bus, device))?;
        self.link_irqs[slot.links[pin.index()] as usize]
    }
}
