//! SMRAM: a RAM overlay visible only while the CPU is in System Management
//! Mode.
//!
//! The region carries two access-mode sets, one per CPU state (normal vs
//! SMM); entering SMM installs the SMM set atomically and exiting restores
//! the prior one. A backup of the pre-SMM geometry is taken on entry so exit
//! is exact even if the SMM handler reprograms the region.

use crate::map::{MappingId, MemAccess, MemoryMap};

pub struct SmramRegion {
    mapping: MappingId,
    host_base: u64,
    size: u64,
    normal: MemAccess,
    smm: MemAccess,
    in_smm: bool,
    backup: Option<(u64, u64)>,
}

impl SmramRegion {
    /// Adds the overlay mapping (`host_base` → DRAM at `ram_base`) and
    /// installs the normal-state flags.
    pub fn new(
        map: &mut MemoryMap,
        host_base: u64,
        ram_base: u64,
        size: u64,
        normal: MemAccess,
        smm: MemAccess,
    ) -> Self {
        let mapping = map.add_internal(host_base, size, ram_base);
        let region = Self {
            mapping,
            host_base,
            size,
            normal,
            smm,
            in_smm: false,
            backup: None,
        };
        map.set_access(host_base, size, normal);
        region
    }

    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn apply(&self, map: &mut MemoryMap) {
        let flags = if self.in_smm { self.smm } else { self.normal };
        map.set_access(self.host_base, self.size, flags);
    }

    /// Updates the access-mode set of one state; re-applies when that state
    /// is the current one. The chipset's SMRAM control register lands here.
    pub fn state_change(&mut self, map: &mut MemoryMap, smm: bool, flags: MemAccess) {
        if smm {
            self.smm = flags;
        } else {
            self.normal = flags;
        }
        if smm == self.in_smm {
            self.apply(map);
        }
    }

    /// Moves the overlay window.
    pub fn relocate(&mut self, map: &mut MemoryMap, host_base: u64, size: u64) {
        // Restore the old window to plain external decoding first.
        map.set_access(self.host_base, self.size, MemAccess::EXTERNAL);
        self.host_base = host_base;
        self.size = size;
        map.set_addr(self.mapping, host_base);
        self.apply(map);
    }

    /// SMI entry: snapshot geometry, then switch to the SMM flag set.
    pub fn enter_smm(&mut self, map: &mut MemoryMap) {
        self.backup = Some((self.host_base, self.size));
        self.in_smm = true;
        self.apply(map);
    }

    /// RSM: restore the pre-SMI geometry and the normal flag set.
    pub fn exit_smm(&mut self, map: &mut MemoryMap) {
        if let Some((host_base, size)) = self.backup.take() {
            if host_base != self.host_base || size != self.size {
                self.relocate(map, host_base, size);
            }
        }
        self.in_smm = false;
        self.apply(map);
    }

    pub fn in_smm(&self) -> bool {
        self.in_smm
    }
}
