//! System Management Mode entry and resume.
//!
//! SMI entry stores the state-save frame at the classic offsets in the top
//! of the SMRAM segment (`SMBASE + 0xFE00..0xFFFF`), flips the SMRAM
//! overlay, and lands the handler at `SMBASE + 0x8000` in a real-like mode
//! with 4 GiB segments. RSM restores the frame exactly, including a
//! relocated SMBASE.

use crate::bus::CpuBus;
use crate::exceptions::Exception;
use crate::flags;
use crate::state::{seg as sr, CpuState, SegmentReg, CR0_EM, CR0_PE, CR0_PG, CR0_TS};

/// Save-slot offsets relative to SMBASE (Intel 32-bit save map).
mod slot {
    pub const CR0: u32 = 0xFFFC;
    pub const CR3: u32 = 0xFFF8;
    pub const EFLAGS: u32 = 0xFFF4;
    pub const EIP: u32 = 0xFFF0;
    pub const EDI: u32 = 0xFFEC;
    pub const ESI: u32 = 0xFFE8;
    pub const EBP: u32 = 0xFFE4;
    pub const ESP: u32 = 0xFFE0;
    pub const EBX: u32 = 0xFFDC;
    pub const EDX: u32 = 0xFFD8;
    pub const ECX: u32 = 0xFFD4;
    pub const EAX: u32 = 0xFFD0;
    pub const GS: u32 = 0xFFBC;
    pub const FS: u32 = 0xFFB8;
    pub const DS: u32 = 0xFFB4;
    pub const SS: u32 = 0xFFB0;
    pub const CS: u32 = 0xFFAC;
    pub const ES: u32 = 0xFFA8;
    pub const REVISION: u32 = 0xFEFC;
    pub const SMBASE: u32 = 0xFEF8;
    /// Descriptor-cache images (base/limit/access per segment), in the
    /// reserved region the way hardware hides them.
    pub const SEG_CACHE: u32 = 0xFF00;
}

/// SMM revision with SMBASE relocation supported.
const SMM_REVISION: u32 = 0x0001_0002;

fn smm_segment(base: u32) -> SegmentReg {
    SegmentReg {
        selector: (base >> 4) as u16,
        base,
        limit: 0xFFFF_FFFF,
        access: 0x93,
        attrib: 0x8, // G set, 16-bit default
        valid: true,
    }
}

/// SMI entry. The caller has already sampled the pending SMI at an
/// instruction boundary.
pub fn enter_smm<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    let saved_cr0 = state.cr0;
    let saved_flags = state.flags.get();
    let saved_eip = state.eip;
    let saved_gpr = state.gpr;
    let saved_segs = state.segs;
    let saved_cr3 = state.cr3;

    // Switch addressing to SMM-real first so the save-frame stores go
    // straight to physical SMRAM.
    state.in_smm = true;
    state.halted = false;
    state.cr0 &= !(CR0_PE | CR0_EM | CR0_TS | CR0_PG);
    state.flags.set_all(flags::FIXED_SET);
    bus.smm_changed(true);
    bus.flush_tlb();
    bus.sync(state);

    let base = state.smbase;
    let w = |bus: &mut B, off: u32, value: u32| bus.write_u32(base.wrapping_add(off), value);
    w(bus, slot::CR0, saved_cr0)?;
    w(bus, slot::CR3, saved_cr3)?;
    w(bus, slot::EFLAGS, saved_flags)?;
    w(bus, slot::EIP, saved_eip)?;
    w(bus, slot::EAX, saved_gpr[0])?;
    w(bus, slot::ECX, saved_gpr[1])?;
    w(bus, slot::EDX, saved_gpr[2])?;
    w(bus, slot::EBX, saved_gpr[3])?;
    w(bus, slot::ESP, saved_gpr[4])?;
    w(bus, slot::EBP, saved_gpr[5])?;
    w(bus, slot::ESI, saved_gpr[6])?;
    w(bus, slot::EDI, saved_gpr[7])?;
    w(bus, slot::ES, saved_segs[sr::ES].selector.into())?;
    w(bus, slot::CS, saved_segs[sr::CS].selector.into())?;
    w(bus, slot::SS, saved_segs[sr::SS].selector.into())?;
    w(bus, slot::DS, saved_segs[sr::DS].selector.into())?;
    w(bus, slot::FS, saved_segs[sr::FS].selector.into())?;
    w(bus, slot::GS, saved_segs[sr::GS].selector.into())?;
    w(bus, slot::REVISION, SMM_REVISION)?;
    w(bus, slot::SMBASE, base)?;
    for (n, seg) in saved_segs.iter().enumerate() {
        let off = slot::SEG_CACHE + 12 * n as u32;
        w(bus, off, seg.base)?;
        w(bus, off + 4, seg.limit)?;
        let attrs = u32::from(seg.access)
            | (u32::from(seg.attrib) << 8)
            | (u32::from(seg.valid) << 16);
        w(bus, off + 8, attrs)?;
    }

    for idx in [sr::ES, sr::SS, sr::DS, sr::FS, sr::GS] {
        state.segs[idx] = smm_segment(0);
    }
    state.segs[sr::CS] = smm_segment(base);
    state.eip = 0x8000;
    log::trace!("SMI: entered SMM, handler at {:#x}", base + 0x8000);
    Ok(())
}

/// RSM: restore the saved frame and drop the overlay.
pub fn resume_from_smm<B: CpuBus>(state: &mut CpuState, bus: &mut B) {
    let base = state.smbase;
    let mut r = |off: u32| -> u32 {
        bus.read_u32(base.wrapping_add(off)).unwrap_or(0)
    };

    let cr0 = r(slot::CR0);
    let cr3 = r(slot::CR3);
    let eflags = r(slot::EFLAGS);
    let eip = r(slot::EIP);
    let gpr = [
        r(slot::EAX),
        r(slot::ECX),
        r(slot::EDX),
        r(slot::EBX),
        r(slot::ESP),
        r(slot::EBP),
        r(slot::ESI),
        r(slot::EDI),
    ];
    let selectors = [
        r(slot::ES) as u16,
        r(slot::CS) as u16,
        r(slot::SS) as u16,
        r(slot::DS) as u16,
        r(slot::FS) as u16,
        r(slot::GS) as u16,
    ];
    let new_smbase = r(slot::SMBASE);

    state.cr0 = cr0;
    state.cr3 = cr3;
    state.flags.set_all(eflags);
    state.eip = eip;
    state.gpr = gpr;
    // Descriptor caches come back from the hidden frame so a protected-mode
    // interruptee resumes with exactly its pre-SMI segment state.
    let frame_selectors = [
        (sr::ES, selectors[0]),
        (sr::CS, selectors[1]),
        (sr::SS, selectors[2]),
        (sr::DS, selectors[3]),
        (sr::FS, selectors[4]),
        (sr::GS, selectors[5]),
    ];
    for (idx, sel) in frame_selectors {
        if cr0 & CR0_PE != 0 {
            let off = slot::SEG_CACHE + 12 * idx as u32;
            let seg_base = r(off);
            let seg_limit = r(off + 4);
            let attrs = r(off + 8);
            state.segs[idx] = SegmentReg {
                selector: sel,
                base: seg_base,
                limit: seg_limit,
                access: attrs as u8,
                attrib: (attrs >> 8) as u8,
                valid: attrs & 0x1_0000 != 0,
            };
        } else {
            state.segs[idx] = SegmentReg::real_mode(sel);
        }
    }
    state.smbase = new_smbase;
    state.in_smm = false;
    bus.smm_changed(false);
    bus.flush_tlb();
    bus.sync(state);
    log::trace!("RSM: resumed at {:#x}:{:#x}", selectors[1], eip);
}
