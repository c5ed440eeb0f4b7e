//! The block scanner: measures a straight-line run from an entry point,
//! classifying where and why it ends. Instruction lengths are computed by a
//! decode-only pass (prefixes, ModR/M/SIB, immediates); nothing is executed.

/// Length cap per block, in bytes.
pub const MAX_BLOCK_BYTES: u32 = 1024;
/// Cap on instructions per block.
pub const MAX_BLOCK_INSTRUCTIONS: u32 = 128;

const PAGE_MASK: u32 = 0xFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Branch, call, return, software interrupt, far transfer.
    Branch,
    Halt,
    /// Mode-changing or table-loading instruction; translation state may
    /// shift under us.
    Serializing,
    /// Crossing into the next physical page.
    PageBoundary,
    /// Byte or instruction cap reached.
    LengthCap,
    /// An opcode the block tier always hands to the interpreter (the
    /// group-5 PUSH sub-case is the documented one: the original
    /// recompiler's opFF helpers never carried it, so this tier forwards
    /// sub-opcode /6 unconditionally).
    InterpreterFallback,
    /// Ran off fetchable memory.
    FetchFailed,
}

#[derive(Debug, Clone)]
pub struct BlockScan {
    pub byte_len: u32,
    pub instruction_count: u32,
    pub terminator: Terminator,
    /// Last instruction was STI or a MOV/POP SS: interrupt sampling after
    /// the block must honor the shadow.
    pub ends_with_inhibit: bool,
}

struct Cursor<F> {
    fetch: F,
    pos: u32,
}

impl<F: FnMut(u32) -> Option<u8>> Cursor<F> {
    fn next(&mut self) -> Option<u8> {
        let b = (self.fetch)(self.pos)?;
        self.pos = self.pos.wrapping_add(1);
        Some(b)
    }

    fn skip(&mut self, n: u32) -> Option<()> {
        for _ in 0..n {
            self.next()?;
        }
        Some(())
    }
}

/// ModR/M (+SIB/displacement) length, excluding the ModR/M byte itself.
fn modrm_tail<F: FnMut(u32) -> Option<u8>>(cur: &mut Cursor<F>, addr32: bool) -> Option<u8> {
    let modrm = cur.next()?;
    let md = modrm >> 6;
    let rm = modrm & 7;
    let disp: u32 = if addr32 {
        match (md, rm) {
            (3, _) => 0,
            (0, 4) => {
                let sib = cur.next()?;
                if sib & 7 == 5 {
                    4
                } else {
                    0
                }
            }
            (0, 5) => 4,
            (0, _) => 0,
            (1, 4) => {
                cur.next()?;
                1
            }
            (1, _) => 1,
            (2, 4) => {
                cur.next()?;
                4
            }
            _ => 4,
        }
    } else {
        match (md, rm) {
            (3, _) => 0,
            (0, 6) => 2,
            (0, _) => 0,
            (1, _) => 1,
            _ => 2,
        }
    };
    cur.skip(u32::from(disp))?;
    Some(modrm)
}

enum Step {
    Plain { inhibit: bool },
    End(Terminator),
}

fn scan_one<F: FnMut(u32) -> Option<u8>>(cur: &mut Cursor<F>, default32: bool) -> Option<Step> {
    let mut opsize32 = default32;
    let mut addrsize32 = default32;

    let opcode = loop {
        match cur.next()? {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            0x66 => opsize32 = !default32,
            0x67 => addrsize32 = !default32,
            byte => break byte,
        }
    };
    let iv: u32 = if opsize32 { 4 } else { 2 };
    let av: u32 = if addrsize32 { 4 } else { 2 };

    let step = match opcode {
        // ALU block with ModR/M.
        0x00..=0x3F if (opcode & 7) < 4 => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0x06 | 0x07 | 0x0E | 0x16 | 0x1E | 0x1F | 0x27 | 0x2F | 0x37 | 0x3F => {
            Step::Plain { inhibit: false }
        }
        // POP SS inhibits the next boundary.
        0x17 => Step::Plain { inhibit: true },
        0x0F => return scan_two_byte(cur, addrsize32, opsize32),
        0x40..=0x61 => Step::Plain { inhibit: false },
        0x62 | 0x63 => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0x68 => {
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0x69 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0x6A => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0x6B => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0x6C..=0x6F => Step::Plain { inhibit: false },
        0x70..=0x7F => {
            cur.skip(1)?;
            Step::End(Terminator::Branch)
        }
        0x80 | 0x82 | 0x83 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0x81 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0x84..=0x8D => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0x8E => {
            let modrm = modrm_tail(cur, addrsize32)?;
            Step::Plain {
                inhibit: (modrm >> 3) & 7 == 2,
            }
        }
        0x8F => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0x90..=0x99 => Step::Plain { inhibit: false },
        0x9A => {
            cur.skip(iv + 2)?;
            Step::End(Terminator::Branch)
        }
        0x9B..=0x9F => Step::Plain { inhibit: false },
        0xA0..=0xA3 => {
            cur.skip(av)?;
            Step::Plain { inhibit: false }
        }
        0xA4..=0xA7 => Step::Plain { inhibit: false },
        0xA8 => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xA9 => {
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0xAA..=0xAF => Step::Plain { inhibit: false },
        0xB0..=0xB7 => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xB8..=0xBF => {
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0xC0 | 0xC1 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xC2 => {
            cur.skip(2)?;
            Step::End(Terminator::Branch)
        }
        0xC3 => Step::End(Terminator::Branch),
        0xC4 | 0xC5 => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0xC6 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xC7 => {
            modrm_tail(cur, addrsize32)?;
            cur.skip(iv)?;
            Step::Plain { inhibit: false }
        }
        0xC8 => {
            cur.skip(3)?;
            Step::Plain { inhibit: false }
        }
        0xC9 => Step::Plain { inhibit: false },
        0xCA => {
            cur.skip(2)?;
            Step::End(Terminator::Branch)
        }
        0xCB | 0xCC | 0xCE | 0xCF => Step::End(Terminator::Branch),
        0xCD => {
            cur.skip(1)?;
            Step::End(Terminator::Branch)
        }
        0xD0..=0xD3 => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0xD4 | 0xD5 => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xD6 | 0xD7 => Step::Plain { inhibit: false },
        0xD8..=0xDF => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0xE0..=0xE3 => {
            cur.skip(1)?;
            Step::End(Terminator::Branch)
        }
        0xE4 | 0xE5 | 0xE6 | 0xE7 => {
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xE8 | 0xE9 => {
            cur.skip(iv)?;
            Step::End(Terminator::Branch)
        }
        0xEA => {
            cur.skip(iv + 2)?;
            Step::End(Terminator::Branch)
        }
        0xEB => {
            cur.skip(1)?;
            Step::End(Terminator::Branch)
        }
        0xEC..=0xEF => Step::Plain { inhibit: false },
        0xF1 => Step::End(Terminator::Branch),
        0xF4 => Step::End(Terminator::Halt),
        0xF5 => Step::Plain { inhibit: false },
        0xF6 => {
            let modrm = modrm_tail(cur, addrsize32)?;
            if (modrm >> 3) & 7 <= 1 {
                cur.skip(1)?;
            }
            Step::Plain { inhibit: false }
        }
        0xF7 => {
            let modrm = modrm_tail(cur, addrsize32)?;
            if (modrm >> 3) & 7 <= 1 {
                cur.skip(iv)?;
            }
            Step::Plain { inhibit: false }
        }
        0xF8 | 0xF9 | 0xFA | 0xFC | 0xFD => Step::Plain { inhibit: false },
        0xFB => Step::Plain { inhibit: true }, // STI shadow
        0xFE => {
            modrm_tail(cur, addrsize32)?;
            Step::Plain { inhibit: false }
        }
        0xFF => {
            let modrm = modrm_tail(cur, addrsize32)?;
            match (modrm >> 3) & 7 {
                2..=5 => Step::End(Terminator::Branch),
                6 => Step::End(Terminator::InterpreterFallback),
                _ => Step::Plain { inhibit: false },
            }
        }
        _ => Step::End(Terminator::InterpreterFallback),
    };
    Some(step)
}

fn scan_two_byte<F: FnMut(u32) -> Option<u8>>(
    cur: &mut Cursor<F>,
    addr32: bool,
    opsize32: bool,
) -> Option<Step> {
    let iv: u32 = if opsize32 { 4 } else { 2 };
    let opcode = cur.next()?;
    let step = match opcode {
        0x00 | 0x01 | 0x20..=0x23 => {
            modrm_tail(cur, addr32)?;
            Step::End(Terminator::Serializing)
        }
        0x02 | 0x03 => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0x05 | 0x07 | 0xAA => Step::End(Terminator::Serializing),
        0x06 | 0x08 | 0x09 => Step::Plain { inhibit: false },
        0x30..=0x32 => Step::End(Terminator::Serializing),
        0x40..=0x4F => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0x60..=0x6F => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0x71..=0x73 => {
            modrm_tail(cur, addr32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0x74..=0x77 | 0x7E | 0x7F => {
            if opcode == 0x77 {
                Step::Plain { inhibit: false }
            } else {
                modrm_tail(cur, addr32)?;
                Step::Plain { inhibit: false }
            }
        }
        0x80..=0x8F => {
            cur.skip(iv)?;
            Step::End(Terminator::Branch)
        }
        0x90..=0x9F => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xA0 | 0xA1 | 0xA8 | 0xA9 | 0xA2 => Step::Plain { inhibit: false },
        0xA3 | 0xAB | 0xB3 | 0xBB | 0xAF | 0xB0 | 0xB1 | 0xC0 | 0xC1 => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xA4 | 0xAC => {
            modrm_tail(cur, addr32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xA5 | 0xAD => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xB2 | 0xB4 | 0xB5 => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xB6 | 0xB7 | 0xBE | 0xBF | 0xBC | 0xBD => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xBA => {
            modrm_tail(cur, addr32)?;
            cur.skip(1)?;
            Step::Plain { inhibit: false }
        }
        0xC7 => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        0xC8..=0xCF => Step::Plain { inhibit: false },
        0xD1..=0xD3 | 0xD5 | 0xD8..=0xDF | 0xE1 | 0xE2 | 0xE5 | 0xE8..=0xEF | 0xF1..=0xF3
        | 0xF5..=0xFE => {
            modrm_tail(cur, addr32)?;
            Step::Plain { inhibit: false }
        }
        _ => Step::End(Terminator::InterpreterFallback),
    };
    Some(step)
}

/// Measures a block starting at `entry` (a linear address; `fetch` resolves
/// bytes or reports unmapped).
pub fn scan_block<F: FnMut(u32) -> Option<u8>>(
    mut fetch: F,
    entry: u32,
    code32: bool,
) -> BlockScan {
    let mut cur = Cursor {
        fetch: &mut fetch,
        pos: entry,
    };
    let mut count = 0u32;
    let mut inhibit = false;

    loop {
        let before = cur.pos;
        match scan_one(&mut cur, code32) {
            None => {
                return BlockScan {
                    byte_len: before.wrapping_sub(entry),
                    instruction_count: count,
                    terminator: Terminator::FetchFailed,
                    ends_with_inhibit: inhibit,
                };
            }
            Some(Step::End(Terminator::InterpreterFallback)) => {
                // The fallback instruction is not part of the block.
                return BlockScan {
                    byte_len: before.wrapping_sub(entry),
                    instruction_count: count,
                    terminator: Terminator::InterpreterFallback,
                    ends_with_inhibit: inhibit,
                };
            }
            Some(Step::End(t)) => {
                return BlockScan {
                    byte_len: cur.pos.wrapping_sub(entry),
                    instruction_count: count + 1,
                    terminator: t,
                    ends_with_inhibit: false,
                };
            }
            Some(Step::Plain { inhibit: this_inhibit }) => {
                count += 1;
                inhibit = this_inhibit;
            }
        }
        if cur.pos.wrapping_sub(entry) >= MAX_BLOCK_BYTES || count >= MAX_BLOCK_INSTRUCTIONS {
            return BlockScan {
                byte_len: cur.pos.wrapping_sub(entry),
                instruction_count: count,
                terminator: Terminator::LengthCap,
                ends_with_inhibit: inhibit,
            };
        }
        if (cur.pos & !PAGE_MASK) != (entry & !PAGE_MASK) {
            return BlockScan {
                byte_len: cur.pos.wrapping_sub(entry),
                instruction_count: count,
                terminator: Terminator::PageBoundary,
                ends_with_inhibit: inhibit,
            };
        }
    }
}
