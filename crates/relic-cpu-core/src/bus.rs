//! The CPU's view of the outside world.
//!
//! Addresses given to the bus are linear; paging, A20 masking, and the
//! physical memory map live behind the implementation. Every access returns
//! `Result` so a fault short-circuits the instruction via `?` and the
//! dispatch loop delivers it once.

use crate::exceptions::Exception;
use crate::state::CpuState;

pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception>;
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception>;

    /// Instruction fetch; implementations may apply execute-intent paging
    /// checks or feed a prefetch model.
    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.read_u8(addr)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        Ok(u16::from_le_bytes([
            self.read_u8(addr)?,
            self.read_u8(addr.wrapping_add(1))?,
        ]))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        Ok(u32::from(self.read_u16(addr)?) | (u32::from(self.read_u16(addr.wrapping_add(2))?) << 16))
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64, Exception> {
        Ok(u64::from(self.read_u32(addr)?) | (u64::from(self.read_u32(addr.wrapping_add(4))?) << 32))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), Exception> {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo)?;
        self.write_u8(addr.wrapping_add(1), hi)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Exception> {
        self.write_u16(addr, value as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), Exception> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);

    /// Ingest control-register/privilege changes (CR0/CR3/CR4, CPL). Called
    /// after events that change translation state.
    fn sync(&mut self, state: &CpuState);

    fn invlpg(&mut self, _addr: u32) {}

    fn flush_tlb(&mut self) {}

    /// SMRAM overlay switch on SMI entry / RSM.
    fn smm_changed(&mut self, _in_smm: bool) {}
}
