//! Flat-memory test bus: linear == physical, recorded port I/O.

use relic_cpu_core::{CpuBus, CpuState, Exception};

pub struct FlatBus {
    pub mem: Vec<u8>,
    pub io_reads: Vec<(u16, u8)>,
    pub io_writes: Vec<(u16, u8, u32)>,
    pub io_read_value: u32,
}

impl FlatBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            io_reads: Vec::new(),
            io_writes: Vec::new(),
            io_read_value: 0xFFFF_FFFF,
        }
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        self.mem[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
    }
}

impl CpuBus for FlatBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.mem
            .get(addr as usize)
            .copied()
            .ok_or(Exception::gp0())
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception> {
        match self.mem.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Exception::gp0()),
        }
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.io_reads.push((port, size));
        self.io_read_value
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.io_writes.push((port, size, value));
    }

    fn sync(&mut self, _state: &CpuState) {}
}
