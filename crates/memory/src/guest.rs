use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of range: {addr:#x}+{len:#x} (size {size:#x})")]
    OutOfRange { addr: u64, len: u64, size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Flat guest RAM backing store.
///
/// The machine owner may substitute its own implementation (tracking, sparse,
/// shared) as long as reads and writes are plain byte copies.
pub trait GuestMemory {
    fn size(&self) -> u64;
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;
    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;
}

/// Heap-allocated contiguous RAM.
pub struct DenseMemory {
    bytes: Box<[u8]>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::OutOfRange {
            addr: 0,
            len: size,
            size: 0,
        })?;
        Ok(Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        })
    }

    fn check(&self, paddr: u64, len: usize) -> GuestMemoryResult<usize> {
        let start = usize::try_from(paddr).ok();
        match start {
            Some(start) if start.checked_add(len).is_some_and(|end| end <= self.bytes.len()) => {
                Ok(start)
            }
            _ => Err(GuestMemoryError::OutOfRange {
                addr: paddr,
                len: len as u64,
                size: self.bytes.len() as u64,
            }),
        }
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let start = self.check(paddr, dst.len())?;
        dst.copy_from_slice(&self.bytes[start..start + dst.len()]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let start = self.check(paddr, src.len())?;
        self.bytes[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}
