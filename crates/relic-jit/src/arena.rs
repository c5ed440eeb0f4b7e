//! Storage for compiled-block images: a bump allocator leasing fixed-size
//! chunks out of one arena. Exhaustion is not an error the caller must
//! handle beyond evicting the whole cache and starting over.

use thiserror::Error;

/// Lease granularity.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("code arena exhausted ({used}/{capacity} bytes in use)")]
    Exhausted { used: usize, capacity: usize },
    #[error("block of {len} bytes exceeds the arena chunking limit")]
    Oversized { len: usize },
}

pub struct CodeArena {
    bytes: Vec<u8>,
    bump: usize,
}

impl CodeArena {
    /// `capacity` is rounded up to whole chunks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
        Self {
            bytes: vec![0; capacity],
            bump: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.bump
    }

    /// Stores a block image, returning its arena offset.
    pub fn store(&mut self, image: &[u8]) -> Result<u32, ArenaError> {
        if image.len() > CHUNK_SIZE * 4 {
            return Err(ArenaError::Oversized { len: image.len() });
        }
        let lease = image.len().div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
        if self.bump + lease > self.bytes.len() {
            return Err(ArenaError::Exhausted {
                used: self.bump,
                capacity: self.bytes.len(),
            });
        }
        let offset = self.bump;
        self.bytes[offset..offset + image.len()].copy_from_slice(image);
        self.bump += lease;
        Ok(offset as u32)
    }

    pub fn get(&self, offset: u32, len: u32) -> &[u8] {
        &self.bytes[offset as usize..offset as usize + len as usize]
    }

    /// Whole-arena release; every stored offset becomes invalid.
    pub fn clear(&mut self) {
        self.bump = 0;
    }
}
