use std::{vec, vec::Vec};

use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind};
use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};

use crate::mock::{Clock, WearTracker};

pub const FLASH_SIZE: usize = 0x4000;
pub const SECTOR_SIZE: usize = 0x400;

/// Ticks a single sector erase takes.
pub const ERASE_TICKS: u64 = 20;

#[derive(Debug)]
pub struct MockError(NorFlashErrorKind);

impl NorFlashError for MockError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// In-memory NOR flash with a program unit of `WRITE` bytes.
///
/// Erasing sets bits, programming can only clear them.
/// Like flash with ECC, every word may be programmed only once between two erases.
pub struct MockFlash<const WRITE: usize = 4> {
    pub memory: Vec<u8>,
    pub wear: WearTracker,
    /// Number of program operations performed.
    pub writes: usize,
    /// Number of attempts to program a word that was already programmed since its last erase.
    pub rewrites: usize,
    pub fail_erase: bool,
    pub fail_write: bool,
    pub fail_read: bool,
    /// Program a flipped bit at the start of every write, without reporting an error.
    pub corrupt_write: bool,
    programmed: Vec<bool>,
    clock: Clock,
}

impl MockFlash {
    pub fn new() -> Self {
        Self::with_write_size()
    }
}

impl<const WRITE: usize> MockFlash<WRITE> {
    pub fn with_write_size() -> Self {
        Self {
            memory: vec![0xFF; FLASH_SIZE],
            wear: WearTracker::new(),
            writes: 0,
            rewrites: 0,
            fail_erase: false,
            fail_write: false,
            fail_read: false,
            corrupt_write: false,
            programmed: vec![false; FLASH_SIZE / WRITE],
            clock: Clock::default(),
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    fn range(&self, offset: u32, len: usize, align: usize) -> Result<core::ops::Range<usize>, MockError> {
        let start = offset as usize;
        if start % align != 0 || len % align != 0 {
            return Err(MockError(NorFlashErrorKind::NotAligned));
        }
        if start + len > self.memory.len() {
            return Err(MockError(NorFlashErrorKind::OutOfBounds));
        }
        Ok(start..start + len)
    }
}

impl<const WRITE: usize> ErrorType for MockFlash<WRITE> {
    type Error = MockError;
}

impl<const WRITE: usize> ReadNorFlash for MockFlash<WRITE> {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len(), Self::READ_SIZE)?;
        if self.fail_read {
            return Err(MockError(NorFlashErrorKind::Other));
        }

        bytes.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }
}

impl<const WRITE: usize> NorFlash for MockFlash<WRITE> {
    const WRITE_SIZE: usize = WRITE;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let range = self.range(from, to.saturating_sub(from) as usize, Self::ERASE_SIZE)?;
        if self.fail_erase {
            return Err(MockError(NorFlashErrorKind::Other));
        }

        for sector in range.step_by(Self::ERASE_SIZE) {
            self.clock.set(self.clock.get() + ERASE_TICKS);
            self.memory[sector..sector + Self::ERASE_SIZE].fill(0xFF);
            self.programmed[sector / WRITE..(sector + Self::ERASE_SIZE) / WRITE].fill(false);
            self.wear.increase(sector as u32);
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len(), Self::WRITE_SIZE)?;
        if self.fail_write {
            return Err(MockError(NorFlashErrorKind::Other));
        }

        let words = &mut self.programmed[range.start / WRITE..range.end / WRITE];
        if words.iter().any(|programmed| *programmed) {
            self.rewrites += 1;
            return Err(MockError(NorFlashErrorKind::Other));
        }

        let target = &mut self.memory[range];
        if target.iter().zip(bytes).any(|(old, new)| old & new != *new) {
            // Programming cannot turn a 0 back into a 1.
            return Err(MockError(NorFlashErrorKind::Other));
        }
        target.copy_from_slice(bytes);
        words.fill(true);
        if self.corrupt_write {
            if let Some(first) = target.first_mut() {
                *first ^= 0x01;
            }
        }

        self.writes += 1;
        self.clock.set(self.clock.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_programmed_once_per_erase() {
        let mut flash = MockFlash::new();

        embassy_futures::block_on(async {
            flash.write(0x10, &[0xF0; 8]).await.unwrap();
            // Same value, still a second program of the word.
            assert!(flash.write(0x14, &[0xF0; 4]).await.is_err());
            assert_eq!(flash.rewrites, 1);

            flash.erase(0x0, 0x400).await.unwrap();
            flash.write(0x14, &[0x0F; 4]).await.unwrap();
        });

        assert_eq!(flash.memory[0x10..0x18], [0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 0x0F, 0x0F, 0x0F]);
        assert_eq!(flash.writes, 2);
    }
}
