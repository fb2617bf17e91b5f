//! Non-volatile memory driver.
//!
//! Requests are checked against the [Layout] before any flash access.
//! Writes are staged in a `BLOCK` sized buffer aligned to the flash. Once a write moves on to another block,
//! or when the session is finalized, the bytes staged into it are programmed and read back.
//! This allows the host to send chunks of any size and alignment.
//!
//! Only the staged bytes, rounded out to the program unit, are ever programmed,
//! so every word of a sequentially written image is programmed once per erase.
//!
//! Every operation services the [Watchdog] at least once per sector erased, block programmed or chunk read.

use core::ops::Range;

use embedded_storage_async::nor_flash::NorFlash;

use crate::{
    Address, Error, Watchdog,
    checksum::{self, CHUNK_SIZE, Checksum, Crc32, Digest},
    layout::{Access, Layout, LayoutError, TRAILER_SIZE, TrailerPolicy},
};

/// Trailer value of an erased flash.
const ERASED_WORD: u32 = 0xFFFF_FFFF;

struct Block<const N: usize> {
    /// Flash offset of the staged block, if any.
    offset: Option<u32>,
    /// Bytes staged since the block was loaded.
    dirty: Option<Range<usize>>,
    data: [u8; N],
}

impl<const N: usize> Block<N> {
    /// Whether `staged` touches the dirty range, in program units of `unit` bytes.
    fn adjoins(&self, staged: &Range<usize>, unit: usize) -> bool {
        let Some(dirty) = &self.dirty else {
            return true;
        };
        let (dirty, staged) = (round_out(dirty, unit), round_out(staged, unit));
        staged.start <= dirty.end && dirty.start <= staged.end
    }

    fn mark(&mut self, staged: Range<usize>) {
        self.dirty = Some(match self.dirty.take() {
            Some(dirty) => dirty.start.min(staged.start)..dirty.end.max(staged.end),
            None => staged,
        });
    }
}

/// NVM driver for a flash device `F`, servicing `W` during long operations.
///
/// Operations take `&mut self`, so no operation can be issued while another is in progress.
pub struct Nvm<F, W, C = Crc32, const BLOCK: usize = 512> {
    flash: F,
    watchdog: W,
    checksum: C,
    layout: Layout,
    block: Block<BLOCK>,
}

impl<F, W, C, const BLOCK: usize> Nvm<F, W, C, BLOCK>
where
    F: NorFlash,
    W: Watchdog,
    C: Checksum,
{
    /// Bind a layout to a flash device.
    ///
    /// Every region must be sector aligned and within the device,
    /// so that erasing the sectors a request touches never reaches outside of its region.
    /// The trailer must be a whole number of program units, so it shares none with the image body.
    pub fn new(flash: F, watchdog: W, checksum: C, layout: Layout) -> Result<Self, LayoutError> {
        if BLOCK == 0
            || BLOCK % F::WRITE_SIZE != 0
            || BLOCK % F::READ_SIZE != 0
            || F::ERASE_SIZE % BLOCK != 0
            || CHUNK_SIZE % F::READ_SIZE != 0
            || TRAILER_SIZE as usize % F::READ_SIZE != 0
            || TRAILER_SIZE as usize % F::WRITE_SIZE != 0
        {
            return Err(LayoutError::Misaligned);
        }

        let capacity = flash.capacity() as u64;
        for (_, region) in layout.regions() {
            let offset = layout.offset(region.base);
            if offset as usize % F::ERASE_SIZE != 0 || region.length as usize % F::ERASE_SIZE != 0 {
                return Err(LayoutError::Misaligned);
            }
            if u64::from(offset) + u64::from(region.length) > capacity {
                return Err(LayoutError::Capacity);
            }
        }

        Ok(Self {
            flash,
            watchdog,
            checksum,
            layout,
            block: Block {
                offset: None,
                dirty: None,
                data: [0xFF; BLOCK],
            },
        })
    }

    /// Start a programming session, discarding anything staged but not yet programmed.
    pub fn init(&mut self) {
        debug!("nvm init");
        self.block.offset = None;
        self.block.dirty = None;
    }

    /// Write `data` at `address`.
    ///
    /// The data is staged and may only reach the flash on a later write or on [Nvm::finalize].
    /// Hardware failures of staged data are reported by the operation that programs it.
    pub async fn write(&mut self, address: Address, data: &[u8]) -> Result<(), Error> {
        let length = u32::try_from(data.len()).map_err(|_| Error::OutOfRange)?;
        let purpose = self.layout.check(address, length, Access::Write)?;
        debug!("write {:#x} ({:#x} bytes) in {:?}", address, length, purpose);

        self.stage(self.layout.offset(address), data).await
    }

    /// Erase every sector intersecting `[address, address + length)`.
    ///
    /// Sector granularity means bytes next to the range are erased as well when it is not sector aligned.
    pub async fn erase(&mut self, address: Address, length: u32) -> Result<(), Error> {
        let purpose = self.layout.check(address, length, Access::Erase)?;
        debug!("erase {:#x} ({:#x} bytes) in {:?}", address, length, purpose);

        let sector = F::ERASE_SIZE as u32;
        let offset = self.layout.offset(address);
        let first = offset - offset % sector;
        let end = (offset + length).next_multiple_of(sector);

        match self.block.offset {
            // A staged block lies within a single sector, so it is either entirely erased or not at all.
            Some(staged) if (first..end).contains(&staged) => {
                self.block.offset = None;
                self.block.dirty = None;
            }
            _ => self.flush().await?,
        }

        for from in (first..end).step_by(F::ERASE_SIZE) {
            trace!("erase sector {:#x}", from);
            self.watchdog.service();
            self.flash
                .erase(from, from + sector)
                .await
                .map_err(|_| hardware(from))?;
        }
        self.watchdog.service();

        Ok(())
    }

    /// Read `buffer.len()` bytes at `address` from any recognized region.
    ///
    /// Staged data that has not been programmed yet is not visible.
    pub async fn read(&mut self, address: Address, buffer: &mut [u8]) -> Result<(), Error> {
        let length = u32::try_from(buffer.len()).map_err(|_| Error::OutOfRange)?;
        self.layout.check(address, length, Access::Read)?;

        let offset = self.layout.offset(address);
        self.flash
            .read(offset, buffer)
            .await
            .map_err(|_| hardware(offset))
    }

    /// Whether the application image matches its checksum trailer.
    ///
    /// Recomputed from the flash contents on every call. Read failures count as a mismatch.
    pub async fn verify_checksum(&mut self) -> bool {
        let expected = match self.read_trailer().await {
            Ok(expected) => expected,
            Err(_) => return false,
        };
        let digest = match self.digest().await {
            Ok(digest) => digest,
            Err(_) => return false,
        };

        let valid = digest.matches(expected);
        debug!(
            "checksum {:#x}, trailer {:#x}, blank {}: valid {}",
            digest.value, expected, digest.blank, valid
        );
        valid
    }

    /// Finish a programming session.
    ///
    /// Programs whatever is still staged, then writes the checksum trailer.
    /// With [TrailerPolicy::HostWritable] a trailer already programmed by the host is left as-is.
    /// A trailer already holding the checksum is not programmed again.
    pub async fn finalize(&mut self) -> Result<(), Error> {
        self.flush().await?;

        let stored = self.read_trailer().await?;
        if self.layout.trailer_policy() == TrailerPolicy::HostWritable && stored != ERASED_WORD {
            info!("keeping trailer {:#x} written by host", stored);
            return Ok(());
        }

        let digest = self.digest().await?;
        if digest.blank {
            warn!("finalizing a blank image, it will not boot");
        }
        if stored == digest.value {
            info!("image already finalized with checksum {:#x}", stored);
            return Ok(());
        }

        let trailer = self.layout.trailer();
        self.stage(self.layout.offset(trailer.base), &digest.value.to_le_bytes())
            .await?;
        self.flush().await?;

        info!("image finalized with checksum {:#x}", digest.value);
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Give back the flash device and watchdog. Anything staged is dropped.
    pub fn release(self) -> (F, W) {
        (self.flash, self.watchdog)
    }

    /// Copy `data` into the staging block(s) starting at flash `offset`.
    async fn stage(&mut self, mut offset: u32, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let base = offset - offset % BLOCK as u32;
            let start = (offset - base) as usize;
            let len = data.len().min(BLOCK - start);
            let staged = start..start + len;

            // Staged bytes are programmed as one range, which must not cover words programmed before.
            if self.block.offset != Some(base) || !self.block.adjoins(&staged, F::WRITE_SIZE) {
                self.flush().await?;
                self.load(base).await?;
            }

            self.block.data[staged.clone()].copy_from_slice(&data[..len]);
            self.block.mark(staged);
            self.watchdog.service();

            data = &data[len..];
            offset += len as u32;
        }

        Ok(())
    }

    /// Fill the staging block with the current contents of the flash block at `base`.
    async fn load(&mut self, base: u32) -> Result<(), Error> {
        trace!("load block {:#x}", base);
        self.flash
            .read(base, &mut self.block.data)
            .await
            .map_err(|_| hardware(base))?;
        self.block.offset = Some(base);
        self.block.dirty = None;
        Ok(())
    }

    /// Program the bytes staged into the block, if any, and read them back.
    async fn flush(&mut self) -> Result<(), Error> {
        let Some(base) = self.block.offset.take() else {
            return Ok(());
        };
        let Some(dirty) = self.block.dirty.take() else {
            return Ok(());
        };

        let program = round_out(&dirty, F::WRITE_SIZE);
        let offset = base + program.start as u32;
        trace!("program {:#x} ({:#x} bytes)", offset, program.len());
        self.watchdog.service();
        self.flash
            .write(offset, &self.block.data[program])
            .await
            .map_err(|_| hardware(offset))?;
        self.watchdog.service();

        let verify = round_out(&dirty, F::READ_SIZE);
        let mut buffer = [0u8; CHUNK_SIZE];
        for (index, expected) in self.block.data[verify.clone()].chunks(CHUNK_SIZE).enumerate() {
            let offset = base + (verify.start + index * CHUNK_SIZE) as u32;
            let actual = &mut buffer[..expected.len()];
            self.flash
                .read(offset, actual)
                .await
                .map_err(|_| hardware(offset))?;
            if actual[..] != expected[..] {
                warn!("read back mismatch in block {:#x}", base);
                return Err(Error::Hardware);
            }
        }
        self.watchdog.service();

        Ok(())
    }

    async fn read_trailer(&mut self) -> Result<u32, Error> {
        let offset = self.layout.offset(self.layout.trailer().base);
        let mut bytes = [0u8; TRAILER_SIZE as usize];
        self.flash
            .read(offset, &mut bytes)
            .await
            .map_err(|_| hardware(offset))?;
        Ok(u32::from_le_bytes(bytes))
    }

    async fn digest(&mut self) -> Result<Digest, Error> {
        let image = self.layout.image();
        let offset = self.layout.offset(image.base);
        checksum::digest(
            &mut self.flash,
            &mut self.watchdog,
            &self.checksum,
            offset,
            image.length,
        )
        .await
        .map_err(|_| hardware(offset))
    }
}

/// Widen `range` to whole units of `unit` bytes.
fn round_out(range: &Range<usize>, unit: usize) -> Range<usize> {
    range.start - range.start % unit..range.end.next_multiple_of(unit)
}

fn hardware(offset: u32) -> Error {
    warn!("flash operation failed at offset {:#x}", offset);
    Error::Hardware
}
