//! Integrity checksum over the application image.
//!
//! The expected value lives in the trailer at the end of the application region, little-endian.
//! Whichever algorithm is configured, the same one computes the value on finalization and checks it at boot.

use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage_async::nor_flash::ReadNorFlash;

use crate::Watchdog;

/// Number of bytes read from flash between two watchdog services.
pub(crate) const CHUNK_SIZE: usize = 64;

/// Checksum algorithm producing a 32-bit value.
pub trait Checksum {
    type State;

    fn start(&self) -> Self::State;

    fn update(&self, state: &mut Self::State, bytes: &[u8]);

    fn finish(&self, state: Self::State) -> u32;
}

static CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC, as used by zlib and Ethernet).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    type State = crc::Digest<'static, u32>;

    fn start(&self) -> Self::State {
        CRC_32.digest()
    }

    fn update(&self, state: &mut Self::State, bytes: &[u8]) {
        state.update(bytes);
    }

    fn finish(&self, state: Self::State) -> u32 {
        state.finalize()
    }
}

/// Two's complement of the wrapping 32-bit sum of all bytes.
///
/// Adding the stored value to the byte sum of an intact image yields zero.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default)]
pub struct Additive;

impl Checksum for Additive {
    type State = u32;

    fn start(&self) -> Self::State {
        0
    }

    fn update(&self, state: &mut Self::State, bytes: &[u8]) {
        *state = bytes
            .iter()
            .fold(*state, |sum, byte| sum.wrapping_add(u32::from(*byte)));
    }

    fn finish(&self, state: Self::State) -> u32 {
        state.wrapping_neg()
    }
}

/// Result of a checksum pass over the image body.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Digest {
    pub value: u32,
    /// Every byte of the image read back as `0xFF` or every byte as `0x00`.
    pub blank: bool,
}

impl Digest {
    /// Whether the image matches the `expected` trailer value.
    ///
    /// A blank image never matches, as some algorithms yield a checksum an erased trailer can satisfy.
    pub fn matches(&self, expected: u32) -> bool {
        !self.blank && self.value == expected
    }
}

/// Blank-pattern tracker fed alongside the checksum.
struct Blank {
    ones: bool,
    zeros: bool,
}

impl Blank {
    const fn new() -> Self {
        Self {
            ones: true,
            zeros: true,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.ones &= bytes.iter().all(|b| *b == 0xFF);
        self.zeros &= bytes.iter().all(|b| *b == 0x00);
    }

    const fn is_blank(&self) -> bool {
        self.ones || self.zeros
    }
}

/// Compute the checksum over `length` bytes of `flash` starting at `offset`,
/// servicing the watchdog for every chunk read.
pub(crate) async fn digest<F, W, C>(
    flash: &mut F,
    watchdog: &mut W,
    checksum: &C,
    offset: u32,
    length: u32,
) -> Result<Digest, F::Error>
where
    F: ReadNorFlash,
    W: Watchdog,
    C: Checksum,
{
    let mut state = checksum.start();
    let mut blank = Blank::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    let end = offset + length;
    let mut cursor = offset;
    while cursor < end {
        let len = (end - cursor).min(CHUNK_SIZE as u32) as usize;
        let chunk = &mut buffer[..len];

        flash.read(cursor, chunk).await?;
        checksum.update(&mut state, chunk);
        blank.update(chunk);
        watchdog.service();

        cursor += len as u32;
    }

    Ok(Digest {
        value: checksum.finish(state),
        blank: blank.is_blank(),
    })
}
