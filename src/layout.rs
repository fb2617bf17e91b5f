//! Memory regions of the target and the rules deciding which requests may touch them.

use serde::{Deserialize, Serialize};

use crate::{Address, Error};

/// Size of the checksum trailer at the end of the application region.
pub const TRAILER_SIZE: u32 = 4;

/// Contiguous address range `[base, base + length)`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Region {
    pub base: Address,
    pub length: u32,
}

impl Region {
    pub const fn new(base: Address, length: u32) -> Self {
        Self { base, length }
    }

    /// First address past the region, `None` if the region wraps the address space.
    pub const fn end(&self) -> Option<Address> {
        self.base.checked_add(self.length)
    }

    /// Whether `[address, address + length)` lies fully inside this region.
    ///
    /// Empty requests are never contained.
    pub const fn contains(&self, address: Address, length: u32) -> bool {
        let (Some(end), Some(request_end)) = (self.end(), address.checked_add(length)) else {
            return false;
        };
        length != 0 && address >= self.base && request_end <= end
    }

    pub const fn overlaps(&self, other: &Region) -> bool {
        let (Some(end), Some(other_end)) = (self.end(), other.end()) else {
            return true;
        };
        self.base < other_end && other.base < end
    }
}

/// Logical purpose of a memory region.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Purpose {
    Bootloader,
    Application,
    Trailer,
    Config,
}

/// What a request intends to do with the memory it addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Access {
    Read,
    Write,
    Erase,
}

/// How write requests touching the checksum trailer are handled.
///
/// Erase requests may always cover the whole application region, trailer included,
/// as erasing the trailer can only invalidate the image.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum TrailerPolicy {
    /// Writes must stay within the image body, the trailer is only ever written by the finalization.
    #[default]
    Reserved,
    /// Writes may cover the trailer. A trailer programmed by the host is kept as-is on finalization.
    HostWritable,
}

/// Configuration mistakes detected when building a [Layout] or binding it to a flash device.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LayoutError {
    /// A region is empty or wraps the address space.
    Empty,
    /// Two regions share addresses.
    Overlap,
    /// The application region cannot hold an image body and a trailer,
    /// or its end is not aligned to the trailer size.
    Trailer,
    /// A region does not start or end on a sector boundary,
    /// or the staging block does not fit the flash geometry.
    Misaligned,
    /// A region lies outside of the flash device.
    Capacity,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            LayoutError::Empty => "empty or wrapping region",
            LayoutError::Overlap => "overlapping regions",
            LayoutError::Trailer => "application region cannot hold a trailer",
            LayoutError::Misaligned => "region or block not aligned to the flash geometry",
            LayoutError::Capacity => "region outside of the flash device",
        })
    }
}

/// Fixed memory map of the target.
///
/// Deserializing goes through [Layout::new], so a deserialized layout is checked like any other.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawLayout")]
pub struct Layout {
    /// Address at which offset 0 of the flash device is mapped.
    flash_base: Address,
    bootloader: Region,
    application: Region,
    config: Option<Region>,
    trailer_policy: TrailerPolicy,
}

impl Layout {
    /// Build a layout, checking that regions are non-empty, disjoint,
    /// and that the application region ends with a properly aligned trailer.
    ///
    /// Being a `const fn`, a broken layout used in a `const` is a compile error.
    pub const fn new(
        flash_base: Address,
        bootloader: Region,
        application: Region,
        config: Option<Region>,
    ) -> Result<Self, LayoutError> {
        if !is_valid(&bootloader) || !is_valid(&application) {
            return Err(LayoutError::Empty);
        }
        if bootloader.overlaps(&application) {
            return Err(LayoutError::Overlap);
        }
        if let Some(config) = &config {
            if !is_valid(config) {
                return Err(LayoutError::Empty);
            }
            if config.overlaps(&bootloader) || config.overlaps(&application) {
                return Err(LayoutError::Overlap);
            }
        }
        if application.length <= TRAILER_SIZE || application.length % TRAILER_SIZE != 0 {
            return Err(LayoutError::Trailer);
        }
        if application.base % TRAILER_SIZE != 0 {
            return Err(LayoutError::Trailer);
        }
        if bootloader.base < flash_base || application.base < flash_base {
            return Err(LayoutError::Capacity);
        }
        if let Some(config) = &config {
            if config.base < flash_base {
                return Err(LayoutError::Capacity);
            }
        }

        Ok(Self {
            flash_base,
            bootloader,
            application,
            config,
            trailer_policy: TrailerPolicy::Reserved,
        })
    }

    pub const fn with_trailer_policy(mut self, trailer_policy: TrailerPolicy) -> Self {
        self.trailer_policy = trailer_policy;
        self
    }

    pub const fn flash_base(&self) -> Address {
        self.flash_base
    }

    pub const fn trailer_policy(&self) -> TrailerPolicy {
        self.trailer_policy
    }

    pub const fn bootloader(&self) -> Region {
        self.bootloader
    }

    /// Entire application region, trailer included.
    pub const fn application(&self) -> Region {
        self.application
    }

    /// Application region without its trailer, the part covered by the checksum.
    pub const fn image(&self) -> Region {
        Region::new(self.application.base, self.application.length - TRAILER_SIZE)
    }

    pub const fn trailer(&self) -> Region {
        Region::new(
            self.application.base + self.application.length - TRAILER_SIZE,
            TRAILER_SIZE,
        )
    }

    pub const fn config(&self) -> Option<Region> {
        self.config
    }

    /// Every recognized region, in address order of declaration.
    pub(crate) fn regions(&self) -> impl Iterator<Item = (Purpose, Region)> {
        [
            Some((Purpose::Bootloader, self.bootloader)),
            Some((Purpose::Application, self.application)),
            self.config.map(|config| (Purpose::Config, config)),
        ]
        .into_iter()
        .flatten()
    }

    /// Decide whether `[address, address + length)` may be accessed,
    /// returning the purpose of the region it is contained in.
    ///
    /// Requests that are empty, wrap around, span regions or touch
    /// memory the access is not allowed for are [Error::OutOfRange].
    pub(crate) fn check(&self, address: Address, length: u32, access: Access) -> Result<Purpose, Error> {
        let image = self.image();

        let purpose = match access {
            Access::Read => self
                .regions()
                .find(|(_, region)| region.contains(address, length))
                .map(|(purpose, _)| {
                    if purpose == Purpose::Application && !image.contains(address, length) {
                        Purpose::Trailer
                    } else {
                        purpose
                    }
                }),
            Access::Write => match self.trailer_policy {
                TrailerPolicy::Reserved if image.contains(address, length) => Some(Purpose::Application),
                TrailerPolicy::HostWritable if self.application.contains(address, length) => {
                    Some(Purpose::Application)
                }
                _ => self.config_containing(address, length),
            },
            Access::Erase => {
                if self.application.contains(address, length) {
                    Some(Purpose::Application)
                } else {
                    self.config_containing(address, length)
                }
            }
        };

        purpose.ok_or_else(|| {
            warn!(
                "rejected request at {:#x} (length {:#x})",
                address, length
            );
            Error::OutOfRange
        })
    }

    fn config_containing(&self, address: Address, length: u32) -> Option<Purpose> {
        self.config
            .filter(|config| config.contains(address, length))
            .map(|_| Purpose::Config)
    }

    /// Offset within the flash device for an address already checked against the layout.
    pub(crate) const fn offset(&self, address: Address) -> u32 {
        address - self.flash_base
    }
}

/// Unchecked shape of a serialized [Layout].
#[derive(Deserialize)]
#[cfg_attr(test, derive(Serialize))]
struct RawLayout {
    flash_base: Address,
    bootloader: Region,
    application: Region,
    config: Option<Region>,
    trailer_policy: TrailerPolicy,
}

impl TryFrom<RawLayout> for Layout {
    type Error = LayoutError;

    fn try_from(raw: RawLayout) -> Result<Self, Self::Error> {
        Layout::new(raw.flash_base, raw.bootloader, raw.application, raw.config)
            .map(|layout| layout.with_trailer_policy(raw.trailer_policy))
    }
}

const fn is_valid(region: &Region) -> bool {
    region.length != 0 && region.end().is_some()
}
