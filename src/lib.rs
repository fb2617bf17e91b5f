//! Boot decision and NVM programming core for resident microcontroller bootloaders.
//!
//! At reset the [BootEngine](state::BootEngine) checks the application image against the checksum trailer
//! and either hands the CPU over to it or stays resident.
//! While resident, a command layer programs a new image through the [Nvm](nvm::Nvm) driver.
#![no_std]

// This mod must go first, so that the others see its macros.
mod fmt;

pub mod boot;
pub mod checksum;
pub mod layout;
pub mod nvm;
pub mod state;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

pub use boot::{Boot, EntryConvention, Relocation, start_application};
pub use checksum::{Additive, Checksum, Crc32};
pub use layout::{Layout, LayoutError, Region, TrailerPolicy};
pub use nvm::Nvm;
pub use state::{BootEngine, Resident};

/// Address in the memory map of the target.
pub type Address = u32;

/// Failure of an NVM operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The request is empty or not fully contained in a single region it may access.
    /// Nothing was touched.
    OutOfRange,
    /// The flash device failed to read, program or erase, or read back something else than was programmed.
    /// The affected memory is in an undefined state.
    Hardware,
}

/// Hook keeping an external watchdog timer from expiring during long operations.
pub trait Watchdog {
    /// Restart the watchdog period. May be called at any time.
    fn service(&mut self);
}

impl<T: Watchdog + ?Sized> Watchdog for &mut T {
    fn service(&mut self) {
        (**self).service()
    }
}

/// For targets without a watchdog.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn service(&mut self) {}
}
