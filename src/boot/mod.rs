#[cfg(feature = "cortex_m")]
pub mod cortex_m;

use serde::{Deserialize, Serialize};

use crate::Address;

/// Architecture specific means of handing the CPU over to another image.
///
/// Implementations perform raw register and memory access. Nothing here validates the image.
pub trait Boot {
    /// Point the interrupt vector table base register at `base`.
    ///
    /// # Safety
    /// Interrupts taken afterwards are dispatched through the table at `base`.
    unsafe fn relocate_vectors(&mut self, base: Address);

    /// Read the 32-bit word at `address`.
    ///
    /// # Safety
    /// `address` must be readable and word aligned.
    unsafe fn read_word(&mut self, address: Address) -> u32;

    /// Jump to `entry`, optionally loading `stack` as the initial stack pointer first.
    ///
    /// # Safety
    /// `entry` must point at code expecting to be started as if out of reset.
    unsafe fn jump(&mut self, entry: Address, stack: Option<Address>) -> !;

    /// Restart the device, running the bootloader from the top.
    fn reset(&mut self) -> !;
}

impl<T: Boot + ?Sized> Boot for &mut T {
    unsafe fn relocate_vectors(&mut self, base: Address) {
        unsafe { (**self).relocate_vectors(base) }
    }

    unsafe fn read_word(&mut self, address: Address) -> u32 {
        unsafe { (**self).read_word(address) }
    }

    unsafe fn jump(&mut self, entry: Address, stack: Option<Address>) -> ! {
        unsafe { (**self).jump(entry, stack) }
    }

    fn reset(&mut self) -> ! {
        (**self).reset()
    }
}

/// Whether and how the vector table base register is reprogrammed before the jump.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Relocation {
    /// The target has no relocatable vector table, or the application sets it up itself.
    Keep,
    /// Write the vector table address, masked by the implemented register bits.
    Masked(u32),
}

/// Where the application keeps its vector table and how it expects to be entered.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EntryConvention {
    pub vector_table: Address,
    pub relocation: Relocation,
    /// Offset within the vector table of the entry point address.
    pub entry_offset: u32,
    /// Offset within the vector table of the initial stack pointer, if the architecture keeps one there.
    pub stack_offset: Option<u32>,
}

impl EntryConvention {
    /// ARMv7-M vector table bits implemented by `SCB.VTOR`, requiring 128-byte alignment.
    pub const CORTEX_M_VTOR_MASK: u32 = 0xFFFF_FF80;

    /// Cortex-M reset convention: initial stack pointer at `+0`, reset handler at `+4`.
    pub const fn cortex_m(vector_table: Address) -> Self {
        Self {
            vector_table,
            relocation: Relocation::Masked(Self::CORTEX_M_VTOR_MASK),
            entry_offset: 4,
            stack_offset: Some(0),
        }
    }
}

/// Hand the CPU over to the application described by `convention`.
///
/// 1. Relocate the vector table, if the convention asks for it.
/// 2. Read the entry point (and initial stack pointer) from the vector table.
/// 3. Jump.
///
/// # Safety
/// The image must have been verified, as nothing here checks it.
pub unsafe fn start_application<B: Boot>(cpu: &mut B, convention: &EntryConvention) -> ! {
    let table = convention.vector_table;

    if let Relocation::Masked(mask) = convention.relocation {
        unsafe { cpu.relocate_vectors(table & mask) };
    }

    let entry = unsafe { cpu.read_word(table.wrapping_add(convention.entry_offset)) };
    let stack = convention
        .stack_offset
        .map(|offset| unsafe { cpu.read_word(table.wrapping_add(offset)) });

    info!("starting application at {:#x}", entry);
    unsafe { cpu.jump(entry, stack) }
}
