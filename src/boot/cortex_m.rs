use cortex_m::peripheral::SCB;

use crate::{Address, boot::Boot};

/// Simple bootload mechanism for Cortex-M without support for TrustZone.
///
/// Interrupts are masked when the vector table is relocated and stay masked for the application to re-enable.
pub struct SimpleCortexM {
    scb: SCB,
}

impl SimpleCortexM {
    pub fn new(scb: SCB) -> Self {
        Self { scb }
    }
}

impl Boot for SimpleCortexM {
    unsafe fn relocate_vectors(&mut self, base: Address) {
        cortex_m::interrupt::disable();
        unsafe { self.scb.vtor.write(base) };
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    unsafe fn read_word(&mut self, address: Address) -> u32 {
        unsafe { (address as *const u32).read_volatile() }
    }

    unsafe fn jump(&mut self, entry: Address, stack: Option<Address>) -> ! {
        match stack {
            Some(stack) => unsafe {
                cortex_m::asm::bootstrap(stack as *const u32, entry as *const u32)
            },
            None => {
                let entry: extern "C" fn() -> ! = unsafe { core::mem::transmute(entry as usize) };
                entry()
            }
        }
    }

    fn reset(&mut self) -> ! {
        SCB::sys_reset()
    }
}
