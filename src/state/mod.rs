//! Boot decision: start the application if its image verifies, otherwise stay resident.
//!
//! The engine starts out awaiting a decision. A successful verification transfers control to the application,
//! a state that is never observed as control has left the bootloader.
//! Otherwise the decision yields a [Resident] token, and the engine is gone until the next reset.
//! Nothing about the outcome is stored: every boot verifies the image anew.

use embedded_storage_async::nor_flash::NorFlash;

use crate::{
    Watchdog,
    boot::{self, Boot, EntryConvention},
    checksum::Checksum,
    nvm::Nvm,
};

/// Boot decision engine, awaiting its decision.
pub struct BootEngine<B> {
    cpu: B,
    convention: EntryConvention,
}

impl<B: Boot> BootEngine<B> {
    pub const fn new(cpu: B, convention: EntryConvention) -> Self {
        Self { cpu, convention }
    }

    /// Verify the application image and start it. Only returns if the image is invalid.
    pub async fn decide<F, W, C, const BLOCK: usize>(
        mut self,
        nvm: &mut Nvm<F, W, C, BLOCK>,
    ) -> Resident<B>
    where
        F: NorFlash,
        W: Watchdog,
        C: Checksum,
    {
        if nvm.verify_checksum().await {
            info!("application image valid");
            // Safety: the image was verified right above.
            unsafe { boot::start_application(&mut self.cpu, &self.convention) }
        }

        info!("no valid application image, staying resident");
        Resident { cpu: self.cpu }
    }
}

/// Proof that the boot decision kept control in the bootloader for this boot cycle.
pub struct Resident<B> {
    cpu: B,
}

impl<B: Boot> Resident<B> {
    /// Restart the device, so that a newly programmed image is verified by a fresh boot cycle.
    pub fn reset(mut self) -> ! {
        info!("resetting");
        self.cpu.reset()
    }

    pub fn into_inner(self) -> B {
        self.cpu
    }
}
