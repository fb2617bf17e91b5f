use std::{collections::BTreeMap, vec::Vec};

use crate::{Address, boot::Boot};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Call {
    Relocate(Address),
    Read(Address),
    Jump { entry: Address, stack: Option<Address> },
    Reset,
}

/// Records every step of a hand-over. Jumping and resetting panic, as they cannot return.
pub struct MockCpu {
    pub words: BTreeMap<Address, u32>,
    pub calls: Vec<Call>,
}

impl MockCpu {
    pub fn new() -> Self {
        Self {
            words: BTreeMap::new(),
            calls: Vec::new(),
        }
    }
}

impl Boot for MockCpu {
    unsafe fn relocate_vectors(&mut self, base: Address) {
        self.calls.push(Call::Relocate(base));
    }

    unsafe fn read_word(&mut self, address: Address) -> u32 {
        self.calls.push(Call::Read(address));
        self.words.get(&address).copied().unwrap_or(0xFFFF_FFFF)
    }

    unsafe fn jump(&mut self, entry: Address, stack: Option<Address>) -> ! {
        self.calls.push(Call::Jump { entry, stack });
        panic!("jump to {entry:#x}")
    }

    fn reset(&mut self) -> ! {
        self.calls.push(Call::Reset);
        panic!("reset")
    }
}
