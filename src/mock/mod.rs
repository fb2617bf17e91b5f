pub mod cpu;
pub mod flash;

use std::{cell::Cell, collections::BTreeMap, rc::Rc};

use crate::Watchdog;

pub use cpu::{Call, MockCpu};
pub use flash::MockFlash;

/// Simulated time in ticks, advanced by the mock flash as operations take place.
pub type Clock = Rc<Cell<u64>>;

#[derive(Debug)]
pub struct WearTracker(BTreeMap<u32, usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, sector: u32) {
        *self.0.entry(sector).or_insert(0) += 1;
    }

    pub fn get(&self, sector: u32) -> usize {
        self.0.get(&sector).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

/// Watchdog that would have fired if more than `period` ticks pass between two services.
pub struct MockWatchdog {
    clock: Clock,
    period: u64,
    last: u64,
    services: usize,
    expired: bool,
}

impl MockWatchdog {
    pub fn new(clock: Clock) -> Self {
        Self::with_period(clock, u64::MAX)
    }

    pub fn with_period(clock: Clock, period: u64) -> Self {
        let last = clock.get();
        Self {
            clock,
            period,
            last,
            services: 0,
            expired: false,
        }
    }

    pub fn services(&self) -> usize {
        self.services
    }

    /// Whether the period elapsed at any point, including right now.
    pub fn expired(&self) -> bool {
        self.expired || self.clock.get() - self.last > self.period
    }
}

impl Watchdog for MockWatchdog {
    fn service(&mut self) {
        let now = self.clock.get();
        if now - self.last > self.period {
            self.expired = true;
        }
        self.last = now;
        self.services += 1;
    }
}
