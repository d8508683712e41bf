use serde::{Deserialize, Serialize};

/// Logical clock used for node timestamps and event ordering.
///
/// Nothing in the kernel reads wall-clock time, so restoring a snapshot
/// reproduces the exact same timestamps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicClock {
    tick: u64,
}

impl DeterministicClock {
    pub fn new() -> Self {
        Self { tick: 0 }
    }

    pub fn starting_at(tick: u64) -> Self {
        Self { tick }
    }

    pub fn tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn now(&self) -> u64 {
        self.tick
    }
}
