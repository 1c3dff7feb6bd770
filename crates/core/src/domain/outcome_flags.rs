// Outcome Flags - processing findings accumulated on a batch

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Bitset of findings raised while reconciling a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutcomeFlags(u32);

impl OutcomeFlags {
    pub const NONE: Self = Self(0);
    pub const UNKNOWN_SITES: Self = Self(1);
    pub const UNPAIRED_CHECKINS: Self = Self(1 << 1);
    pub const OVER_TIME_JOURNEYS: Self = Self(1 << 2);
    pub const ORPHAN_PARKING_EXITS: Self = Self(1 << 3);
    pub const LOW_CONFIDENCE_BUS: Self = Self(1 << 4);
    pub const PARTIAL_SUCCEEDED: Self = Self(1 << 5);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are kept so newer writers never lose data
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for OutcomeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OutcomeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
