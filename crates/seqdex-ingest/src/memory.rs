//! Approximate memory accounting for bounded in-memory structures
//!
//! The staging buffer of the index writer and the in-memory identifier set
//! both track the estimated heap size of what they hold and spill to disk
//! when less than [`MemoryBudget::LOW_WATER_FRACTION`] of their allotment is
//! left.

use serde::{Deserialize, Serialize};

/// Per-string bookkeeping cost: `String` header plus a hash-table slot
const STRING_OVERHEAD: u64 = 56;

/// A fixed allotment of bytes for one in-memory structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    limit_bytes: u64,
}

impl MemoryBudget {
    /// Spill when free memory falls under this share of the budget
    pub const LOW_WATER_FRACTION: f64 = 0.10;

    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes: limit_bytes.max(1),
        }
    }

    pub fn from_megabytes(mb: u64) -> Self {
        Self::new(mb.saturating_mul(1024 * 1024))
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn free_bytes(&self, used: u64) -> u64 {
        self.limit_bytes.saturating_sub(used)
    }

    /// True when `used` leaves less than 10% of the budget free
    pub fn is_low(&self, used: u64) -> bool {
        (self.free_bytes(used) as f64) < self.limit_bytes as f64 * Self::LOW_WATER_FRACTION
    }
}

/// Rough heap cost of holding `s` as an owned string
pub fn string_footprint(s: &str) -> u64 {
    s.len() as u64 + STRING_OVERHEAD
}
