//! Aggregated simulation statistics.
//!
//! Plain-data types shared between the simulator core and its report
//! writers. Everything here is serializable and mergeable; the runtime
//! counters themselves (atomics, per-thread packs) live in the simulator
//! crate and are converted into these snapshots at report time.

use serde::{Deserialize, Serialize};

/// Access/miss counters of a single cache instance or aggregated level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub accesses: u64,
    pub misses: u64,
}

impl Cache {
    /// Misses per kilo-instruction.
    #[must_use]
    pub fn mpki(&self, instructions: u64) -> f64 {
        if instructions == 0 {
            0.0
        } else {
            1000.0 * self.misses as f64 / instructions as f64
        }
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        self.accesses += other.accesses;
        self.misses += other.misses;
    }
}

/// Which residency pool of the CU tier an L2 miss was accounted to.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum Residency {
    /// A page held by the compressed list.
    #[strum(serialize = "clist")]
    Compressed,
    /// A page held by the uncompressed list.
    #[strum(serialize = "unclist")]
    Uncompressed,
    /// A compressed page outside both lists (not materialized by the model).
    #[strum(serialize = "cpage")]
    OffTier,
}

/// CU-tier access counters for one reporting epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub unclist: u64,
    pub clist: u64,
    pub cpage: u64,
}

impl Tier {
    #[must_use]
    pub fn get(&self, residency: Residency) -> u64 {
        match residency {
            Residency::Compressed => self.clist,
            Residency::Uncompressed => self.unclist,
            Residency::OffTier => self.cpage,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.unclist + self.clist + self.cpage
    }

    /// Share of `l2_misses` accounted to `residency`, in percent.
    #[must_use]
    pub fn percent(&self, residency: Residency, l2_misses: u64) -> f64 {
        if l2_misses == 0 {
            0.0
        } else {
            100.0 * self.get(residency) as f64 / l2_misses as f64
        }
    }
}

impl std::ops::AddAssign for Tier {
    fn add_assign(&mut self, other: Self) {
        self.unclist += other.unclist;
        self.clist += other.clist;
        self.cpage += other.cpage;
    }
}

/// Per-thread instruction and memory-operation counters, or their sum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threads {
    pub instructions: u64,
    pub mem_instructions: u64,
    pub reads: u64,
    pub writes: u64,
}

impl std::ops::AddAssign for Threads {
    fn add_assign(&mut self, other: Self) {
        self.instructions += other.instructions;
        self.mem_instructions += other.mem_instructions;
        self.reads += other.reads;
        self.writes += other.writes;
    }
}

/// Complete snapshot emitted by the final report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub instructions: u64,
    pub l1: Cache,
    pub l2: Cache,
    pub tier: Tier,
    pub threads: Threads,
}

#[cfg(test)]
mod tests {
    use super::{Cache, Residency, Threads, Tier};
    use strum::IntoEnumIterator;

    #[test]
    fn mpki() {
        let cache = Cache {
            accesses: 100,
            misses: 5,
        };
        assert_eq!(cache.mpki(1000), 5.0);
        assert_eq!(cache.mpki(0), 0.0);
    }

    #[test]
    fn merge() {
        let mut total = Cache::default();
        total += Cache {
            accesses: 10,
            misses: 2,
        };
        total += Cache {
            accesses: 5,
            misses: 1,
        };
        assert_eq!(
            total,
            Cache {
                accesses: 15,
                misses: 3
            }
        );

        let mut threads = Threads::default();
        threads += Threads {
            instructions: 100,
            mem_instructions: 40,
            reads: 30,
            writes: 10,
        };
        assert_eq!(threads.reads + threads.writes, threads.mem_instructions);
    }

    #[test]
    fn tier_percentages() {
        let tier = Tier {
            unclist: 30,
            clist: 10,
            cpage: 60,
        };
        assert_eq!(tier.total(), 100);
        assert_eq!(tier.percent(Residency::Uncompressed, 100), 30.0);
        assert_eq!(tier.percent(Residency::Compressed, 0), 0.0);

        let sum: u64 = Residency::iter().map(|r| tier.get(r)).sum();
        assert_eq!(sum, tier.total());
    }

    #[test]
    fn residency_labels() {
        assert_eq!(Residency::Compressed.to_string(), "clist");
        assert_eq!(Residency::Uncompressed.to_string(), "unclist");
        assert_eq!(Residency::OffTier.to_string(), "cpage");
    }
}
