//! Set-associative cache with true LRU replacement.
//!
//! Each instance models one cache level. Misses evict their victim through
//! caller-supplied callbacks: an *upper installer* that lets an evicting L2
//! push the line back into the owning L1 (modelling inclusion), and a
//! *write-back sink* for dirty victims. The [`Cache::install`] path fills a
//! line without counting an access, used when a lower level hits on behalf
//! of this one.

use crate::address;
use serde::{Deserialize, Serialize};

/// Callback installing an evicted or filled line into the upper level.
pub type Installer<'a> = &'a mut dyn FnMut(address, bool);
/// Callback receiving the address of a dirty line written back.
pub type WritebackSink<'a> = &'a mut dyn FnMut(address);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a power of two (got {value})")]
    NotPowerOfTwo { name: &'static str, value: u64 },
    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
    #[error(
        "cache of {size} bytes does not divide into {associativity}-way sets \
         of {line_size}-byte lines"
    )]
    Geometry {
        size: u64,
        line_size: u32,
        associativity: u32,
    },
}

/// Cache geometry.
///
/// `num_sets * associativity * line_size == size`, and both `line_size`
/// and `num_sets` are powers of two so the set index is a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Config {
    /// Total capacity in bytes.
    pub size: u64,
    /// Line (block) size in bytes.
    pub line_size: u32,
    /// Number of ways per set.
    pub associativity: u32,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "cache size",
                value: self.size,
            });
        }
        if self.line_size == 0 {
            return Err(ConfigError::Zero { name: "line size" });
        }
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "line size",
                value: u64::from(self.line_size),
            });
        }
        if self.associativity == 0 {
            return Err(ConfigError::Zero {
                name: "associativity",
            });
        }
        let line_bytes = u64::from(self.line_size) * u64::from(self.associativity);
        if line_bytes == 0 || self.size % line_bytes != 0 || self.size / line_bytes == 0 {
            return Err(ConfigError::Geometry {
                size: self.size,
                line_size: self.line_size,
                associativity: self.associativity,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn num_sets(&self) -> u64 {
        self.size / (u64::from(self.line_size) * u64::from(self.associativity))
    }

    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    #[must_use]
    pub fn num_sets_log2(&self) -> u32 {
        self.num_sets().trailing_zeros()
    }
}

/// One cache line.
///
/// `age` orders lines within their set: 0 is MRU, and valid lines of a set
/// always carry pairwise-distinct ages below the associativity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Line {
    pub tag: address,
    pub age: u32,
    pub valid: bool,
    pub dirty: bool,
}

pub struct Cache {
    config: Config,
    set_mask: u64,
    /// `num_sets x associativity` lines, set-major.
    lines: Vec<Line>,
    num_access: u64,
    num_miss: u64,
    wb_install: Option<Box<dyn FnMut(address) + Send>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("num_access", &self.num_access)
            .field("num_miss", &self.num_miss)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Build a cache from a validated geometry.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let num_lines = (config.num_sets() as usize) * config.associativity as usize;
        Self {
            config,
            set_mask: config.num_sets() - 1,
            lines: vec![Line::default(); num_lines],
            num_access: 0,
            num_miss: 0,
            wb_install: None,
        }
    }

    /// Write-back sink used for dirty victims evicted by [`Cache::install`].
    pub fn set_wb_install(&mut self, sink: Box<dyn FnMut(address) + Send>) {
        self.wb_install = Some(sink);
    }

    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.num_access
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.num_miss
    }

    #[must_use]
    pub fn stats(&self) -> stats::Cache {
        stats::Cache {
            accesses: self.num_access,
            misses: self.num_miss,
        }
    }

    /// Zero the access/miss counters. Lines stay valid.
    pub fn reset_stats(&mut self) {
        self.num_access = 0;
        self.num_miss = 0;
    }

    #[inline]
    fn decode(&self, addr: address) -> (usize, address) {
        let block = addr >> self.config.line_size_log2();
        ((block & self.set_mask) as usize, block >> self.config.num_sets_log2())
    }

    #[inline]
    fn reconstruct(&self, set: usize, tag: address) -> address {
        ((tag << self.config.num_sets_log2()) | set as u64) << self.config.line_size_log2()
    }

    #[inline]
    fn set_lines_mut(&mut self, set: usize) -> &mut [Line] {
        let ways = self.config.associativity as usize;
        &mut self.lines[set * ways..(set + 1) * ways]
    }

    /// Access a block-aligned address.
    ///
    /// Returns `true` on hit. On a miss the victim, if valid, is offered to
    /// `upper_installer` (with its dirty flag) and, if dirty, to
    /// `writeback_sink`; the new line is then installed MRU, dirty iff this
    /// access is a write (write-allocate).
    pub fn access(
        &mut self,
        addr: address,
        is_write: bool,
        upper_installer: Option<Installer>,
        writeback_sink: Option<WritebackSink>,
    ) -> bool {
        self.num_access += 1;
        let (set, tag) = self.decode(addr);
        let ways = self.set_lines_mut(set);

        if let Some(hit) = ways.iter().position(|line| line.valid && line.tag == tag) {
            touch_lru(ways, hit);
            if is_write {
                ways[hit].dirty = true;
            }
            return true;
        }

        let victim = pick_victim(ways);
        let evicted = ways[victim];
        self.num_miss += 1;
        if evicted.valid {
            let evicted_addr = self.reconstruct(set, evicted.tag);
            if let Some(install) = upper_installer {
                install(evicted_addr, evicted.dirty);
            }
            if evicted.dirty {
                if let Some(sink) = writeback_sink {
                    sink(evicted_addr);
                }
            }
        }

        let ways = self.set_lines_mut(set);
        age_valid(ways);
        ways[victim] = Line {
            tag,
            age: 0,
            valid: true,
            dirty: is_write,
        };
        false
    }

    /// Fill a line without counting an access or a miss.
    ///
    /// Used when a lower level hit and this level must be populated anyway.
    /// A dirty victim goes to the configured `wb_install` sink, if any.
    pub fn install(&mut self, addr: address, dirty: bool) {
        let (set, tag) = self.decode(addr);
        let ways = self.set_lines_mut(set);
        let victim = pick_victim(ways);
        let evicted = ways[victim];

        if evicted.valid && evicted.dirty {
            let evicted_addr = self.reconstruct(set, evicted.tag);
            if let Some(sink) = self.wb_install.as_mut() {
                sink(evicted_addr);
            }
        }

        let ways = self.set_lines_mut(set);
        age_valid(ways);
        ways[victim] = Line {
            tag,
            age: 0,
            valid: true,
            dirty,
        };
    }
}

/// LRU touch: older entries between the hit and MRU age by one, the hit
/// becomes age 0.
#[inline]
fn touch_lru(ways: &mut [Line], hit: usize) {
    let hit_age = ways[hit].age;
    for line in ways.iter_mut() {
        if line.valid && line.age < hit_age {
            line.age += 1;
        }
    }
    ways[hit].age = 0;
}

/// First invalid way, else the oldest; age ties resolve to the lowest way.
#[inline]
fn pick_victim(ways: &[Line]) -> usize {
    let mut victim = 0;
    let mut max_age = 0;
    for (way, line) in ways.iter().enumerate() {
        if !line.valid {
            return way;
        }
        if line.age > max_age {
            victim = way;
            max_age = line.age;
        }
    }
    victim
}

#[inline]
fn age_valid(ways: &mut [Line]) {
    for line in ways.iter_mut() {
        if line.valid {
            line.age += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, Config};
    use crate::address;

    fn direct_mapped(size: u64, line_size: u32) -> Cache {
        let config = Config {
            size,
            line_size,
            associativity: 1,
        };
        config.validate().unwrap();
        Cache::new(config)
    }

    fn ages_distinct(cache: &Cache) -> bool {
        let ways = cache.config.associativity as usize;
        cache.lines.chunks(ways).all(|set| {
            let mut seen = vec![false; ways];
            set.iter().filter(|line| line.valid).all(|line| {
                let age = line.age as usize;
                age < ways && !std::mem::replace(&mut seen[age], true)
            })
        })
    }

    #[test]
    fn geometry() {
        let config = Config {
            size: 32768,
            line_size: 64,
            associativity: 8,
        };
        config.validate().unwrap();
        assert_eq!(config.num_sets(), 64);
        assert_eq!(config.line_size_log2(), 6);
        assert_eq!(config.num_sets_log2(), 6);
    }

    #[test]
    fn geometry_rejects_bad_knobs() {
        assert!(Config {
            size: 30000,
            line_size: 64,
            associativity: 8
        }
        .validate()
        .is_err());
        assert!(Config {
            size: 32768,
            line_size: 48,
            associativity: 8
        }
        .validate()
        .is_err());
        assert!(Config {
            size: 32768,
            line_size: 64,
            associativity: 0
        }
        .validate()
        .is_err());
        assert!(Config {
            size: 64,
            line_size: 64,
            associativity: 8
        }
        .validate()
        .is_err());
    }

    #[test]
    fn hit_after_miss() {
        let mut cache = direct_mapped(128, 64);
        assert!(!cache.access(0x0, false, None, None));
        assert!(cache.access(0x0, false, None, None));
        assert_eq!(cache.accesses(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn lru_eviction_order() {
        // one set, two ways
        let config = Config {
            size: 128,
            line_size: 64,
            associativity: 2,
        };
        let mut cache = Cache::new(config);
        cache.access(0x000, false, None, None); // A
        cache.access(0x080, false, None, None); // B
        cache.access(0x000, false, None, None); // A again, B is now LRU
        assert!(ages_distinct(&cache));

        let mut evicted: Vec<address> = vec![];
        let mut installer = |addr: address, _dirty: bool| evicted.push(addr);
        cache.access(0x100, false, Some(&mut installer), None); // C evicts B
        assert_eq!(evicted, vec![0x080]);
        assert!(cache.access(0x000, false, None, None));
        assert!(ages_distinct(&cache));
    }

    #[test]
    fn invalid_way_filled_first() {
        let config = Config {
            size: 256,
            line_size: 64,
            associativity: 4,
        };
        let mut cache = Cache::new(config);
        let mut evicted = 0u32;
        for block in 0..4u64 {
            let mut installer = |_addr: address, _dirty: bool| evicted += 1;
            cache.access(block << 8, false, Some(&mut installer), None);
        }
        assert_eq!(evicted, 0);
        assert!(ages_distinct(&cache));
    }

    #[test]
    fn dirty_victim_reaches_writeback_sink() {
        let mut cache = direct_mapped(64, 64);
        cache.access(0x0, true, None, None);

        let mut written_back: Vec<address> = vec![];
        let mut installs: Vec<(address, bool)> = vec![];
        let mut installer = |addr: address, dirty: bool| installs.push((addr, dirty));
        let mut sink = |addr: address| written_back.push(addr);
        cache.access(0x40, false, Some(&mut installer), Some(&mut sink));

        assert_eq!(installs, vec![(0x0, true)]);
        assert_eq!(written_back, vec![0x0]);

        // clean victim: installer fires, sink does not
        written_back.clear();
        installs.clear();
        let mut installer = |addr: address, dirty: bool| installs.push((addr, dirty));
        let mut sink = |addr: address| written_back.push(addr);
        cache.access(0x80, false, Some(&mut installer), Some(&mut sink));
        assert_eq!(installs, vec![(0x40, false)]);
        assert!(written_back.is_empty());
    }

    #[test]
    fn install_does_not_count() {
        let mut cache = direct_mapped(64, 64);
        cache.install(0x0, true);
        assert_eq!(cache.accesses(), 0);
        assert_eq!(cache.misses(), 0);
        assert!(cache.access(0x0, false, None, None));
    }

    #[test]
    fn install_dirty_victim_uses_wb_install() {
        use std::sync::{Arc, Mutex};
        let mut cache = direct_mapped(64, 64);
        let log = Arc::new(Mutex::new(Vec::<address>::new()));
        let sink_log = Arc::clone(&log);
        cache.set_wb_install(Box::new(move |addr| sink_log.lock().unwrap().push(addr)));

        cache.install(0x0, true);
        cache.install(0x40, false);
        assert_eq!(*log.lock().unwrap(), vec![0x0]);
    }

    #[test]
    fn reconstruct_round_trip() {
        let config = Config {
            size: 262144,
            line_size: 64,
            associativity: 8,
        };
        let cache = Cache::new(config);
        for addr in [0x0u64, 0xdead_b000, 0x7fff_ffff_f000, 0x1_0000_0040] {
            let block_addr = addr & !u64::from(config.line_size - 1);
            let (set, tag) = cache.decode(block_addr);
            assert_eq!(cache.reconstruct(set, tag), block_addr);
        }
    }

    #[test]
    fn reset_keeps_lines() {
        let mut cache = direct_mapped(128, 64);
        cache.access(0x0, true, None, None);
        cache.reset_stats();
        assert_eq!(cache.accesses(), 0);
        assert_eq!(cache.misses(), 0);
        assert!(cache.access(0x0, false, None, None));
    }
}
