//! Simulator knobs.
//!
//! Flag names follow the original knob surface of the tool. Everything is
//! validated once at startup; an invalid knob is a fatal error.

use crate::cache;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("--{flag} must be a power of two (got {value})")]
    NotPowerOfTwo { flag: &'static str, value: u64 },
    #[error("--{flag} must be at least 1")]
    Zero { flag: &'static str },
    #[error(transparent)]
    Cache(#[from] cache::ConfigError),
}

#[derive(Parser, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// L1 size (bytes), per thread.
    #[clap(long = "l1size", help = "L1 size (bytes)", default_value = "32768")]
    pub l1_size: u64,

    #[clap(long = "l1assoc", help = "L1 associativity", default_value = "8")]
    pub l1_assoc: u32,

    /// Shared L2 size (bytes).
    #[clap(long = "l2size", help = "L2 size (bytes)", default_value = "262144")]
    pub l2_size: u64,

    #[clap(long = "l2assoc", help = "L2 associativity", default_value = "8")]
    pub l2_assoc: u32,

    #[clap(long = "blk", help = "Cache-line size (bytes)", default_value = "64")]
    pub block_size: u32,

    #[clap(
        long = "unclsize",
        help = "Capacity of the uncompressed page LRU list",
        default_value = "262144"
    )]
    pub unclsize: u32,

    #[clap(
        long = "clsize",
        help = "Capacity of the compressed page LRU list",
        default_value = "262144"
    )]
    pub clsize: u32,

    #[clap(
        long = "unclfreq",
        help = "LRU refresh period of the uncompressed list (accesses)",
        default_value = "65536"
    )]
    pub unclfreq: u64,

    #[clap(
        long = "clfreq",
        help = "LRU refresh period of the compressed list (accesses)",
        default_value = "65536"
    )]
    pub clfreq: u64,

    #[clap(
        long = "exfreq",
        help = "Promotion period from compressed to uncompressed (accesses)",
        default_value = "65536"
    )]
    pub exfreq: u64,

    /// Instruction distance after which the reporter also resets every
    /// counter. The default makes the reset effectively unreachable.
    #[clap(
        long = "max-interval",
        help = "Roll-over guard: full counter reset period (instructions)",
        default_value_t = u64::MAX
    )]
    pub max_interval: u64,

    #[clap(long = "outfile", help = "Report output file", default_value = "fini.out")]
    pub outfile: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["pagetiersim"])
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if !self.l1_size.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                flag: "l1size",
                value: self.l1_size,
            });
        }
        if !self.l2_size.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                flag: "l2size",
                value: self.l2_size,
            });
        }
        if self.block_size == 0 {
            return Err(Error::Zero { flag: "blk" });
        }
        for (flag, value) in [
            ("unclsize", u64::from(self.unclsize)),
            ("clsize", u64::from(self.clsize)),
            ("unclfreq", self.unclfreq),
            ("clfreq", self.clfreq),
            ("exfreq", self.exfreq),
        ] {
            if value == 0 {
                return Err(Error::Zero { flag });
            }
        }
        self.l1_cache().validate()?;
        self.l2_cache().validate()?;
        Ok(())
    }

    #[must_use]
    pub fn l1_cache(&self) -> cache::Config {
        cache::Config {
            size: self.l1_size,
            line_size: self.block_size,
            associativity: self.l1_assoc,
        }
    }

    #[must_use]
    pub fn l2_cache(&self) -> cache::Config {
        cache::Config {
            size: self.l2_size,
            line_size: self.block_size,
            associativity: self.l2_assoc,
        }
    }

    /// Mask flooring a byte address to block granularity.
    #[must_use]
    pub fn block_mask(&self) -> u64 {
        !u64::from(self.block_size - 1)
    }
}
