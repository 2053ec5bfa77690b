//! Event pipeline, per-thread state and the reporter.
//!
//! The instrumentation host drives the [`Simulator`] through the callback
//! surface: thread start/fini, one call per instruction, and one call per
//! memory read or write. Memory events filter through the calling thread's
//! L1 and the shared L2; L2 misses feed the CU-tier residency policy.
//! Instruction events elect a single reporting thread whenever the global
//! count crosses the report interval, and additionally reset every counter
//! when it crosses the roll-over guard.

use crate::cache::{self, Cache};
use crate::config::Config;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, RwLock};
use crate::tier::CuTier;
use crate::address;
use color_eyre::eyre::{self, WrapErr};
use itertools::Itertools;
use std::io::Write;
use strum::IntoEnumIterator;

/// Instruction distance between periodic progress reports.
pub const REPORT_INTERVAL: u64 = 1_000_000_000;

/// Counters of one event-source thread. All relaxed; the packs are only
/// summed, never read for ordering.
#[derive(Debug, Default)]
pub struct ThreadStats {
    pub instructions: AtomicU64,
    pub mem_instructions: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
}

impl ThreadStats {
    fn snapshot(&self) -> stats::Threads {
        stats::Threads {
            instructions: self.instructions.load(Ordering::Relaxed),
            mem_instructions: self.mem_instructions.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.instructions.store(0, Ordering::Relaxed);
        self.mem_instructions.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

/// Report sink. The first write error is logged, further output is
/// dropped; the simulation itself keeps running.
struct Sink {
    writer: Box<dyn Write + Send>,
    failed: bool,
}

impl Sink {
    fn emit(&mut self, args: std::fmt::Arguments) {
        if self.failed {
            return;
        }
        if let Err(err) = self.writer.write_fmt(args) {
            log::error!("report sink failed ({err}); dropping further reports");
            self.failed = true;
        }
    }

    fn flush(&mut self) {
        if !self.failed {
            let _ = self.writer.flush();
        }
    }
}

pub struct Simulator {
    config: Config,
    l1_geometry: cache::Config,
    block_mask: u64,

    /// Per-thread L1 caches, indexed by the dense thread ids of the event
    /// source. Slots are created on thread start and cleared on fini; the
    /// per-slot mutex is uncontended on the hot path (only the owning
    /// thread accesses it) and exists for the reporter's aggregation pass.
    l1: RwLock<Vec<Option<Mutex<Cache>>>>,
    thread_stats: RwLock<Vec<Option<Arc<ThreadStats>>>>,

    l2: Mutex<Cache>,
    tier: CuTier,

    global_instructions: AtomicU64,
    last_report: AtomicU64,
    reset_lock: Mutex<()>,
    sink: Mutex<Sink>,
}

impl Simulator {
    /// Build a simulator writing reports to the configured output file.
    pub fn new(config: Config) -> eyre::Result<Self> {
        config.validate()?;
        let file = std::fs::File::create(&config.outfile)
            .wrap_err_with(|| format!("cannot open outfile {}", config.outfile.display()))?;
        let writer = Box::new(std::io::BufWriter::new(file));
        Ok(Self::with_writer(config, writer)?)
    }

    /// Build a simulator writing reports to an arbitrary sink.
    pub fn with_writer(
        config: Config,
        writer: Box<dyn Write + Send>,
    ) -> Result<Self, crate::config::Error> {
        config.validate()?;
        let l1_geometry = config.l1_cache();
        let l2 = Cache::new(config.l2_cache());
        let tier = CuTier::new(
            config.unclsize as usize,
            config.clsize as usize,
            config.unclfreq,
            config.clfreq,
            config.exfreq,
        );
        Ok(Self {
            block_mask: config.block_mask(),
            l1_geometry,
            config,
            l1: RwLock::new(Vec::new()),
            thread_stats: RwLock::new(Vec::new()),
            l2: Mutex::new(l2),
            tier,
            global_instructions: AtomicU64::new(0),
            last_report: AtomicU64::new(0),
            reset_lock: Mutex::new(()),
            sink: Mutex::new(Sink {
                writer,
                failed: false,
            }),
        })
    }

    #[must_use]
    pub fn tier(&self) -> &CuTier {
        &self.tier
    }

    /// Allocate the L1 cache and stats pack of a new thread.
    pub fn on_thread_start(&self, tid: usize) {
        {
            let mut l1 = self.l1.write();
            if tid >= l1.len() {
                l1.resize_with(tid + 1, || None);
            }
            l1[tid] = Some(Mutex::new(Cache::new(self.l1_geometry)));
        }
        let mut packs = self.thread_stats.write();
        if tid >= packs.len() {
            packs.resize_with(tid + 1, || None);
        }
        packs[tid] = Some(Arc::new(ThreadStats::default()));
    }

    /// Drop the L1 cache of a finished thread. Its stats pack stays for
    /// the final report.
    pub fn on_thread_fini(&self, tid: usize) {
        let mut l1 = self.l1.write();
        match l1.get_mut(tid) {
            Some(slot) => *slot = None,
            None => log::warn!("thread fini for unknown tid {tid}"),
        }
    }

    /// Per-instruction callback: bump counters and run the reporter
    /// election when an interval is crossed.
    pub fn on_instruction(&self, tid: usize) {
        if let Some(pack) = self.stats_for(tid) {
            pack.instructions.fetch_add(1, Ordering::Relaxed);
        }
        let cur = self.global_instructions.fetch_add(1, Ordering::Relaxed) + 1;
        let last = self.last_report.load(Ordering::Relaxed);
        // a racing winner can move last_report past cur; saturating keeps
        // the stale loser from spuriously re-triggering
        let since = cur.saturating_sub(last);
        if since > self.config.max_interval {
            if self
                .last_report
                .compare_exchange(last, cur, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.write_periodic(cur);
                self.reset_all();
            }
        } else if since > REPORT_INTERVAL {
            if self
                .last_report
                .compare_exchange(last, cur, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.write_periodic(cur);
            }
        }
    }

    pub fn on_memory_read(&self, tid: usize, _ip: address, addr: address) {
        self.memory_access(tid, addr, false);
    }

    pub fn on_memory_write(&self, tid: usize, _ip: address, addr: address) {
        self.memory_access(tid, addr, true);
    }

    fn memory_access(&self, tid: usize, addr: address, is_write: bool) {
        self.tier.record_access();

        let Some(pack) = self.stats_for(tid) else {
            log::warn!("memory access from unknown tid {tid}");
            return;
        };
        pack.mem_instructions.fetch_add(1, Ordering::Relaxed);
        if is_write {
            pack.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            pack.reads.fetch_add(1, Ordering::Relaxed);
        }

        let block_addr = addr & self.block_mask;
        let l1_slots = self.l1.read();
        let Some(slot) = l1_slots.get(tid).and_then(Option::as_ref) else {
            log::warn!("memory access from tid {tid} without an L1");
            return;
        };
        let mut l1 = slot.lock();
        if l1.access(block_addr, is_write, None, None) {
            return;
        }

        // the L2 lock covers the whole hit/miss path including the victim
        // callback; installing into this thread's L1 is safe because the
        // caller owns it
        let l2_hit = {
            let mut l2 = self.l2.lock();
            let mut install_upper = |evicted: address, dirty: bool| l1.install(evicted, dirty);
            l2.access(block_addr, is_write, Some(&mut install_upper), None)
        };
        drop(l1);
        drop(l1_slots);

        if !l2_hit {
            self.tier.on_l2_miss(addr);
        }
    }

    /// Aggregate every counter into a report snapshot. Finished threads
    /// no longer contribute L1 counters; their stats packs still count.
    #[must_use]
    pub fn snapshot(&self) -> stats::Report {
        let mut l1 = stats::Cache::default();
        for slot in self.l1.read().iter().flatten() {
            l1 += slot.lock().stats();
        }
        let l2 = self.l2.lock().stats();
        let mut threads = stats::Threads::default();
        for pack in self.thread_stats.read().iter().flatten() {
            threads += pack.snapshot();
        }
        stats::Report {
            instructions: self.global_instructions.load(Ordering::Relaxed),
            l1,
            l2,
            tier: self.tier.counters(),
            threads,
        }
    }

    /// Emit the final report and return the aggregate snapshot.
    pub fn on_finalize(&self) -> stats::Report {
        let report = self.snapshot();
        let instructions = report.threads.instructions;
        let tier_lines = stats::Residency::iter()
            .map(|residency| {
                format!(
                    "  {:<7} accesses : {} ({:.5}%)",
                    residency,
                    report.tier.get(residency),
                    report.tier.percent(residency, report.l2.misses),
                )
            })
            .join("\n");

        let mut sink = self.sink.lock();
        sink.emit(format_args!(
            "\n=========== cache-sim report ============\n\
             total instructions       : {}\n\
             \x20 memory instructions    : {}\n\
             \x20   reads                : {}\n\
             \x20   writes               : {}\n\
             \n\
             L1 accesses              : {}   misses: {}   MPKI: {:.5}\n\
             L2 accesses              : {}   misses: {}   MPKI: {:.5}\n\
             \n\
             {}\n\
             =========================================\n",
            instructions,
            report.threads.mem_instructions,
            report.threads.reads,
            report.threads.writes,
            report.l1.accesses,
            report.l1.misses,
            report.l1.mpki(instructions),
            report.l2.accesses,
            report.l2.misses,
            report.l2.mpki(instructions),
            tier_lines,
        ));
        sink.flush();
        report
    }

    fn write_periodic(&self, cur: u64) {
        let report = self.snapshot();
        let mut sink = self.sink.lock();
        sink.emit(format_args!(
            "\n[report @ {} instructions]\n\
             \x20 L1 accesses : {}  misses: {}  MPKI: {:.2}\n\
             \x20 L2 accesses : {}  misses: {}  MPKI: {:.2}\n\
             \x20 clist accesses   : {}\n\
             \x20 unclist accesses : {}\n\
             \x20 cpage accesses   : {}\n",
            cur,
            report.l1.accesses,
            report.l1.misses,
            report.l1.mpki(cur),
            report.l2.accesses,
            report.l2.misses,
            report.l2.mpki(cur),
            report.tier.clist,
            report.tier.unclist,
            report.tier.cpage,
        ));
    }

    /// Zero every statistic while preserving cache lines and list order.
    fn reset_all(&self) {
        let _guard = self.reset_lock.lock();
        for slot in self.l1.read().iter().flatten() {
            slot.lock().reset_stats();
        }
        self.l2.lock().reset_stats();
        self.tier.reset_counters();
        for pack in self.thread_stats.read().iter().flatten() {
            pack.reset();
        }
    }

    fn stats_for(&self, tid: usize) -> Option<Arc<ThreadStats>> {
        self.thread_stats
            .read()
            .get(tid)
            .and_then(Option::as_ref)
            .map(Arc::clone)
    }
}
