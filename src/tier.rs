//! Compressed/uncompressed page-residency policy.
//!
//! Two fixed-capacity LRU lists model the residency tiers: `unclist` holds
//! pages of the hypothetical uncompressed working set, `clist` the larger
//! compressed tier. Every L2 miss is routed through [`CuTier::on_l2_miss`],
//! which fills the lists during warm-up and afterwards accounts the miss to
//! one of the pools, occasionally rewriting LRU order and promoting the
//! hottest compressed page.
//!
//! Lock order on the promotion path is unclist before clist, never the
//! reverse; every other path takes at most one list lock.

use crate::page_list::PageList;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::Mutex;
use crate::address;

#[derive(Debug)]
pub struct CuTier {
    unclist: Mutex<PageList>,
    clist: Mutex<PageList>,

    /// LRU-refresh period of `unclist`, in memory accesses.
    unclfreq: u64,
    /// LRU-refresh and admission period of `clist`.
    clfreq: u64,
    /// Promotion (expansion) period.
    exfreq: u64,

    // Both epochs advance on every memory access. Promotion gates on and
    // resets only uc_epoch; cl_epoch keeps ticking through a promotion.
    // That asymmetry is intentional.
    uc_epoch: AtomicU64,
    cl_epoch: AtomicU64,

    unclist_access: AtomicU64,
    clist_access: AtomicU64,
    cpage_access: AtomicU64,
}

impl CuTier {
    #[must_use]
    pub fn new(unclsize: usize, clsize: usize, unclfreq: u64, clfreq: u64, exfreq: u64) -> Self {
        Self {
            unclist: Mutex::new(PageList::new(unclsize)),
            clist: Mutex::new(PageList::new(clsize)),
            unclfreq,
            clfreq,
            exfreq,
            uc_epoch: AtomicU64::new(0),
            cl_epoch: AtomicU64::new(0),
            unclist_access: AtomicU64::new(0),
            clist_access: AtomicU64::new(0),
            cpage_access: AtomicU64::new(0),
        }
    }

    /// Advance both epoch counters. Called once per memory access, hit or
    /// miss.
    #[inline]
    pub fn record_access(&self) {
        self.uc_epoch.fetch_add(1, Ordering::Relaxed);
        self.cl_epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Route one L2 miss through the residency policy.
    ///
    /// `addr` is the virtual byte address of the miss; the lists key by its
    /// page number.
    pub fn on_l2_miss(&self, addr: address) {
        // warm-up: fill uncompressed first, then compressed
        {
            let mut unclist = self.unclist.lock();
            if !unclist.is_full() {
                unclist.touch(addr);
                return;
            }
        }
        {
            let mut clist = self.clist.lock();
            if !clist.is_full() {
                clist.touch(addr);
                return;
            }
        }

        // both lists full: promotion gate before any hit check, so a cold
        // page cannot skip the tier hierarchy
        {
            let mut unclist = self.unclist.lock();
            let mut clist = self.clist.lock();
            if self.uc_epoch.load(Ordering::Relaxed) >= self.exfreq {
                clist.swap_with(&mut unclist);
                self.uc_epoch.store(0, Ordering::Relaxed);
            }
        }

        // hit in the uncompressed tier
        {
            let mut unclist = self.unclist.lock();
            if unclist.find(addr).is_some() {
                self.unclist_access.fetch_add(1, Ordering::Relaxed);
                if self.uc_epoch.load(Ordering::Relaxed) >= self.unclfreq {
                    unclist.touch(addr);
                    self.uc_epoch.store(0, Ordering::Relaxed);
                } else {
                    unclist.increment_count(addr);
                }
                return;
            }
        }

        // hit in the compressed list, or the slow admission path into it
        {
            let mut clist = self.clist.lock();
            if clist.find(addr).is_some() {
                self.clist_access.fetch_add(1, Ordering::Relaxed);
                if self.cl_epoch.load(Ordering::Relaxed) >= self.clfreq {
                    clist.touch(addr);
                    self.cl_epoch.store(0, Ordering::Relaxed);
                } else {
                    clist.increment_count(addr);
                }
                return;
            }
            if self.cl_epoch.load(Ordering::Relaxed) >= self.clfreq {
                // admit the page, evicting the clist LRU; accounted to the
                // off-tier pool, not to clist
                clist.touch(addr);
                self.cpage_access.fetch_add(1, Ordering::Relaxed);
                self.cl_epoch.store(0, Ordering::Relaxed);
                return;
            }
        }

        // off-tier compressed page the model does not materialize
        self.cpage_access.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counters(&self) -> stats::Tier {
        stats::Tier {
            unclist: self.unclist_access.load(Ordering::Relaxed),
            clist: self.clist_access.load(Ordering::Relaxed),
            cpage: self.cpage_access.load(Ordering::Relaxed),
        }
    }

    /// Zero the pool counters and every in-list access count. List order
    /// is preserved.
    pub fn reset_counters(&self) {
        self.unclist_access.store(0, Ordering::Relaxed);
        self.clist_access.store(0, Ordering::Relaxed);
        self.cpage_access.store(0, Ordering::Relaxed);
        self.unclist.lock().reset_counters();
        self.clist.lock().reset_counters();
    }

    /// Run `f` with both lists held, unclist first.
    pub fn with_lists<R>(&self, f: impl FnOnce(&PageList, &PageList) -> R) -> R {
        let unclist = self.unclist.lock();
        let clist = self.clist.lock();
        f(&unclist, &clist)
    }

    #[must_use]
    pub fn unclist_pages(&self) -> Vec<u64> {
        self.unclist.lock().pages()
    }

    #[must_use]
    pub fn clist_pages(&self) -> Vec<u64> {
        self.clist.lock().pages()
    }

    #[must_use]
    pub fn uc_epoch(&self) -> u64 {
        self.uc_epoch.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cl_epoch(&self) -> u64 {
        self.cl_epoch.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::CuTier;
    use stats::Tier;

    const NEVER: u64 = 1_000_000_000;

    fn page(n: u64) -> u64 {
        n << crate::PAGE_SHIFT
    }

    /// One memory access that misses L2.
    fn miss(tier: &CuTier, addr: u64) {
        tier.record_access();
        tier.on_l2_miss(addr);
    }

    fn assert_disjoint(tier: &CuTier) {
        tier.with_lists(|unclist, clist| {
            for vp in unclist.pages() {
                assert!(
                    clist.find(vp << crate::PAGE_SHIFT).is_none(),
                    "page {vp} resident in both lists"
                );
            }
        });
    }

    #[test]
    fn warm_up_fill_order_and_accounting() {
        // spec scenario: capacities 2/2, refresh and promotion disabled
        let tier = CuTier::new(2, 2, NEVER, NEVER, NEVER);
        for addr in [0x0000, 0x1000, 0x2000, 0x3000] {
            miss(&tier, addr);
        }
        assert_eq!(tier.unclist_pages(), vec![1, 0]);
        assert_eq!(tier.clist_pages(), vec![3, 2]);
        // warm-up fills are not pool accesses
        assert_eq!(tier.counters(), Tier::default());

        miss(&tier, 0x0000);
        assert_eq!(
            tier.counters(),
            Tier {
                unclist: 1,
                clist: 0,
                cpage: 0
            }
        );
        // no refresh below unclfreq: order untouched, count bumped
        assert_eq!(tier.unclist_pages(), vec![1, 0]);
        tier.with_lists(|unclist, _| {
            assert_eq!(unclist.find(0x0000).unwrap().access_count, 2);
        });
        assert_disjoint(&tier);
    }

    #[test]
    fn promotion_swaps_hottest_for_unclist_lru() {
        let tier = CuTier::new(2, 2, NEVER, NEVER, 4);
        // four distinct pages fill both lists; uc_epoch reaches 4
        for addr in [0x0000, 0x1000, 0x2000, 0x3000] {
            miss(&tier, addr);
        }

        // fifth access: both lists full and uc_epoch >= exfreq, so the gate
        // fires immediately. All counts are 1, so the hottest is the clist
        // head (page 3); it swaps with the unclist LRU (page 0).
        miss(&tier, 0x2000);
        assert_eq!(tier.unclist_pages(), vec![3, 1]);
        assert_eq!(tier.clist_pages(), vec![2, 0]);
        assert_eq!(tier.counters().clist, 1);
        assert_eq!(tier.uc_epoch(), 0); // reset by the swap

        // keep hitting page 2 in clist until the gate can fire again
        for _ in 0..3 {
            miss(&tier, 0x2000);
        }
        assert_eq!(tier.counters().clist, 4);

        // uc_epoch is 4 again: this miss promotes page 2 (count 5, strictly
        // hottest) into unclist and demotes the unclist LRU (page 1)
        miss(&tier, 0x2000);
        assert_eq!(tier.unclist_pages(), vec![2, 3]);
        assert_eq!(tier.clist_pages(), vec![0, 1]);
        // after the swap the access lands in unclist
        assert_eq!(tier.counters().unclist, 1);
        assert_eq!(tier.counters().clist, 4);
        assert_disjoint(&tier);
    }

    #[test]
    fn promotion_gate_leaves_cl_epoch_ticking() {
        let tier = CuTier::new(1, 1, NEVER, NEVER, 2);
        miss(&tier, 0x0000);
        miss(&tier, 0x1000);
        assert_eq!(tier.cl_epoch(), 2);

        // gate fires: uc_epoch resets, cl_epoch does not
        miss(&tier, 0x2000);
        assert_eq!(tier.uc_epoch(), 0);
        assert_eq!(tier.cl_epoch(), 3);
    }

    #[test]
    fn clist_refresh_gate_admits_and_counts_cpage() {
        let tier = CuTier::new(1, 1, NEVER, 3, NEVER);
        miss(&tier, 0x0000); // fills unclist
        miss(&tier, 0x1000); // fills clist
        assert_eq!(tier.clist_pages(), vec![1]);

        // absent page, cl_epoch = 3 >= clfreq: admitted by evicting the
        // clist LRU, but accounted as a cpage access
        miss(&tier, 0x2000);
        assert_eq!(tier.clist_pages(), vec![2]);
        assert_eq!(
            tier.counters(),
            Tier {
                unclist: 0,
                clist: 0,
                cpage: 1
            }
        );

        // below the gate now: absent page is plain off-tier
        miss(&tier, 0x3000);
        assert_eq!(tier.clist_pages(), vec![2]);
        assert_eq!(tier.counters().cpage, 2);
    }

    #[test]
    fn unclist_refresh_rewrites_order_only_at_unclfreq() {
        let tier = CuTier::new(2, 1, 4, NEVER, NEVER);
        miss(&tier, 0x0000);
        miss(&tier, 0x1000);
        miss(&tier, 0x2000); // fills clist

        // uc_epoch = 4 >= unclfreq: hit on page 0 refreshes it to MRU
        miss(&tier, 0x0000);
        assert_eq!(tier.unclist_pages(), vec![0, 1]);
        assert_eq!(tier.uc_epoch(), 0);

        // below the gate: hit on page 1 only bumps its count
        miss(&tier, 0x1000);
        assert_eq!(tier.unclist_pages(), vec![0, 1]);
        assert_eq!(tier.counters().unclist, 2);
    }

    #[test]
    fn tied_counts_promote_once_from_the_head() {
        // promotion gate wide open, clist admission closed so the swap is
        // the only movement
        let tier = CuTier::new(2, 2, 1, NEVER, 1);
        for addr in [0x0000, 0x1000, 0x2000, 0x3000] {
            miss(&tier, addr);
        }
        let before_unc = tier.unclist_pages();
        let before_cl = tier.clist_pages();
        assert_eq!(before_cl, vec![3, 2]); // both count 1: tied

        miss(&tier, 0x7000);
        let after_unc = tier.unclist_pages();
        let after_cl = tier.clist_pages();

        // exactly one page crossed each way: the tie went to the clist
        // head, and the demoted page is the old unclist LRU
        let promoted: Vec<_> = after_unc
            .iter()
            .filter(|vp| !before_unc.contains(vp))
            .collect();
        let demoted: Vec<_> = after_cl
            .iter()
            .filter(|vp| !before_cl.contains(vp))
            .collect();
        assert_eq!(promoted, vec![&3]);
        assert_eq!(demoted, vec![&0]);
        assert_eq!(after_unc.len(), 2);
        assert_eq!(after_cl.len(), 2);
        assert_disjoint(&tier);
    }

    #[test]
    fn capacity_sum_is_exact_after_warm_up() {
        let tier = CuTier::new(3, 2, NEVER, NEVER, NEVER);
        for n in 0..20 {
            miss(&tier, page(n));
        }
        tier.with_lists(|unclist, clist| {
            assert_eq!(unclist.len() + clist.len(), 5);
            assert!(unclist.is_full() && clist.is_full());
        });
        assert_disjoint(&tier);
    }

    #[test]
    fn reset_preserves_order_and_zeros_counts() {
        let tier = CuTier::new(2, 2, NEVER, NEVER, NEVER);
        for addr in [0x0000, 0x1000, 0x2000, 0x3000, 0x0000, 0x2000] {
            miss(&tier, addr);
        }
        assert_ne!(tier.counters(), Tier::default());
        let unc_before = tier.unclist_pages();
        let cl_before = tier.clist_pages();

        tier.reset_counters();
        assert_eq!(tier.counters(), Tier::default());
        assert_eq!(tier.unclist_pages(), unc_before);
        assert_eq!(tier.clist_pages(), cl_before);
        tier.with_lists(|unclist, clist| {
            assert!(unclist.iter().chain(clist.iter()).all(|e| e.access_count == 0));
        });
    }
}
