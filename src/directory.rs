//! A banked, lock-per-line sharer registry used by cache-hierarchy consumers of the trace stream
//! to record which CPU ids currently hold (and have ever held) each cache line.
//!
//! `L2LINESZ` is the log2 of the cache-line size, encoded as a const generic the way the original
//! C++ directory templated on it. `DIR_BANKS` is a fixed module constant rather than a second
//! const generic: the original compiled a single value for it, and nothing here calls for varying
//! it per instance (see DESIGN.md).

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Number of independent banks the directory's address space is split across.
pub const DIR_BANKS: usize = 16;

/// Sentinel meaning "no id currently holds this line's lock".
const NO_HOLDER: i64 = -1;

struct Entry {
    holder: AtomicI64,
    present: spin::Mutex<HashSet<i64>>,
    alltime: spin::Mutex<HashSet<i64>>,
}

impl Entry {
    fn new() -> Self {
        Entry {
            holder: AtomicI64::new(NO_HOLDER),
            present: spin::Mutex::new(HashSet::new()),
            alltime: spin::Mutex::new(HashSet::new()),
        }
    }
}

struct Bank {
    lock: spin::Mutex<()>,
    entries: spin::Mutex<HashMap<u64, Arc<Entry>>>,
}

impl Bank {
    fn new() -> Self {
        Bank {
            lock: spin::Mutex::new(()),
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Looks up (creating if absent) the entry for `addr`. The bank lock is held only across this
    /// insertion, never across a client operation (invariant I3).
    fn entry(&self, addr: u64) -> Arc<Entry> {
        let _guard = self.lock.lock();
        let mut entries = self.entries.lock();
        match entries.entry(addr) {
            MapEntry::Occupied(o) => o.get().clone(),
            MapEntry::Vacant(v) => {
                let entry = Arc::new(Entry::new());
                v.insert(entry.clone());
                entry
            }
        }
    }
}

/// A banked, lock-per-line cache-coherence directory.
///
/// Every line address presented to the directory must be aligned to `2^L2LINESZ` bytes; this is
/// enforced with a `debug_assert!`, gated behind `cfg(debug_assertions)`, per the precondition
/// taxonomy in this crate's error-handling design.
pub struct CoherenceDirectory<const L2LINESZ: u32> {
    banks: Vec<Bank>,
    /// When set, the sharing histogram is logged on drop (mirrors the original's `printResults`).
    histogram: bool,
}

impl<const L2LINESZ: u32> CoherenceDirectory<L2LINESZ> {
    /// Creates a directory with `DIR_BANKS` banks. `histogram` controls whether a sharing
    /// histogram is logged when the directory is dropped.
    pub fn new(histogram: bool) -> Self {
        let mut banks = Vec::with_capacity(DIR_BANKS);
        for _ in 0..DIR_BANKS {
            banks.push(Bank::new());
        }
        CoherenceDirectory { banks, histogram }
    }

    fn check_aligned(addr: u64) {
        debug_assert_eq!(addr % (1u64 << L2LINESZ), 0, "line address not aligned to 2^L2LINESZ");
    }

    fn bank_idx(addr: u64) -> usize {
        ((addr >> L2LINESZ) as usize) % DIR_BANKS
    }

    fn entry(&self, addr: u64) -> Arc<Entry> {
        self.banks[Self::bank_idx(addr)].entry(addr)
    }

    /// Acquires the lock for `addr` on behalf of `id`. Reentrant: if `id` already holds the lock,
    /// returns immediately.
    pub fn lock_addr(&self, addr: u64, id: i64) {
        Self::check_aligned(addr);
        let entry = self.entry(addr);

        if entry.holder.load(Ordering::Acquire) == id {
            return;
        }

        loop {
            match entry
                .holder
                .compare_exchange_weak(NO_HOLDER, id, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    /// Releases the lock for `addr` held by `id`. If `id` does not hold the lock, returns
    /// silently (a non-holder unlock is not an error per the error-handling taxonomy).
    pub fn unlock_addr(&self, addr: u64, id: i64) {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        let _ = entry
            .holder
            .compare_exchange(id, NO_HOLDER, Ordering::Release, Ordering::Relaxed);
    }

    /// Inserts `id` into `present` and `alltime`. Precondition: `id` holds `addr`'s lock and is
    /// not already present.
    pub fn add_addr(&self, addr: u64, id: i64) {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        debug_assert_eq!(entry.holder.load(Ordering::Acquire), id, "add_addr without holding the lock");
        let mut present = entry.present.lock();
        debug_assert!(!present.contains(&id), "add_addr of an already-present id");
        present.insert(id);
        entry.alltime.lock().insert(id);
    }

    /// Removes `id` from `present` (never from `alltime`). Precondition: `id` holds `addr`'s
    /// lock. If `id` is already absent, returns silently (a benign race, e.g. icache eviction
    /// crossing a coherence event).
    pub fn rem_addr(&self, addr: u64, id: i64) {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        debug_assert_eq!(entry.holder.load(Ordering::Acquire), id, "rem_addr without holding the lock");
        entry.present.lock().remove(&id);
    }

    /// Whether `id` is a current sharer of `addr`. Precondition: `id` holds `addr`'s lock.
    pub fn has_id(&self, addr: u64, id: i64) -> bool {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        debug_assert_eq!(entry.holder.load(Ordering::Acquire), id, "has_id without holding the lock");
        entry.present.lock().contains(&id)
    }

    /// A snapshot of the current sharers of `addr`. Precondition: `id` holds `addr`'s lock.
    pub fn ids(&self, addr: u64, id: i64) -> Vec<i64> {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        debug_assert_eq!(entry.holder.load(Ordering::Acquire), id, "ids without holding the lock");
        entry.present.lock().iter().copied().collect()
    }

    /// Replaces `present` with the single-element set `{remaining}`. `alltime` is untouched.
    /// Precondition: `remaining` holds `addr`'s lock.
    pub fn clear_ids(&self, addr: u64, remaining: i64) {
        Self::check_aligned(addr);
        let entry = self.entry(addr);
        debug_assert_eq!(
            entry.holder.load(Ordering::Acquire),
            remaining,
            "clear_ids without holding the lock"
        );
        let mut present = entry.present.lock();
        present.clear();
        present.insert(remaining);
    }
}

impl<const L2LINESZ: u32> Drop for CoherenceDirectory<L2LINESZ> {
    fn drop(&mut self) {
        if !self.histogram {
            return;
        }

        let mut n_sharers: HashMap<usize, usize> = HashMap::new();
        let mut max_sharers = 0;

        for bank in &self.banks {
            for entry in bank.entries.lock().values() {
                let s = entry.alltime.lock().len();
                *n_sharers.entry(s).or_insert(0) += 1;
                if s > max_sharers {
                    max_sharers = s;
                }
            }
        }

        let histogram: Vec<usize> = (1..=max_sharers).map(|i| *n_sharers.get(&i).unwrap_or(&0)).collect();
        tracing::info!(?histogram, "coherence directory sharing histogram");
    }
}
