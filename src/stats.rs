//! Diagnostic counters for the paths taken by lock operations.
//!
//! Counters are only ever incremented by the lock code, with relaxed atomic
//! adds, and are meant to be read from the outside with
//! [`LockCounters::snapshot`].

use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::Relaxed;

/// The paths counted by [`LockCounters`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Every call to `fast_lock`.
    TotalEntry,
    /// Re-entries of a bias already held by the caller.
    BiasedLockEntry,
    /// Biases taken from the anonymously biased state.
    AnonymouslyBiasedLockEntry,
    /// Biases transferred after their epoch expired.
    RebiasedLockEntry,
    /// Biases revoked because the class is no longer biasable.
    RevokedLockEntry,
    /// Stack locks taken by CAS or by the recursion test.
    FastPathEntry,
    /// Acquisitions that went through the slow path.
    SlowPathEntry,
}

impl Counter {
    const COUNT: usize = 7;
}

/// A set of process-wide lock path counters.
///
/// # Example
///
/// ```
/// use marklock::{Counter, LockCounters};
///
/// static COUNTERS: LockCounters = LockCounters::new();
/// assert_eq!(COUNTERS.snapshot().total_entry, 0);
/// assert_eq!(COUNTERS.get(Counter::SlowPathEntry), 0);
/// ```
#[derive(Debug)]
pub struct LockCounters {
    counts: [AtomicUsize; Counter::COUNT],
}

impl LockCounters {
    /// Creates a set of zeroed counters.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self { counts: [ZERO; Counter::COUNT] }
    }

    /// Increments `counter` by one.
    #[inline]
    pub fn increment(&self, counter: Counter) {
        self.counts[counter as usize].fetch_add(1, Relaxed);
    }

    /// Returns the current value of `counter`.
    pub fn get(&self, counter: Counter) -> usize {
        self.counts[counter as usize].load(Relaxed)
    }

    /// Reads every counter.
    ///
    /// Counters are read one at a time, so a snapshot taken while other
    /// threads are locking is not a consistent cut.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_entry: self.get(Counter::TotalEntry),
            biased_lock_entry: self.get(Counter::BiasedLockEntry),
            anonymously_biased_lock_entry: self.get(Counter::AnonymouslyBiasedLockEntry),
            rebiased_lock_entry: self.get(Counter::RebiasedLockEntry),
            revoked_lock_entry: self.get(Counter::RevokedLockEntry),
            fast_path_entry: self.get(Counter::FastPathEntry),
            slow_path_entry: self.get(Counter::SlowPathEntry),
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for LockCounters {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

/// Plain values read from a [`LockCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CounterSnapshot {
    pub total_entry: usize,
    pub biased_lock_entry: usize,
    pub anonymously_biased_lock_entry: usize,
    pub rebiased_lock_entry: usize,
    pub revoked_lock_entry: usize,
    pub fast_path_entry: usize,
    pub slow_path_entry: usize,
}

/// Increments `counter` if counting is enabled.
#[inline(always)]
pub(crate) fn count(counters: Option<&LockCounters>, counter: Counter) {
    if let Some(counters) = counters {
        counters.increment(counter);
    }
}

#[cfg(test)]
mod test {
    use super::{count, Counter, CounterSnapshot, LockCounters};

    #[test]
    fn increments_are_counted() {
        let counters = LockCounters::new();
        counters.increment(Counter::TotalEntry);
        counters.increment(Counter::TotalEntry);
        count(Some(&counters), Counter::SlowPathEntry);
        count(None, Counter::SlowPathEntry);
        let snapshot = counters.snapshot();
        let expected = CounterSnapshot { total_entry: 2, slow_path_entry: 1, ..Default::default() };
        assert_eq!(snapshot, expected);
    }
}
