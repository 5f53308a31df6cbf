//! The word-wide compare-and-swap every lock transition is built from.

use core::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release, SeqCst};

use crate::cfg::atomic::{fence, AtomicUsize};

/// Memory ordering requested for a [`cas`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CasOrder {
    success: Ordering,
    fence_on_failure: bool,
}

impl CasOrder {
    /// No ordering on either path.
    pub const RELAXED: Self = Self { success: Relaxed, fence_on_failure: false };

    /// Acquire on success, and an acquire fence after a failed attempt so
    /// that later loads are not hoisted above it.
    pub const ACQUIRE: Self = Self { success: Acquire, fence_on_failure: true };

    /// Release on success, nothing on failure.
    pub const RELEASE: Self = Self { success: Release, fence_on_failure: false };

    /// Acquire and release on success, acquire fence on failure.
    pub const ACQ_REL: Self = Self { success: AcqRel, fence_on_failure: true };

    /// Returns the ordering applied when the exchange succeeds.
    pub const fn success(self) -> Ordering {
        self.success
    }

    /// Returns `true` if a fence is issued after a failed exchange.
    pub const fn fence_on_failure(self) -> bool {
        self.fence_on_failure
    }
}

/// The outcome of a [`cas`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CasResult {
    /// Whether the word was updated.
    pub success: bool,
    /// The word observed in memory, equal to `expected` on success.
    pub observed: usize,
}

/// Atomically replaces `word` with `desired` if it currently holds
/// `expected`.
#[inline]
pub fn cas(word: &AtomicUsize, expected: usize, desired: usize, order: CasOrder) -> CasResult {
    match word.compare_exchange(expected, desired, order.success, Relaxed) {
        Ok(observed) => CasResult { success: true, observed },
        Err(observed) => {
            if order.fence_on_failure {
                fence(Acquire);
            }
            CasResult { success: false, observed }
        }
    }
}

/// Memory barrier kinds, named after the orderings they forbid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membar {
    /// `LoadLoad|LoadStore`: later accesses stay after earlier loads.
    Acquire,
    /// `LoadStore|StoreStore`: earlier accesses stay before later stores.
    Release,
    /// Every ordering, `StoreLoad` included.
    Full,
}

/// Issues a memory barrier.
#[inline]
pub fn membar(kind: Membar) {
    match kind {
        Membar::Acquire => fence(Acquire),
        Membar::Release => fence(Release),
        Membar::Full => fence(SeqCst),
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{cas, membar, CasOrder, Membar};
    use crate::cfg::atomic::AtomicUsize;
    use core::sync::atomic::Ordering::Relaxed;

    #[test]
    fn cas_success_updates_word() {
        let word = AtomicUsize::new(1);
        let res = cas(&word, 1, 42, CasOrder::ACQUIRE);
        assert!(res.success);
        assert_eq!(res.observed, 1);
        assert_eq!(word.load(Relaxed), 42);
    }

    #[test]
    fn cas_failure_reports_observed() {
        let word = AtomicUsize::new(7);
        let res = cas(&word, 1, 42, CasOrder::RELEASE);
        assert!(!res.success);
        assert_eq!(res.observed, 7);
        assert_eq!(word.load(Relaxed), 7);
    }

    #[test]
    fn orders() {
        assert!(CasOrder::ACQUIRE.fence_on_failure());
        assert!(!CasOrder::RELEASE.fence_on_failure());
        assert!(!CasOrder::RELAXED.fence_on_failure());
        membar(Membar::Acquire);
        membar(Membar::Release);
        membar(Membar::Full);
    }
}
