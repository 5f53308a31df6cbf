//! Heavyweight object monitors and their wait-free fast path.

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::Ordering::{Relaxed, Release};

use crate::cas::{cas, membar, CasOrder, Membar};
use crate::cfg::atomic::{AtomicIsize, AtomicUsize};
use crate::fast::Outcome;
use crate::markword::{DisplacedHeader, MarkWord};
use crate::record::LockRecord;
use crate::thread::ThreadIdentity;

/// An inflated lock.
///
/// Once an object's mark word points to its monitor, ownership is decided
/// by the `owner` field alone: zero when free, the owner's identity
/// otherwise. Only the owner writes `owner` and `recursions` without a CAS.
/// `cxq` and `entry_list` stand for the queues of contending threads; the
/// fast path only looks at whether they are empty.
#[repr(C, align(8))]
pub struct ObjectMonitor {
    header: AtomicUsize,
    owner: AtomicUsize,
    recursions: AtomicIsize,
    cxq: AtomicUsize,
    entry_list: AtomicUsize,
}

impl ObjectMonitor {
    /// Creates a new, unowned monitor (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self {
            header: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            recursions: AtomicIsize::new(0),
            cxq: AtomicUsize::new(0),
            entry_list: AtomicUsize::new(0),
        }
    }

    /// Creates a new, unowned monitor with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        Self {
            header: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            recursions: AtomicIsize::new(0),
            cxq: AtomicUsize::new(0),
            entry_list: AtomicUsize::new(0),
        }
    }

    /// Returns the address encoded into an inflated mark word.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Returns the current owner, if any.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn owner(&self) -> Option<ThreadIdentity> {
        ThreadIdentity::from_word(self.owner.load(Relaxed))
    }

    /// Returns the owner's recursion count.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn recursions(&self) -> isize {
        self.recursions.load(Relaxed)
    }

    /// Returns the neutral header displaced when the monitor was installed.
    pub fn header(&self) -> MarkWord {
        MarkWord::new(self.header.load(Relaxed))
    }

    /// Returns `true` if some thread is queued on this monitor.
    pub fn has_waiters(&self) -> bool {
        self.cxq.load(Relaxed) | self.entry_list.load(Relaxed) != 0
    }

    /// Prepares the monitor for publication.
    ///
    /// Must only be called by the thread installing the monitor, before the
    /// inflated mark word is stored with release ordering.
    pub(crate) fn install(&self, header: MarkWord, owner: Option<ThreadIdentity>) {
        self.header.store(header.value(), Relaxed);
        self.owner.store(owner.map_or(0, ThreadIdentity::word), Relaxed);
        self.recursions.store(0, Relaxed);
    }

    /// Tries to take an unowned monitor.
    pub(crate) fn try_own(&self, thread: ThreadIdentity) -> bool {
        cas(&self.owner, 0, thread.word(), CasOrder::ACQUIRE).success
    }

    /// Returns `true` if `thread` owns this monitor.
    pub(crate) fn is_owned_by(&self, thread: ThreadIdentity) -> bool {
        self.owner.load(Relaxed) == thread.word()
    }

    /// Adds one recursive hold. Owner only.
    pub(crate) fn recursive_enter(&self) {
        let recursions = self.recursions.load(Relaxed);
        self.recursions.store(recursions + 1, Relaxed);
    }

    /// Releases one hold, freeing the monitor on the last one. Owner only.
    pub(crate) fn exit(&self) {
        let recursions = self.recursions.load(Relaxed);
        if recursions > 0 {
            self.recursions.store(recursions - 1, Relaxed);
        } else {
            self.owner.store(0, Release);
        }
    }

    /// Announces a contending thread on the `cxq` queue.
    pub(crate) fn enqueue(&self) {
        self.cxq.fetch_add(1, Relaxed);
    }

    /// Withdraws a contending thread from the `cxq` queue.
    pub(crate) fn dequeue(&self) {
        self.cxq.fetch_sub(1, Relaxed);
    }

    /// Attempts the wait-free acquire of an inflated lock.
    ///
    /// Contention is never handled here: a held monitor or a lost race for
    /// `owner` both end in [`Outcome::Fallback`].
    pub(crate) fn fast_enter(&self, record: &LockRecord, thread: ThreadIdentity) -> Outcome {
        // Overwrite the record so a later release sees this is not a stack lock.
        record.set_displaced_header(DisplacedHeader::MonitorSentinel);
        if self.owner.load(Relaxed) != 0 {
            return Outcome::Fallback;
        }
        Outcome::from_success(self.try_own(thread))
    }

    /// Attempts the "1-0" release of an inflated lock.
    ///
    /// Releases with a fence and a plain store when `thread` holds the
    /// monitor exactly once and nobody is queued. A thread that enqueues
    /// between the queue check and the store is not woken here; contending
    /// threads keep polling `owner` after announcing themselves.
    pub(crate) fn fast_exit(&self, thread: ThreadIdentity) -> Outcome {
        let owner = self.owner.load(Relaxed);
        let recursions = self.recursions.load(Relaxed) as usize;
        if (owner ^ thread.word()) | recursions != 0 {
            return Outcome::Fallback;
        }
        if self.has_waiters() {
            return Outcome::Fallback;
        }
        membar(Membar::Release);
        self.owner.store(0, Relaxed);
        Outcome::Success
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for ObjectMonitor {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(tarpaulin_include))]
impl Debug for ObjectMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("owner", &self.owner())
            .field("recursions", &self.recursions())
            .field("has_waiters", &self.has_waiters())
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::ObjectMonitor;
    use crate::fast::Outcome;
    use crate::markword::{DisplacedHeader, MarkWord};
    use crate::record::LockRecord;
    use crate::thread::ThreadIdentity;

    const T1: ThreadIdentity = ThreadIdentity::from_index(1);
    const T2: ThreadIdentity = ThreadIdentity::from_index(2);

    #[test]
    fn enter_free_monitor() {
        let monitor = ObjectMonitor::new();
        let record = LockRecord::new();
        assert_eq!(monitor.fast_enter(&record, T1), Outcome::Success);
        assert_eq!(monitor.owner(), Some(T1));
        assert_eq!(record.displaced_header(), DisplacedHeader::MonitorSentinel);
    }

    #[test]
    fn enter_held_monitor_falls_back() {
        let monitor = ObjectMonitor::new();
        monitor.install(MarkWord::NEUTRAL, Some(T2));
        let record = LockRecord::new();
        assert_eq!(monitor.fast_enter(&record, T1), Outcome::Fallback);
        assert_eq!(monitor.owner(), Some(T2));
        assert_eq!(monitor.recursions(), 0);
    }

    #[test]
    fn enter_own_monitor_falls_back() {
        let monitor = ObjectMonitor::new();
        monitor.install(MarkWord::NEUTRAL, Some(T1));
        let record = LockRecord::new();
        assert_eq!(monitor.fast_enter(&record, T1), Outcome::Fallback);
    }

    #[test]
    fn one_zero_exit() {
        let monitor = ObjectMonitor::new();
        monitor.install(MarkWord::NEUTRAL, Some(T1));
        assert_eq!(monitor.fast_exit(T1), Outcome::Success);
        assert_eq!(monitor.owner(), None);
    }

    #[test]
    fn exit_with_pending_waiter_falls_back() {
        let monitor = ObjectMonitor::new();
        monitor.install(MarkWord::NEUTRAL, Some(T1));
        monitor.enqueue();
        assert_eq!(monitor.fast_exit(T1), Outcome::Fallback);
        assert_eq!(monitor.owner(), Some(T1));
        monitor.dequeue();
        assert!(!monitor.has_waiters());
    }

    #[test]
    fn exit_recursive_or_foreign_falls_back() {
        let monitor = ObjectMonitor::new();
        monitor.install(MarkWord::NEUTRAL, Some(T1));
        assert_eq!(monitor.fast_exit(T2), Outcome::Fallback);
        monitor.recursive_enter();
        assert_eq!(monitor.fast_exit(T1), Outcome::Fallback);
        monitor.exit();
        assert_eq!(monitor.recursions(), 0);
        assert_eq!(monitor.owner(), Some(T1));
        monitor.exit();
        assert_eq!(monitor.owner(), None);
    }
}
