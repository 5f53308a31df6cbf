//! A reference slow path for contended locks.
//!
//! The [`Synchronizer`] runs the fast path first and only does contended
//! work when it falls back. It inflates stack locks other threads hold,
//! revokes biases that may be revoked without stopping their owner, and
//! waits on inflated monitors by polling their owner with a [`Relax`]
//! policy. Waiters never park: a thread that announced itself on a
//! monitor keeps polling the owner field, so an owner releasing through
//! the "1-0" fast exit without noticing it cannot leave it stranded.
//!
//! The following modules provide type aliases for [`Synchronizer`]
//! associated with a relax policy. See their documentation for more
//! information.
//!
//! [`Relax`]: crate::relax::Relax

use core::marker::PhantomData;

use crate::cas::{cas, CasOrder};
use crate::fast::{DiagnoseValueBased, FastPath};
use crate::markword::{DisplacedHeader, LockState, MarkWord};
use crate::object::ObjectHeader;
use crate::platform::{NativeStack, Platform};
use crate::record::LockRecord;
use crate::relax::{Relax, Spin};
use crate::stack;
use crate::stats::Counter;
use crate::thread::ThreadIdentity;

/// A lock slow path built around a [`FastPath`].
///
/// Objects locked through a `Synchronizer` may be locked and unlocked
/// through the bare fast path as well, as long as every acquisition that
/// falls back is completed here.
///
/// # Examples
///
/// ```
/// use marklock::{FastPath, LockConfig, LockRecord, NativeStack};
/// use marklock::{ObjectClass, ObjectHeader, ThreadIdentity};
/// use marklock::synchronizer::spins::Synchronizer;
///
/// static CLASS: ObjectClass = ObjectClass::new();
/// let sync = Synchronizer::new(FastPath::new(LockConfig::DEFAULT, NativeStack::new()));
/// let header = ObjectHeader::new(&CLASS);
/// let thread = ThreadIdentity::from_index(0);
/// let record = LockRecord::new();
///
/// // SAFETY: `record` outlives the acquisition and `thread` is unique.
/// unsafe {
///     sync.enter(&header, &record, thread);
///     assert!(header.is_locked());
///     sync.exit(&header, &record, thread);
/// }
/// assert!(!header.is_locked());
/// ```
#[derive(Debug)]
pub struct Synchronizer<P = NativeStack, R = Spin> {
    fast: FastPath<P>,
    marker: PhantomData<R>,
}

impl<P, R> Synchronizer<P, R> {
    /// Creates a slow path on top of `fast`.
    pub const fn new(fast: FastPath<P>) -> Self {
        Self { fast, marker: PhantomData }
    }

    /// Returns the underlying fast path.
    pub fn fast_path(&self) -> &FastPath<P> {
        &self.fast
    }
}

impl<P: Platform, R: Relax> Synchronizer<P, R> {
    /// Locks `header` on behalf of `thread`, waiting as long as needed.
    ///
    /// Locking an object the caller already holds succeeds immediately, and
    /// must be matched by its own [`exit`]. A live bias held by another
    /// thread in the current epoch can only be removed by the runtime, by
    /// disabling biasing for the class or moving the shared [`BiasEpoch`]
    /// to a new epoch, and this call waits until that happens. The biasing
    /// state is read again on every attempt.
    ///
    /// # Panics
    ///
    /// Panics if `header` belongs to a value-based class and the
    /// configuration asks for [`DiagnoseValueBased::Fatal`].
    ///
    /// # Safety
    ///
    /// `record` must stay alive, at the same address and unused by any other
    /// acquisition, until the matching [`exit`] returns. This holds for
    /// every acquisition of `header`, including those made through the
    /// bare fast path, since contending threads read the owner's record.
    /// `thread` must be the identity of the calling thread, and no other
    /// live thread may use it.
    ///
    /// [`exit`]: Synchronizer::exit
    /// [`BiasEpoch`]: crate::BiasEpoch
    pub unsafe fn enter(
        &self,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) {
        // SAFETY: Same contract as ours.
        if unsafe { self.fast.fast_lock(header, record, thread) }.is_success() {
            return;
        }
        self.fast.count(Counter::SlowPathEntry);
        self.diagnose(header);
        let mut relax = R::new();
        loop {
            let mark = header.load_mark();
            if mark.is_inflating() {
                relax.relax();
                continue;
            }
            match mark.classify() {
                LockState::Neutral => {
                    let platform = self.fast.platform();
                    if stack::acquire(header, record, thread, platform, mark, None).is_success() {
                        return;
                    }
                }
                LockState::Biased { thread: owner, epoch } => {
                    let bias = self.fast.bias();
                    let live = bias.enabled
                        && header.class().is_biasable()
                        && epoch == bias.current_epoch;
                    if live && owner == thread.word() {
                        return;
                    }
                    if live && owner != 0 {
                        relax.relax();
                        continue;
                    }
                    revoke(header, mark);
                }
                LockState::StackLocked(addr) => {
                    // SAFETY: Caller guarantees that every record published
                    // into the mark word outlives its acquisition.
                    unsafe { inflate(header, mark, addr) };
                }
                LockState::Inflated(_) => {
                    let monitor = header.monitor();
                    record.set_displaced_header(DisplacedHeader::MonitorSentinel);
                    if monitor.is_owned_by(thread) {
                        monitor.recursive_enter();
                        return;
                    }
                    monitor.enqueue();
                    while !(monitor.owner().is_none() && monitor.try_own(thread)) {
                        relax.relax();
                    }
                    monitor.dequeue();
                    return;
                }
            }
        }
    }

    /// Unlocks `header`, previously locked by `thread` through `record`.
    ///
    /// # Safety
    ///
    /// `header` must be held by `thread` through `record`, acquired by
    /// [`enter`] or by a successful [`FastPath::fast_lock`].
    ///
    /// [`enter`]: Synchronizer::enter
    pub unsafe fn exit(
        &self,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) {
        // SAFETY: Same contract as ours.
        if unsafe { self.fast.fast_unlock(header, record, thread) }.is_success() {
            return;
        }
        if let DisplacedHeader::Recursive = record.displaced_header() {
            return;
        }
        let mut relax = R::new();
        loop {
            let mark = header.load_mark();
            if mark.is_inflating() {
                // Our stack lock is being inflated.
                relax.relax();
                continue;
            }
            match mark.classify() {
                LockState::StackLocked(addr) if addr == record.addr() => {
                    let DisplacedHeader::Unlocked(neutral) = record.displaced_header() else {
                        debug_assert!(false, "stack lock without a displaced header");
                        return;
                    };
                    let word = header.mark_word();
                    if cas(word, mark.value(), neutral.value(), CasOrder::RELEASE).success {
                        return;
                    }
                }
                LockState::Inflated(_) => {
                    let monitor = header.monitor();
                    debug_assert!(monitor.is_owned_by(thread), "monitor exit by a non-owner");
                    monitor.exit();
                    return;
                }
                state => {
                    debug_assert!(false, "unlock of an object the caller does not hold: {state:?}");
                    return;
                }
            }
        }
    }

    /// Reports synchronization on a value-based instance.
    fn diagnose(&self, header: &ObjectHeader<'_>) {
        if !self.fast.diagnoses(header) {
            return;
        }
        match self.fast.config().diagnose_value_based {
            DiagnoseValueBased::Fatal => {
                panic!("synchronization on an instance of a value-based class")
            }
            DiagnoseValueBased::Warn => {
                log::warn!("synchronization on an instance of a value-based class");
            }
            DiagnoseValueBased::Disabled => {}
        }
    }
}

/// Resets a biased `mark` to the neutral header, keeping its age.
///
/// Losing the race means someone else changed the header, which the caller
/// reloads anyway.
fn revoke(header: &ObjectHeader<'_>, mark: MarkWord) {
    let neutral = MarkWord::NEUTRAL.value() | mark.age_bits();
    if cas(header.mark_word(), mark.value(), neutral, CasOrder::ACQUIRE).success {
        log::trace!("revoked bias {mark:?}");
    }
}

/// Inflates the stack lock `mark`, whose lock record lives at `addr`.
///
/// The mark word is first swapped for the inflating marker. From then on
/// the owner's release CAS fails, so its record stays put while the
/// displaced header and the owner are copied into the monitor.
///
/// # Safety
///
/// If `mark` is still the header's mark word, `addr` must be the address of
/// a live lock record that holds the acquisition.
unsafe fn inflate(header: &ObjectHeader<'_>, mark: MarkWord, addr: usize) {
    let res = cas(header.mark_word(), mark.value(), MarkWord::INFLATING.value(), CasOrder::ACQUIRE);
    if !res.success {
        return;
    }
    // SAFETY: The mark word held `addr` and now holds the inflating marker,
    // so the acquisition is not over and caller guarantees it is alive.
    let record = unsafe { &*(addr as *const LockRecord) };
    let displaced = match record.displaced_header() {
        DisplacedHeader::Unlocked(neutral) => neutral,
        other => {
            debug_assert!(false, "published lock record holds {other:?}");
            MarkWord::NEUTRAL
        }
    };
    header.publish_monitor(displaced, record.owner());
    log::trace!("inflated {:#x} owned by {:?}", header.monitor().addr(), record.owner());
}

/// A [`Synchronizer`] that implements a `spin` relax policy.
///
/// While waiting, it spins while signaling the processor that it is running
/// a busy-wait spin-loop.
pub mod spins {
    use crate::platform::NativeStack;
    use crate::relax::Spin;

    /// A [`Synchronizer`] that implements the [`Spin`] relax policy.
    ///
    /// [`Synchronizer`]: super::Synchronizer
    pub type Synchronizer<P = NativeStack> = super::Synchronizer<P, Spin>;

    /// A [`Synchronizer`] that implements a `spin with backoff` relax policy.
    ///
    /// [`Synchronizer`]: super::Synchronizer
    pub mod backoff {
        use crate::platform::NativeStack;
        use crate::relax::SpinBackoff;

        /// A [`Synchronizer`] that implements the [`SpinBackoff`] relax
        /// policy.
        ///
        /// [`Synchronizer`]: crate::synchronizer::Synchronizer
        pub type Synchronizer<P = NativeStack> =
            crate::synchronizer::Synchronizer<P, SpinBackoff>;
    }
}

/// A [`Synchronizer`] that implements a `yield` relax policy.
///
/// While waiting, it yields the current time slice to the OS scheduler.
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub mod yields {
    use crate::platform::NativeStack;
    use crate::relax::Yield;

    /// A [`Synchronizer`] that implements the [`Yield`] relax policy.
    ///
    /// [`Synchronizer`]: super::Synchronizer
    pub type Synchronizer<P = NativeStack> = super::Synchronizer<P, Yield>;

    /// A [`Synchronizer`] that implements a `yield with backoff` relax
    /// policy.
    ///
    /// [`Synchronizer`]: super::Synchronizer
    #[cfg(feature = "yield")]
    pub mod backoff {
        use crate::platform::NativeStack;
        use crate::relax::YieldBackoff;

        /// A [`Synchronizer`] that implements the [`YieldBackoff`] relax
        /// policy.
        ///
        /// [`Synchronizer`]: crate::synchronizer::Synchronizer
        pub type Synchronizer<P = NativeStack> =
            crate::synchronizer::Synchronizer<P, YieldBackoff>;
    }
}

/// A [`Synchronizer`] that implements a `loop` relax policy.
///
/// While waiting, it rapidly spins without telling the processor.
pub mod loops {
    use crate::platform::NativeStack;
    use crate::relax::Loop;

    /// A [`Synchronizer`] that implements the [`Loop`] relax policy.
    ///
    /// [`Synchronizer`]: super::Synchronizer
    pub type Synchronizer<P = NativeStack> = super::Synchronizer<P, Loop>;
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{fence, AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::spins::Synchronizer;
    use crate::bias::{BiasConfig, BiasEpoch};
    use crate::fast::{DiagnoseValueBased, FastPath, LockConfig, Outcome};
    use crate::markword::{DisplacedHeader, LockState, MarkWord};
    use crate::object::{ObjectClass, ObjectHeader};
    use crate::platform::NativeStack;
    use crate::record::LockRecord;
    use crate::stats::LockCounters;
    use crate::test::FarStack;
    use crate::thread::ThreadIdentity;

    const T1: ThreadIdentity = ThreadIdentity::from_index(1);
    const T2: ThreadIdentity = ThreadIdentity::from_index(2);

    fn synchronizer(config: LockConfig) -> Synchronizer {
        Synchronizer::new(FastPath::new(config, NativeStack::new()))
    }

    fn synchronizer_over(epoch: &'static BiasEpoch) -> Synchronizer {
        let fast = FastPath::new(LockConfig::DEFAULT, NativeStack::new());
        Synchronizer::new(fast.with_bias_epoch(epoch))
    }

    #[test]
    fn inflating_a_foreign_stack_lock_keeps_its_owner() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let sync = synchronizer(LockConfig::DEFAULT);
        let header = Arc::new(ObjectHeader::new(&CLASS));
        let record = LockRecord::new();
        unsafe { sync.enter(&header, &record, T1) };
        assert_eq!(header.mark().classify(), LockState::StackLocked(record.addr()));

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let (header, entered) = (Arc::clone(&header), Arc::clone(&entered));
            thread::spawn(move || {
                let sync = synchronizer(LockConfig::DEFAULT);
                let record = LockRecord::new();
                unsafe { sync.enter(&header, &record, T2) };
                entered.store(true, Ordering::SeqCst);
                unsafe { sync.exit(&header, &record, T2) };
            })
        };
        while !header.mark().has_monitor() {
            thread::yield_now();
        }
        fence(Ordering::Acquire);
        assert_eq!(header.monitor().owner(), Some(T1));
        assert_eq!(header.monitor().header(), MarkWord::NEUTRAL);
        assert!(!entered.load(Ordering::SeqCst));

        // The owner's stack unlock now goes through the monitor.
        unsafe { sync.exit(&header, &record, T1) };
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(header.mark().has_monitor());
        assert!(!header.is_locked());
    }

    #[test]
    fn far_recursion_inflates_to_self() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let sync = Synchronizer::new(FastPath::new(LockConfig::DEFAULT, FarStack));
        let header = ObjectHeader::new(&CLASS);
        let (outer, inner) = (LockRecord::new(), LockRecord::new());
        unsafe { sync.enter(&header, &outer, T1) };
        unsafe { sync.enter(&header, &inner, T1) };
        assert!(header.mark().has_monitor());
        assert_eq!(header.monitor().owner(), Some(T1));
        assert_eq!(header.monitor().recursions(), 1);
        assert_eq!(inner.displaced_header(), DisplacedHeader::MonitorSentinel);
        unsafe { sync.exit(&header, &inner, T1) };
        assert_eq!(header.monitor().recursions(), 0);
        assert!(header.is_locked());
        unsafe { sync.exit(&header, &outer, T1) };
        assert!(!header.is_locked());
    }

    #[test]
    fn slow_path_is_counted() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        static COUNTERS: LockCounters = LockCounters::new();
        let fast = FastPath::new(LockConfig::DEFAULT, FarStack).with_counters(&COUNTERS);
        let sync = Synchronizer::new(fast);
        let header = ObjectHeader::new(&CLASS);
        let (outer, inner) = (LockRecord::new(), LockRecord::new());
        unsafe {
            sync.enter(&header, &outer, T1);
            sync.enter(&header, &inner, T1);
            sync.exit(&header, &inner, T1);
            sync.exit(&header, &outer, T1);
        }
        let snapshot = COUNTERS.snapshot();
        assert_eq!(snapshot.total_entry, 2);
        assert_eq!(snapshot.fast_path_entry, 1);
        assert_eq!(snapshot.slow_path_entry, 1);
    }

    #[test]
    fn anonymous_bias_is_revoked_when_biasing_is_off() {
        static CLASS: ObjectClass = ObjectClass::new();
        let sync = synchronizer(LockConfig::DEFAULT);
        let biased = MarkWord::encode_biased(0, 1, 2);
        let header = ObjectHeader::with_mark(&CLASS, biased);
        let record = LockRecord::new();
        unsafe { sync.enter(&header, &record, T1) };
        assert_eq!(header.mark().classify(), LockState::StackLocked(record.addr()));
        unsafe { sync.exit(&header, &record, T1) };
        assert!(header.mark().is_neutral());
        assert_eq!(header.mark().age(), 2);
    }

    #[test]
    fn live_foreign_bias_waits_for_revocation() {
        static CLASS: ObjectClass = ObjectClass::new();
        let bias = BiasConfig::enabled(1);
        let config = LockConfig::DEFAULT.with_bias(bias);
        let header = Arc::new(ObjectHeader::with_prototype(&CLASS, &bias));
        let record = LockRecord::new();
        let fast = FastPath::new(config, NativeStack::new());
        unsafe {
            assert_eq!(fast.fast_lock(&header, &record, T1), Outcome::Success);
            assert_eq!(fast.fast_unlock(&header, &record, T1), Outcome::Success);
        }

        let handle = {
            let header = Arc::clone(&header);
            thread::spawn(move || {
                let sync = synchronizer(config);
                let record = LockRecord::new();
                unsafe { sync.enter(&header, &record, T2) };
                unsafe { sync.exit(&header, &record, T2) };
            })
        };
        // No thread holds a biased lock on `CLASS` instances from here on.
        CLASS.revoke_biasing();
        handle.join().unwrap();
        assert!(header.mark().is_neutral());
    }

    #[test]
    fn released_bias_of_exited_thread_is_taken_after_bulk_rebias() {
        static CLASS: ObjectClass = ObjectClass::new();
        static EPOCH: BiasEpoch = BiasEpoch::new(BiasConfig::enabled(0));
        let header = Arc::new(ObjectHeader::with_prototype(&CLASS, &EPOCH.load()));

        // T1 biases the object, releases it and exits.
        {
            let header = Arc::clone(&header);
            thread::spawn(move || {
                let sync = synchronizer_over(&EPOCH);
                let record = LockRecord::new();
                unsafe {
                    sync.enter(&header, &record, T1);
                    sync.exit(&header, &record, T1);
                }
            })
            .join()
            .unwrap();
        }
        assert_eq!(header.mark(), MarkWord::encode_biased(T1.word(), 0, 0));

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let (header, entered) = (Arc::clone(&header), Arc::clone(&entered));
            thread::spawn(move || {
                let sync = synchronizer_over(&EPOCH);
                let record = LockRecord::new();
                unsafe { sync.enter(&header, &record, T2) };
                entered.store(true, Ordering::SeqCst);
                unsafe { sync.exit(&header, &record, T2) };
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        // SAFETY: T1 holds no lock any longer.
        unsafe { EPOCH.bulk_rebias() };
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!header.is_locked());

        // A thread arriving after the bulk rebias takes the bias over.
        let header = ObjectHeader::with_mark(&CLASS, MarkWord::encode_biased(T1.word(), 0, 0));
        let record = LockRecord::new();
        let sync = synchronizer_over(&EPOCH);
        unsafe { sync.enter(&header, &record, T2) };
        assert_eq!(header.mark(), MarkWord::encode_biased(T2.word(), 1, 0));
        unsafe { sync.exit(&header, &record, T2) };
    }

    #[test]
    #[should_panic(expected = "value-based")]
    fn fatal_value_based_diagnostic() {
        static CLASS: ObjectClass = ObjectClass::value_based();
        let config = LockConfig::DEFAULT.with_diagnose_value_based(DiagnoseValueBased::Fatal);
        let sync = synchronizer(config);
        let header = ObjectHeader::new(&CLASS);
        let record = LockRecord::new();
        unsafe { sync.enter(&header, &record, T1) };
    }

    #[test]
    fn warn_value_based_diagnostic_still_locks() {
        static CLASS: ObjectClass = ObjectClass::value_based();
        let config = LockConfig::DEFAULT.with_diagnose_value_based(DiagnoseValueBased::Warn);
        let sync = synchronizer(config);
        let header = ObjectHeader::new(&CLASS);
        let record = LockRecord::new();
        unsafe { sync.enter(&header, &record, T1) };
        assert!(header.is_locked());
        unsafe { sync.exit(&header, &record, T1) };
        assert!(!header.is_locked());
    }
}
