//! The lock fast path.
//!
//! [`FastPath::fast_lock`] and [`FastPath::fast_unlock`] try, in order, the
//! biased, stack-locked and inflated tiers of an object's lock. Each tier
//! makes at most one atomic read-modify-write and never waits: whenever a
//! transition is ambiguous or loses a race, the operation returns
//! [`Outcome::Fallback`] and leaves the lock to a slow path, such as the
//! [`Synchronizer`].
//!
//! [`Synchronizer`]: crate::Synchronizer

use crate::bias::{self, BiasConfig, BiasEpoch};
use crate::markword::LockState;
use crate::object::ObjectHeader;
use crate::platform::{NativeStack, Platform};
use crate::record::LockRecord;
use crate::stack;
use crate::stats::{self, Counter, LockCounters};
use crate::thread::ThreadIdentity;

/// The result of a fast-path lock operation.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// The operation made no change that needs undoing, and the slow path
    /// must complete it.
    Fallback,
}

impl Outcome {
    /// Returns `true` if the operation completed.
    #[inline(always)]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns `true` if the slow path must take over.
    #[inline(always)]
    pub const fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback)
    }

    #[inline(always)]
    pub(crate) const fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Fallback
        }
    }
}

/// What to do when a thread synchronizes on an instance of a value-based
/// class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiagnoseValueBased {
    /// Lock value-based instances like any other object.
    #[default]
    Disabled,
    /// Log a warning on every such acquisition.
    Warn,
    /// Panic on every such acquisition.
    Fatal,
}

/// Run-time configuration of the lock operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockConfig {
    /// Biased locking state, unless a shared [`BiasEpoch`] is attached to
    /// the fast path.
    pub bias: BiasConfig,
    /// Value-based class diagnostics. When enabled, instances of value-based
    /// classes always take the slow path, which reports them.
    pub diagnose_value_based: DiagnoseValueBased,
}

impl LockConfig {
    /// Biasing and diagnostics both disabled.
    pub const DEFAULT: Self =
        Self { bias: BiasConfig::DISABLED, diagnose_value_based: DiagnoseValueBased::Disabled };

    /// Returns this configuration with `bias` as biasing state.
    pub const fn with_bias(self, bias: BiasConfig) -> Self {
        Self { bias, ..self }
    }

    /// Returns this configuration with `diagnose` for value-based classes.
    pub const fn with_diagnose_value_based(self, diagnose: DiagnoseValueBased) -> Self {
        Self { diagnose_value_based: diagnose, ..self }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for LockConfig {
    #[inline(always)]
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The lock fast path over a [`Platform`].
///
/// A `FastPath` holds no lock state of its own; every object carries its
/// lock in its [`ObjectHeader`], so a single instance can serve any number
/// of objects and threads.
///
/// # Examples
///
/// ```
/// use marklock::{FastPath, LockConfig, LockRecord, NativeStack, Outcome};
/// use marklock::{ObjectClass, ObjectHeader, ThreadIdentity};
///
/// static CLASS: ObjectClass = ObjectClass::unbiasable();
/// let fast = FastPath::new(LockConfig::DEFAULT, NativeStack::new());
/// let header = ObjectHeader::new(&CLASS);
/// let record = LockRecord::new();
/// let thread = ThreadIdentity::from_index(0);
///
/// // SAFETY: `record` outlives the acquisition and `thread` is unique.
/// unsafe {
///     assert_eq!(fast.fast_lock(&header, &record, thread), Outcome::Success);
///     assert!(header.is_locked());
///     assert_eq!(fast.fast_unlock(&header, &record, thread), Outcome::Success);
/// }
/// assert!(!header.is_locked());
/// ```
///
/// Locking publishes the record address into the header, so it can't be
/// done from safe code:
///
/// ```compile_fail,E0133
/// use marklock::{FastPath, LockConfig, LockRecord, NativeStack};
/// use marklock::{ObjectClass, ObjectHeader, ThreadIdentity};
///
/// static CLASS: ObjectClass = ObjectClass::unbiasable();
/// let fast = FastPath::new(LockConfig::DEFAULT, NativeStack::new());
/// let header = ObjectHeader::new(&CLASS);
/// let record = LockRecord::new();
/// let _ = fast.fast_lock(&header, &record, ThreadIdentity::from_index(0));
/// ```
#[derive(Debug)]
pub struct FastPath<P = NativeStack> {
    config: LockConfig,
    platform: P,
    counters: Option<&'static LockCounters>,
    epoch: Option<&'static BiasEpoch>,
}

impl<P> FastPath<P> {
    /// Creates a fast path that counts nothing.
    pub const fn new(config: LockConfig, platform: P) -> Self {
        Self { config, platform, counters: None, epoch: None }
    }

    /// Attaches a set of counters.
    pub fn with_counters(self, counters: &'static LockCounters) -> Self {
        Self { counters: Some(counters), ..self }
    }

    /// Attaches a biasing state shared with the runtime, which then
    /// supersedes [`LockConfig::bias`].
    pub fn with_bias_epoch(self, epoch: &'static BiasEpoch) -> Self {
        Self { epoch: Some(epoch), ..self }
    }

    /// Returns the biasing state in effect for a call starting now.
    #[inline]
    pub fn bias(&self) -> BiasConfig {
        match self.epoch {
            Some(epoch) => epoch.load(),
            None => self.config.bias,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Returns the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the attached counters, if any.
    pub fn counters(&self) -> Option<&'static LockCounters> {
        self.counters
    }

    #[inline(always)]
    pub(crate) fn count(&self, counter: Counter) {
        stats::count(self.counters, counter);
    }
}

impl<P: Platform> FastPath<P> {
    /// Attempts to lock `header` on behalf of `thread`, using `record` as
    /// the acquisition's lock record.
    ///
    /// On [`Outcome::Success`] the caller holds the lock and must release it
    /// with [`fast_unlock`] or a slow path, passing the same record. On
    /// [`Outcome::Fallback`] the caller does not hold the lock, though the
    /// record may have been written.
    ///
    /// # Safety
    ///
    /// On success, `record` must stay alive, at the same address and unused
    /// by any other acquisition, until the lock is released: contending
    /// threads read the owner's record through the header. `thread` must be
    /// the identity of the calling thread, and no other live thread may use
    /// it.
    ///
    /// [`fast_unlock`]: FastPath::fast_unlock
    pub unsafe fn fast_lock(
        &self,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) -> Outcome {
        self.count(Counter::TotalEntry);
        if self.diagnoses(header) {
            return Outcome::Fallback;
        }
        let bias = self.bias();
        if bias.enabled {
            if let Some(outcome) = bias::enter(header, &bias, thread, self.counters) {
                return outcome;
            }
        }
        let mark = header.load_mark();
        if let LockState::Inflated(_) = mark.classify() {
            return header.monitor().fast_enter(record, thread);
        }
        stack::acquire(header, record, thread, &self.platform, mark, self.counters)
    }

    /// Attempts to release a lock `thread` holds on `header` through
    /// `record`.
    ///
    /// On [`Outcome::Fallback`] the lock is still held and the slow path
    /// must release it.
    ///
    /// # Safety
    ///
    /// `thread` must hold `header` through `record`, acquired by a
    /// successful [`fast_lock`] or by a slow path.
    ///
    /// [`fast_lock`]: FastPath::fast_lock
    pub unsafe fn fast_unlock(
        &self,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) -> Outcome {
        if self.bias().enabled {
            if let Some(outcome) = bias::exit(header) {
                return outcome;
            }
        }
        stack::release(header, record, thread)
    }

    /// Returns `true` if locking `header` must be reported by the slow path.
    #[inline]
    pub(crate) fn diagnoses(&self, header: &ObjectHeader<'_>) -> bool {
        self.config.diagnose_value_based != DiagnoseValueBased::Disabled
            && header.class().is_value_based()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{DiagnoseValueBased, FastPath, LockConfig, Outcome};
    use crate::bias::{BiasConfig, BiasEpoch};
    use crate::markword::{DisplacedHeader, LockState, MarkWord};
    use crate::object::{ObjectClass, ObjectHeader};
    use crate::platform::{NativeStack, Platform};
    use crate::record::LockRecord;
    use crate::stats::{CounterSnapshot, LockCounters};
    use crate::test::FixedStack;
    use crate::thread::ThreadIdentity;

    const T1: ThreadIdentity = ThreadIdentity::from_index(1);
    const T2: ThreadIdentity = ThreadIdentity::from_index(2);

    fn fast_path() -> FastPath {
        FastPath::new(LockConfig::DEFAULT, NativeStack::new())
    }

    fn lock<P: Platform>(
        fast: &FastPath<P>,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) -> Outcome {
        // SAFETY: Records outlive their acquisitions in every test, and each
        // identity stands for a single thread.
        unsafe { fast.fast_lock(header, record, thread) }
    }

    fn unlock<P: Platform>(
        fast: &FastPath<P>,
        header: &ObjectHeader<'_>,
        record: &LockRecord,
        thread: ThreadIdentity,
    ) -> Outcome {
        // SAFETY: Tests only unlock what they locked.
        unsafe { fast.fast_unlock(header, record, thread) }
    }

    #[test]
    fn uncontended_stack_lock() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        static COUNTERS: LockCounters = LockCounters::new();
        let fast = fast_path().with_counters(&COUNTERS);
        let header = ObjectHeader::new(&CLASS);
        let record = LockRecord::new();
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Success);
        assert_eq!(header.mark().classify(), LockState::StackLocked(record.addr()));
        assert_eq!(record.displaced_header(), DisplacedHeader::Unlocked(MarkWord::NEUTRAL));
        let expected = CounterSnapshot { total_entry: 1, fast_path_entry: 1, ..Default::default() };
        assert_eq!(COUNTERS.snapshot(), expected);
    }

    #[test]
    fn round_trip_restores_header() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let fast = fast_path();
        let hashed = MarkWord::new(0x1234 << 9 | 5 << 3 | 1);
        let header = ObjectHeader::with_mark(&CLASS, hashed);
        let record = LockRecord::new();
        assert!(lock(&fast, &header, &record, T1).is_success());
        assert!(unlock(&fast, &header, &record, T1).is_success());
        assert_eq!(header.mark(), hashed);
    }

    #[test]
    fn recursion_within_a_page() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let outer = LockRecord::new();
        let inner = LockRecord::new();
        let fast = FastPath::new(LockConfig::DEFAULT, FixedStack::below(&outer));
        let header = ObjectHeader::new(&CLASS);
        assert!(lock(&fast, &header, &outer, T1).is_success());
        let locked = header.mark();
        assert!(lock(&fast, &header, &inner, T1).is_success());
        assert_eq!(inner.displaced_header(), DisplacedHeader::Recursive);
        assert!(unlock(&fast, &header, &inner, T1).is_success());
        assert_eq!(header.mark(), locked);
        assert!(unlock(&fast, &header, &outer, T1).is_success());
        assert_eq!(header.mark(), MarkWord::NEUTRAL);
    }

    #[test]
    fn contended_inflated_acquire() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let fast = fast_path();
        let header = ObjectHeader::new(&CLASS);
        header.publish_monitor(MarkWord::NEUTRAL, Some(T2));
        let mark = header.mark();
        let record = LockRecord::new();
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Fallback);
        assert_eq!(header.mark(), mark);
        assert_eq!(header.monitor().owner(), Some(T2));
        assert_eq!(header.monitor().recursions(), 0);
    }

    #[test]
    fn free_inflated_acquire_and_release() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let fast = fast_path();
        let header = ObjectHeader::new(&CLASS);
        header.publish_monitor(MarkWord::NEUTRAL, None);
        let record = LockRecord::new();
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Success);
        assert_eq!(record.displaced_header(), DisplacedHeader::MonitorSentinel);
        assert_eq!(header.monitor().owner(), Some(T1));
        assert_eq!(unlock(&fast, &header, &record, T1), Outcome::Success);
        assert_eq!(header.monitor().owner(), None);
    }

    #[test]
    fn release_with_pending_waiter() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let fast = fast_path();
        let header = ObjectHeader::new(&CLASS);
        header.publish_monitor(MarkWord::NEUTRAL, None);
        let record = LockRecord::new();
        assert!(lock(&fast, &header, &record, T1).is_success());
        header.monitor().enqueue();
        assert_eq!(unlock(&fast, &header, &record, T1), Outcome::Fallback);
        assert_eq!(header.monitor().owner(), Some(T1));
    }

    #[test]
    fn biased_lock_cycle() {
        static CLASS: ObjectClass = ObjectClass::new();
        static COUNTERS: LockCounters = LockCounters::new();
        let bias = BiasConfig::enabled(1);
        let config = LockConfig::DEFAULT.with_bias(bias);
        let fast = FastPath::new(config, NativeStack::new()).with_counters(&COUNTERS);
        let header = ObjectHeader::with_prototype(&CLASS, &bias);
        let record = LockRecord::new();
        for _ in 0..3 {
            assert!(lock(&fast, &header, &record, T1).is_success());
            assert!(unlock(&fast, &header, &record, T1).is_success());
        }
        assert_eq!(header.mark(), MarkWord::encode_biased(T1.word(), 1, 0));
        let snapshot = COUNTERS.snapshot();
        assert_eq!(snapshot.total_entry, 3);
        assert_eq!(snapshot.anonymously_biased_lock_entry, 1);
        assert_eq!(snapshot.biased_lock_entry, 2);
        assert_eq!(snapshot.fast_path_entry, 0);
        // Another thread cannot take a live bias.
        assert_eq!(lock(&fast, &header, &record, T2), Outcome::Fallback);
    }

    #[test]
    fn shared_epoch_supersedes_config() {
        static CLASS: ObjectClass = ObjectClass::new();
        static EPOCH: BiasEpoch = BiasEpoch::new(BiasConfig::enabled(2));
        let fast = fast_path().with_bias_epoch(&EPOCH);
        assert_eq!(fast.bias(), BiasConfig::enabled(2));
        let header = ObjectHeader::with_prototype(&CLASS, &fast.bias());
        let record = LockRecord::new();
        assert!(lock(&fast, &header, &record, T1).is_success());
        assert!(unlock(&fast, &header, &record, T1).is_success());
        assert_eq!(header.mark(), MarkWord::encode_biased(T1.word(), 2, 0));
        assert_eq!(lock(&fast, &header, &record, T2), Outcome::Fallback);
        // SAFETY: T1 released its biased lock above.
        unsafe { EPOCH.bulk_rebias() };
        assert!(lock(&fast, &header, &record, T2).is_success());
        assert_eq!(header.mark(), MarkWord::encode_biased(T2.word(), 3, 0));
    }

    #[test]
    fn revoked_bias_proceeds_to_stack_lock() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let config = LockConfig::DEFAULT.with_bias(BiasConfig::enabled(1));
        let fast = FastPath::new(config, NativeStack::new());
        let header = ObjectHeader::with_mark(&CLASS, MarkWord::encode_biased(T2.word(), 1, 3));
        let record = LockRecord::new();
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Success);
        assert_eq!(header.mark().classify(), LockState::StackLocked(record.addr()));
        let DisplacedHeader::Unlocked(neutral) = record.displaced_header() else {
            panic!("expected a displaced neutral header");
        };
        assert_eq!(neutral.age(), 3);
        assert!(unlock(&fast, &header, &record, T1).is_success());
        assert!(header.mark().is_neutral());
    }

    #[test]
    fn value_based_instance_falls_back() {
        static CLASS: ObjectClass = ObjectClass::value_based();
        let config = LockConfig::DEFAULT.with_diagnose_value_based(DiagnoseValueBased::Warn);
        let header = ObjectHeader::new(&CLASS);
        let record = LockRecord::new();
        let fast = FastPath::new(config, NativeStack::new());
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Fallback);
        assert_eq!(header.mark(), MarkWord::NEUTRAL);
        // Without diagnostics value-based instances lock as usual.
        let fast = fast_path();
        assert_eq!(lock(&fast, &header, &record, T1), Outcome::Success);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn fast_lock_exclusion() {
        models::fast_lock_exclusion();
    }

    #[test]
    fn one_zero_release_visibility() {
        models::one_zero_release_visibility();
    }
}
