//! Biased ownership.
//!
//! A biasable object is handed to the first thread that locks it: the
//! thread writes its identity into the mark word once, and from then on
//! locks and unlocks the object without any atomic operation. The bias
//! holds only while the epoch embedded in the mark word equals the current
//! epoch and the object's class is still biasable. Anything else is
//! resolved with at most one CAS, or handed to the slow path.

use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{AcqRel, Acquire};

use crate::cas::{cas, CasOrder};
use crate::fast::Outcome;
use crate::markword::{MarkWord, AGE_MASK_IN_PLACE, BIASED_LOCK_MASK_IN_PLACE};
use crate::markword::{EPOCH_MASK_IN_PLACE, MAX_EPOCH};
use crate::object::ObjectHeader;
use crate::stats::{count, Counter, LockCounters};
use crate::thread::ThreadIdentity;

/// Global biasing state, injected into every lock call.
///
/// The lock code reads this configuration and never changes it. A runtime
/// that bumps the epoch, invalidating every existing bias at once, must do
/// so while no thread runs lock code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BiasConfig {
    /// Whether biased ownership is attempted at all.
    pub enabled: bool,
    /// The current epoch. Only the low bits fitting a mark word are kept.
    pub current_epoch: usize,
}

impl BiasConfig {
    /// Biasing turned off.
    pub const DISABLED: Self = Self { enabled: false, current_epoch: 0 };

    /// Biasing turned on at `current_epoch`.
    pub const fn enabled(current_epoch: usize) -> Self {
        Self { enabled: true, current_epoch: current_epoch & MAX_EPOCH }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for BiasConfig {
    #[inline(always)]
    fn default() -> Self {
        Self::DISABLED
    }
}

/// A biasing state owned by the runtime and shared with every lock call.
///
/// Attached to a [`FastPath`] with [`FastPath::with_bias_epoch`], it takes
/// the place of [`LockConfig::bias`] and is read at the start of every lock
/// operation. Moving to a new epoch with [`bulk_rebias`] invalidates every
/// existing bias at once, which lets other threads acquire objects that
/// were biased toward a thread that has released them, or has exited.
///
/// Epochs wrap around after [`MAX_EPOCH`].
///
/// [`FastPath`]: crate::FastPath
/// [`FastPath::with_bias_epoch`]: crate::FastPath::with_bias_epoch
/// [`LockConfig::bias`]: crate::LockConfig::bias
/// [`bulk_rebias`]: BiasEpoch::bulk_rebias
#[derive(Debug)]
pub struct BiasEpoch {
    enabled: bool,
    epoch: AtomicUsize,
}

impl BiasEpoch {
    /// Creates a shared state starting from `config`.
    pub const fn new(config: BiasConfig) -> Self {
        Self { enabled: config.enabled, epoch: AtomicUsize::new(config.current_epoch) }
    }

    /// Returns the biasing state in effect.
    #[inline]
    pub fn load(&self) -> BiasConfig {
        let current_epoch = self.epoch.load(Acquire) & MAX_EPOCH;
        BiasConfig { enabled: self.enabled, current_epoch }
    }

    /// Moves to the next epoch and returns it.
    ///
    /// Every bias taken in an earlier epoch becomes stale: the next thread to
    /// lock such an object takes the bias over, or revokes it in the slow
    /// path.
    ///
    /// # Safety
    ///
    /// No thread may hold a lock through a bias while this runs. A thread
    /// locked through a bias writes nothing to the header, so the next
    /// thread to rebias the object would enter alongside it.
    pub unsafe fn bulk_rebias(&self) -> usize {
        let previous = self.epoch.fetch_add(1, AcqRel);
        previous.wrapping_add(1) & MAX_EPOCH
    }
}

/// Where a mark word stands with respect to a locking thread's bias.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiasState {
    /// The word does not carry the biased pattern.
    NotBiased,
    /// Biased toward the caller in the current epoch.
    BiasedToSelf,
    /// Biased in the current epoch, anonymously or toward another thread.
    BiasedToOther,
    /// Biased in an expired epoch; the recorded owner is meaningless.
    EpochStale,
    /// The class no longer allows biasing.
    Revoked,
}

/// Classifies `mark` against the class `prototype` for `thread`.
///
/// Age bits are ignored, and the checks go from the strongest reason to
/// give up the bias down to the weakest.
pub fn bias_state(mark: MarkWord, prototype: MarkWord, thread: ThreadIdentity) -> BiasState {
    if !mark.has_bias_pattern() {
        return BiasState::NotBiased;
    }
    let diff = ((prototype.value() | thread.word()) ^ mark.value()) & !AGE_MASK_IN_PLACE;
    if diff == 0 {
        BiasState::BiasedToSelf
    } else if diff & BIASED_LOCK_MASK_IN_PLACE != 0 {
        BiasState::Revoked
    } else if diff & EPOCH_MASK_IN_PLACE != 0 {
        BiasState::EpochStale
    } else {
        BiasState::BiasedToOther
    }
}

/// Attempts to lock `header` through its bias.
///
/// Returns `None` when the caller should go on with stack locking.
pub(crate) fn enter(
    header: &ObjectHeader<'_>,
    config: &BiasConfig,
    thread: ThreadIdentity,
    counters: Option<&LockCounters>,
) -> Option<Outcome> {
    let mark = header.load_mark();
    let prototype = header.class().prototype_header(config);
    match bias_state(mark, prototype, thread) {
        BiasState::NotBiased => None,
        BiasState::BiasedToSelf => {
            count(counters, Counter::BiasedLockEntry);
            Some(Outcome::Success)
        }
        BiasState::BiasedToOther => {
            // Only an unowned bias may be taken in the current epoch. The
            // expected value drops the owner, so the CAS fails if anyone,
            // including the thread we just saw, owns the bias.
            let anonymous = mark.clear_bias_owner();
            let desired = anonymous.value() | thread.word();
            let res = cas(header.mark_word(), anonymous.value(), desired, CasOrder::ACQUIRE);
            if res.success {
                count(counters, Counter::AnonymouslyBiasedLockEntry);
            }
            Some(Outcome::from_success(res.success))
        }
        BiasState::EpochStale => {
            // An expired epoch proves nobody holds a valid bias, so the
            // bias may move straight from the recorded owner to us, as
            // long as the word is still the one we read.
            let desired = prototype.value() | thread.word() | mark.age_bits();
            let res = cas(header.mark_word(), mark.value(), desired, CasOrder::ACQUIRE);
            if res.success {
                count(counters, Counter::RebiasedLockEntry);
            }
            Some(Outcome::from_success(res.success))
        }
        BiasState::Revoked => {
            // Reset to the unbiased prototype. Losing this race is fine:
            // whoever won removed the bias as well.
            let desired = prototype.value() | mark.age_bits();
            let res = cas(header.mark_word(), mark.value(), desired, CasOrder::ACQUIRE);
            if res.success {
                count(counters, Counter::RevokedLockEntry);
            }
            None
        }
    }
}

/// Attempts to unlock `header` through its bias.
///
/// Unlocking a bias writes nothing: while the word still shows the biased
/// pattern nobody else can have locked the object. Returns `None` when the
/// caller should go on with stack unlocking.
#[inline]
pub(crate) fn exit(header: &ObjectHeader<'_>) -> Option<Outcome> {
    if !header.load_mark().has_bias_pattern() {
        return None;
    }
    Some(Outcome::Success)
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{bias_state, enter, exit, BiasConfig, BiasEpoch, BiasState};
    use crate::fast::Outcome;
    use crate::markword::{MarkWord, MAX_EPOCH, UNLOCKED_VALUE};
    use crate::object::{ObjectClass, ObjectHeader};
    use crate::stats::{Counter, LockCounters};
    use crate::thread::ThreadIdentity;

    const A: ThreadIdentity = ThreadIdentity::from_index(10);
    const B: ThreadIdentity = ThreadIdentity::from_index(11);
    const EPOCH: usize = 1;
    const CONFIG: BiasConfig = BiasConfig::enabled(EPOCH);

    fn biased(thread: ThreadIdentity, epoch: usize, age: usize) -> MarkWord {
        MarkWord::encode_biased(thread.word(), epoch, age)
    }

    #[test]
    fn states() {
        let proto = MarkWord::anonymously_biased(EPOCH);
        assert_eq!(bias_state(MarkWord::NEUTRAL, proto, A), BiasState::NotBiased);
        assert_eq!(bias_state(biased(A, EPOCH, 3), proto, A), BiasState::BiasedToSelf);
        assert_eq!(bias_state(biased(B, EPOCH, 0), proto, A), BiasState::BiasedToOther);
        assert_eq!(bias_state(proto, proto, A), BiasState::BiasedToOther);
        assert_eq!(bias_state(biased(B, 2, 0), proto, A), BiasState::EpochStale);
        assert_eq!(bias_state(biased(A, 2, 0), proto, A), BiasState::EpochStale);
        assert_eq!(bias_state(biased(A, EPOCH, 0), MarkWord::NEUTRAL, A), BiasState::Revoked);
    }

    #[test]
    fn self_reentry_writes_nothing() {
        static CLASS: ObjectClass = ObjectClass::new();
        static COUNTERS: LockCounters = LockCounters::new();
        let mark = biased(A, EPOCH, 2);
        let header = ObjectHeader::with_mark(&CLASS, mark);
        assert_eq!(enter(&header, &CONFIG, A, Some(&COUNTERS)), Some(Outcome::Success));
        assert_eq!(header.mark(), mark);
        assert_eq!(COUNTERS.get(Counter::BiasedLockEntry), 1);
    }

    #[test]
    fn anonymous_bias_is_taken() {
        static CLASS: ObjectClass = ObjectClass::new();
        let header = ObjectHeader::with_prototype(&CLASS, &CONFIG);
        assert_eq!(enter(&header, &CONFIG, A, None), Some(Outcome::Success));
        assert_eq!(header.mark(), biased(A, EPOCH, 0));
        // Unlock is a no-op.
        assert_eq!(exit(&header), Some(Outcome::Success));
        assert_eq!(header.mark(), biased(A, EPOCH, 0));
    }

    #[test]
    fn live_bias_of_other_thread_is_not_stolen() {
        static CLASS: ObjectClass = ObjectClass::new();
        let mark = biased(A, EPOCH, 0);
        let header = ObjectHeader::with_mark(&CLASS, mark);
        assert_eq!(enter(&header, &CONFIG, B, None), Some(Outcome::Fallback));
        assert_eq!(header.mark(), mark);
    }

    #[test]
    fn stale_bias_is_transferred() {
        static CLASS: ObjectClass = ObjectClass::new();
        static COUNTERS: LockCounters = LockCounters::new();
        let header = ObjectHeader::with_mark(&CLASS, biased(A, 0, 5));
        assert_eq!(enter(&header, &CONFIG, B, Some(&COUNTERS)), Some(Outcome::Success));
        assert_eq!(header.mark(), biased(B, EPOCH, 5));
        assert_eq!(COUNTERS.get(Counter::RebiasedLockEntry), 1);
    }

    #[test]
    fn revoked_class_resets_header() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        static COUNTERS: LockCounters = LockCounters::new();
        let header = ObjectHeader::with_mark(&CLASS, biased(A, EPOCH, 4));
        assert_eq!(enter(&header, &CONFIG, B, Some(&COUNTERS)), None);
        let mark = header.mark();
        assert!(mark.is_neutral());
        assert_eq!(mark.age(), 4);
        assert_eq!(mark.value() & 7, UNLOCKED_VALUE);
        assert_eq!(COUNTERS.get(Counter::RevokedLockEntry), 1);
    }

    #[test]
    fn exit_of_unbiased_header_proceeds() {
        static CLASS: ObjectClass = ObjectClass::new();
        let header = ObjectHeader::new(&CLASS);
        assert_eq!(exit(&header), None);
    }

    #[test]
    fn bulk_rebias_makes_biases_stale() {
        static CLASS: ObjectClass = ObjectClass::new();
        let epoch = BiasEpoch::new(BiasConfig::enabled(EPOCH));
        let header = ObjectHeader::with_prototype(&CLASS, &epoch.load());
        assert_eq!(enter(&header, &epoch.load(), A, None), Some(Outcome::Success));
        assert_eq!(enter(&header, &epoch.load(), B, None), Some(Outcome::Fallback));
        // SAFETY: `A` left its biased lock above.
        assert_eq!(unsafe { epoch.bulk_rebias() }, EPOCH + 1);
        assert_eq!(enter(&header, &epoch.load(), B, None), Some(Outcome::Success));
        assert_eq!(header.mark(), biased(B, EPOCH + 1, 0));
    }

    #[test]
    fn bias_epoch_wraps() {
        let epoch = BiasEpoch::new(BiasConfig::enabled(MAX_EPOCH));
        assert_eq!(epoch.load(), BiasConfig::enabled(MAX_EPOCH));
        // SAFETY: Nothing is locked.
        assert_eq!(unsafe { epoch.bulk_rebias() }, 0);
        assert_eq!(epoch.load(), BiasConfig::enabled(0));
        assert!(!BiasEpoch::new(BiasConfig::DISABLED).load().enabled);
    }
}
