use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::bias::BiasConfig;
use crate::cfg::atomic::AtomicUsize;
use crate::markword::{LockState, MarkWord};
use crate::monitor::ObjectMonitor;
use crate::thread::ThreadIdentity;

/// The per-class properties consulted by the lock protocols.
///
/// Whether instances may be biased is a class property that the runtime
/// only ever changes at a safepoint (bulk revocation). It is read, never
/// written, by the lock operations.
#[derive(Debug)]
pub struct ObjectClass {
    biasable: AtomicBool,
    value_based: bool,
}

impl ObjectClass {
    /// Creates a class whose instances may be biased.
    pub const fn new() -> Self {
        Self { biasable: AtomicBool::new(true), value_based: false }
    }

    /// Creates a class whose instances are never biased.
    pub const fn unbiasable() -> Self {
        Self { biasable: AtomicBool::new(false), value_based: false }
    }

    /// Creates a value-based class, whose instances should not be used for
    /// synchronization.
    pub const fn value_based() -> Self {
        Self { biasable: AtomicBool::new(false), value_based: true }
    }

    /// Returns `true` if instances may currently be biased.
    pub fn is_biasable(&self) -> bool {
        self.biasable.load(Relaxed)
    }

    /// Returns `true` if this is a value-based class.
    pub fn is_value_based(&self) -> bool {
        self.value_based
    }

    /// Disables biasing for every instance of this class.
    ///
    /// Existing biases become revocable by any thread that locks them.
    /// Should only be called while no thread holds a biased lock on an
    /// instance of this class, as a runtime would do at a safepoint.
    pub fn revoke_biasing(&self) {
        self.biasable.store(false, Relaxed);
    }

    /// Returns the header a fresh instance of this class would carry.
    pub fn prototype_header(&self, bias: &BiasConfig) -> MarkWord {
        if bias.enabled && self.is_biasable() {
            MarkWord::anonymously_biased(bias.current_epoch)
        } else {
            MarkWord::NEUTRAL
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for ObjectClass {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

/// The lockable header of an object.
///
/// A header holds the mark word, the object's class and the monitor used
/// once the lock inflates. The monitor is embedded, so inflating never
/// allocates; the address in an inflated mark word only tags the word and
/// the header always resolves it to its own monitor. Inflation is one-way.
///
/// # Examples
///
/// ```
/// use marklock::{ObjectClass, ObjectHeader};
///
/// static CLASS: ObjectClass = ObjectClass::unbiasable();
/// let header = ObjectHeader::new(&CLASS);
/// assert!(!header.is_locked());
/// ```
#[repr(C)]
pub struct ObjectHeader<'k> {
    mark: AtomicUsize,
    class: &'k ObjectClass,
    monitor: ObjectMonitor,
}

impl<'k> ObjectHeader<'k> {
    /// Creates a neutral header (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new(class: &'k ObjectClass) -> Self {
        Self::with_mark(class, MarkWord::NEUTRAL)
    }

    /// Creates a header holding `mark` (const).
    ///
    /// `mark` must not be stack-locked nor inflated.
    #[cfg(not(all(loom, test)))]
    pub const fn with_mark(class: &'k ObjectClass, mark: MarkWord) -> Self {
        let mark = AtomicUsize::new(mark.value());
        Self { mark, class, monitor: ObjectMonitor::new() }
    }

    /// Creates a neutral header with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new(class: &'k ObjectClass) -> Self {
        Self::with_mark(class, MarkWord::NEUTRAL)
    }

    /// Creates a header holding `mark` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn with_mark(class: &'k ObjectClass, mark: MarkWord) -> Self {
        let mark = AtomicUsize::new(mark.value());
        Self { mark, class, monitor: ObjectMonitor::new() }
    }

    /// Creates a header carrying the class prototype for `bias`.
    pub fn with_prototype(class: &'k ObjectClass, bias: &BiasConfig) -> Self {
        Self::with_mark(class, class.prototype_header(bias))
    }

    /// Returns the object's class.
    #[inline(always)]
    pub fn class(&self) -> &'k ObjectClass {
        self.class
    }

    /// Returns the object's monitor.
    #[inline(always)]
    pub fn monitor(&self) -> &ObjectMonitor {
        &self.monitor
    }

    /// Reads the mark word.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn mark(&self) -> MarkWord {
        MarkWord::new(self.mark.load(Relaxed))
    }

    /// Returns `true` if some thread currently holds the stack lock or the
    /// inflated monitor. A bias alone does not count as held.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn is_locked(&self) -> bool {
        match self.mark().classify() {
            LockState::Neutral | LockState::Biased { .. } => false,
            LockState::StackLocked(_) => true,
            LockState::Inflated(_) => self.monitor.owner().is_some(),
        }
    }

    /// Reads the mark word with acquire ordering, pairing with the release
    /// store that publishes an inflated monitor.
    #[inline(always)]
    pub(crate) fn load_mark(&self) -> MarkWord {
        MarkWord::new(self.mark.load(Acquire))
    }

    /// Returns the mark word itself, for CAS.
    #[inline(always)]
    pub(crate) fn mark_word(&self) -> &AtomicUsize {
        &self.mark
    }

    /// Installs this header's monitor and publishes the inflated mark word.
    ///
    /// The mark word must hold a value no other thread will CAS from,
    /// either the inflating marker or a neutral header the caller just
    /// claimed.
    pub(crate) fn publish_monitor(&self, displaced: MarkWord, owner: Option<ThreadIdentity>) {
        self.monitor.install(displaced, owner);
        let inflated = MarkWord::encode_monitor(self.monitor.addr());
        self.mark.store(inflated.value(), Release);
    }
}

impl Debug for ObjectHeader<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ObjectHeader");
        d.field("mark", &self.mark());
        if self.mark().has_monitor() {
            d.field("monitor", &self.monitor);
        }
        d.finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{ObjectClass, ObjectHeader};
    use crate::bias::BiasConfig;
    use crate::markword::{LockState, MarkWord};
    use crate::thread::ThreadIdentity;

    #[test]
    fn prototype_follows_class_and_config() {
        let class = ObjectClass::new();
        let enabled = BiasConfig::enabled(1);
        assert_eq!(class.prototype_header(&enabled), MarkWord::anonymously_biased(1));
        assert_eq!(class.prototype_header(&BiasConfig::DISABLED), MarkWord::NEUTRAL);
        class.revoke_biasing();
        assert_eq!(class.prototype_header(&enabled), MarkWord::NEUTRAL);
    }

    #[test]
    fn publish_monitor_inflates() {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        let header = ObjectHeader::new(&CLASS);
        let owner = ThreadIdentity::from_index(0);
        header.publish_monitor(MarkWord::NEUTRAL, Some(owner));
        assert_eq!(header.mark().classify(), LockState::Inflated(header.monitor().addr()));
        assert_eq!(header.monitor().owner(), Some(owner));
        assert_eq!(header.monitor().header(), MarkWord::NEUTRAL);
        assert!(header.is_locked());
    }

    #[test]
    fn biased_header_is_not_locked() {
        static CLASS: ObjectClass = ObjectClass::new();
        let header = ObjectHeader::with_prototype(&CLASS, &BiasConfig::enabled(0));
        assert!(header.mark().has_bias_pattern());
        assert!(!header.is_locked());
    }
}
