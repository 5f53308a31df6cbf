//! Mark word encoding.
//!
//! Every lockable object carries one machine word, the mark word, whose low
//! bits tell which locking tier currently owns the object:
//!
//! ```text
//!  [W-1 ........................ 9 | 8 7 | 6 5 4 3 | 2 | 1 0]
//!  [ hash / unused                 | --- |   age   | 0 | 0 1]  neutral
//!  [ thread identity               |epoch|   age   | 1 | 0 1]  biased
//!  [ pointer to lock record                            | 0 0]  stack-locked
//!  [ pointer to object monitor                         | 1 0]  inflated
//! ```
//!
//! Lock records and object monitors are aligned to 8 bytes, so their
//! addresses leave the three low bits free. The all-zero word is never a
//! valid record address and is used by the slow path as a transient
//! "inflation in progress" marker.

use core::fmt::{self, Debug, Formatter};

/// Number of bits holding the basic lock state.
pub const LOCK_BITS: u32 = 2;
/// Number of bits holding the biased flag.
pub const BIASED_LOCK_BITS: u32 = 1;
/// Number of bits holding the GC age.
pub const AGE_BITS: u32 = 4;
/// Number of bits holding the bias epoch.
pub const EPOCH_BITS: u32 = 2;

/// Shift of the age field.
pub const AGE_SHIFT: u32 = LOCK_BITS + BIASED_LOCK_BITS;
/// Shift of the epoch field.
pub const EPOCH_SHIFT: u32 = AGE_SHIFT + AGE_BITS;
/// Shift of the bias owner identity.
pub const THREAD_SHIFT: u32 = EPOCH_SHIFT + EPOCH_BITS;

/// Mask of the two lock bits.
pub const LOCK_MASK_IN_PLACE: usize = (1 << LOCK_BITS) - 1;
/// Mask of the lock bits plus the biased flag.
pub const BIASED_LOCK_MASK_IN_PLACE: usize = (1 << (LOCK_BITS + BIASED_LOCK_BITS)) - 1;
/// Mask of the age field.
pub const AGE_MASK_IN_PLACE: usize = ((1 << AGE_BITS) - 1) << AGE_SHIFT;
/// Mask of the epoch field.
pub const EPOCH_MASK_IN_PLACE: usize = ((1 << EPOCH_BITS) - 1) << EPOCH_SHIFT;
/// Mask of the bias owner identity.
pub const THREAD_MASK_IN_PLACE: usize = !0 << THREAD_SHIFT;

/// Lock bits of a stack-locked word.
pub const LOCKED_VALUE: usize = 0;
/// Lock bits of a neutral word.
pub const UNLOCKED_VALUE: usize = 1;
/// Lock bits of an inflated word.
pub const MONITOR_VALUE: usize = 2;
/// Lock bits of a word marked by the collector.
pub const MARKED_VALUE: usize = 3;
/// Lock and biased bits of a biased word.
pub const BIASED_LOCK_PATTERN: usize = 5;

/// Largest epoch representable in a mark word.
pub const MAX_EPOCH: usize = (1 << EPOCH_BITS) - 1;

/// A snapshot of an object's mark word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

/// The decoded lock state of a [`MarkWord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Points to a heavyweight object monitor.
    Inflated(usize),
    /// Points to some thread's lock record.
    StackLocked(usize),
    /// Unlocked and not biased.
    Neutral,
    /// Biased toward `thread` (zero when anonymously biased) in `epoch`.
    Biased {
        /// The owner's identity word.
        thread: usize,
        /// The epoch the bias was taken in.
        epoch: usize,
    },
}

impl MarkWord {
    /// Wraps a raw word.
    #[inline(always)]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// The neutral word of a fresh object that has never been hashed.
    pub const NEUTRAL: Self = Self(UNLOCKED_VALUE);

    /// The word stored in a lock record that is not used for stack locking.
    pub const UNUSED: Self = Self(MARKED_VALUE);

    /// The transient word set while the slow path installs a monitor.
    pub const INFLATING: Self = Self(0);

    /// Returns the raw word.
    #[inline(always)]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Encodes a pointer to an object monitor.
    #[inline]
    pub const fn encode_monitor(addr: usize) -> Self {
        debug_assert!(addr & BIASED_LOCK_MASK_IN_PLACE == 0);
        Self(addr | MONITOR_VALUE)
    }

    /// Encodes a pointer to a lock record.
    #[inline]
    pub const fn encode_stack_lock(addr: usize) -> Self {
        debug_assert!(addr & BIASED_LOCK_MASK_IN_PLACE == 0);
        Self(addr | LOCKED_VALUE)
    }

    /// Encodes a word biased toward `thread`.
    ///
    /// `thread` must have its low [`THREAD_SHIFT`] bits clear.
    #[inline]
    pub const fn encode_biased(thread: usize, epoch: usize, age: usize) -> Self {
        debug_assert!(thread & !THREAD_MASK_IN_PLACE == 0);
        let epoch = (epoch & MAX_EPOCH) << EPOCH_SHIFT;
        let age = (age << AGE_SHIFT) & AGE_MASK_IN_PLACE;
        Self(thread | epoch | age | BIASED_LOCK_PATTERN)
    }

    /// Encodes a biasable word that has no owner yet.
    #[inline]
    pub const fn anonymously_biased(epoch: usize) -> Self {
        Self::encode_biased(0, epoch, 0)
    }

    /// Decodes this word into its lock state.
    ///
    /// The monitor bit takes priority over every other bit: a word with it
    /// set is always [`LockState::Inflated`].
    pub const fn classify(self) -> LockState {
        if self.has_monitor() {
            LockState::Inflated(self.0 & !LOCK_MASK_IN_PLACE)
        } else if self.0 & LOCK_MASK_IN_PLACE == LOCKED_VALUE {
            LockState::StackLocked(self.decode_stack_lock_pointer())
        } else if self.has_bias_pattern() {
            LockState::Biased { thread: self.bias_thread(), epoch: self.epoch() }
        } else {
            LockState::Neutral
        }
    }

    /// Returns the lock record address of a stack-locked word.
    #[inline(always)]
    pub const fn decode_stack_lock_pointer(self) -> usize {
        self.0 & !LOCK_MASK_IN_PLACE
    }

    /// Returns `true` if the monitor bit is set.
    #[inline(always)]
    pub const fn has_monitor(self) -> bool {
        self.0 & MONITOR_VALUE != 0
    }

    /// Returns `true` if the low three bits hold the biased pattern.
    #[inline(always)]
    pub const fn has_bias_pattern(self) -> bool {
        self.0 & BIASED_LOCK_MASK_IN_PLACE == BIASED_LOCK_PATTERN
    }

    /// Returns `true` if this is the inflation-in-progress marker.
    #[inline(always)]
    pub const fn is_inflating(self) -> bool {
        self.0 == Self::INFLATING.0
    }

    /// Returns `true` if the word is neutral.
    #[inline(always)]
    pub const fn is_neutral(self) -> bool {
        self.0 & BIASED_LOCK_MASK_IN_PLACE == UNLOCKED_VALUE
    }

    /// The GC age field.
    #[inline(always)]
    pub const fn age(self) -> usize {
        (self.0 & AGE_MASK_IN_PLACE) >> AGE_SHIFT
    }

    /// The bias epoch field.
    #[inline(always)]
    pub const fn epoch(self) -> usize {
        (self.0 & EPOCH_MASK_IN_PLACE) >> EPOCH_SHIFT
    }

    /// The bias owner identity, zero if anonymously biased.
    #[inline(always)]
    pub const fn bias_thread(self) -> usize {
        self.0 & THREAD_MASK_IN_PLACE
    }

    /// Sets the unlocked bit.
    #[inline(always)]
    pub const fn set_unlocked(self) -> Self {
        Self(self.0 | UNLOCKED_VALUE)
    }

    /// Clears the bias owner, keeping pattern, age and epoch.
    #[inline(always)]
    pub const fn clear_bias_owner(self) -> Self {
        Self(self.0 & (BIASED_LOCK_MASK_IN_PLACE | AGE_MASK_IN_PLACE | EPOCH_MASK_IN_PLACE))
    }

    /// Keeps only the age field.
    #[inline(always)]
    pub const fn age_bits(self) -> usize {
        self.0 & AGE_MASK_IN_PLACE
    }
}

impl Debug for MarkWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MarkWord({:#x}: {:?})", self.0, self.classify())
    }
}

impl From<usize> for MarkWord {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// The typed contents of a lock record.
///
/// The record holds a single word whose meaning depends on which tier
/// acquired the lock. Keeping the three cases apart avoids reading a
/// sentinel as a header or the other way around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplacedHeader {
    /// The neutral header displaced by a stack lock.
    Unlocked(MarkWord),
    /// A recursive stack lock by the owner. Encoded as zero.
    Recursive,
    /// The lock was taken through an inflated monitor.
    MonitorSentinel,
}

impl DisplacedHeader {
    /// Encodes this header as the raw record word.
    #[inline]
    pub const fn encode(self) -> usize {
        match self {
            Self::Unlocked(mark) => mark.value(),
            Self::Recursive => 0,
            Self::MonitorSentinel => MarkWord::UNUSED.value(),
        }
    }

    /// Decodes a raw record word.
    #[inline]
    pub const fn decode(word: usize) -> Self {
        match word {
            0 => Self::Recursive,
            w if w == MarkWord::UNUSED.value() => Self::MonitorSentinel,
            w => Self::Unlocked(MarkWord::new(w)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_layout() {
        assert_eq!(AGE_SHIFT, 3);
        assert_eq!(EPOCH_SHIFT, 7);
        assert_eq!(THREAD_SHIFT, 9);
        assert_eq!(BIASED_LOCK_MASK_IN_PLACE, 0b111);
        assert_eq!(AGE_MASK_IN_PLACE, 0b111_1000);
        assert_eq!(EPOCH_MASK_IN_PLACE, 0b1_1000_0000);
        assert_eq!(THREAD_MASK_IN_PLACE & 0x1ff, 0);
    }

    #[test]
    fn classify_neutral() {
        assert_eq!(MarkWord::NEUTRAL.classify(), LockState::Neutral);
        let hashed = MarkWord::new(0xabc << THREAD_SHIFT | 3 << AGE_SHIFT | UNLOCKED_VALUE);
        assert_eq!(hashed.classify(), LockState::Neutral);
        assert_eq!(hashed.age(), 3);
    }

    #[test]
    fn classify_stack_locked() {
        let mark = MarkWord::encode_stack_lock(0x7fff_1000);
        assert_eq!(mark.classify(), LockState::StackLocked(0x7fff_1000));
        assert_eq!(mark.decode_stack_lock_pointer(), 0x7fff_1000);
    }

    #[test]
    fn classify_inflated() {
        let mark = MarkWord::encode_monitor(0x5000_0008);
        assert_eq!(mark.classify(), LockState::Inflated(0x5000_0008));
    }

    #[test]
    fn monitor_bit_has_priority() {
        // Marked words and words with stray biased bits still classify as
        // inflated as soon as the monitor bit is set.
        let marked = MarkWord::new(0x5000_0000 | MARKED_VALUE);
        assert!(matches!(marked.classify(), LockState::Inflated(_)));
        let odd = MarkWord::new(0x5000_0000 | 0b110);
        assert!(matches!(odd.classify(), LockState::Inflated(_)));
    }

    #[test]
    fn classify_biased() {
        let thread = 7 << THREAD_SHIFT;
        let mark = MarkWord::encode_biased(thread, 2, 5);
        assert_eq!(mark.classify(), LockState::Biased { thread, epoch: 2 });
        assert_eq!(mark.age(), 5);

        let anon = MarkWord::anonymously_biased(1);
        assert_eq!(anon.classify(), LockState::Biased { thread: 0, epoch: 1 });
        assert_eq!(mark.clear_bias_owner(), MarkWord::encode_biased(0, 2, 5));
    }

    #[test]
    fn displaced_header_codec() {
        let neutral = MarkWord::new(0x1230_0001);
        assert_eq!(DisplacedHeader::decode(0), DisplacedHeader::Recursive);
        assert_eq!(DisplacedHeader::Recursive.encode(), 0);
        assert_eq!(DisplacedHeader::MonitorSentinel.encode(), MARKED_VALUE);
        assert_eq!(DisplacedHeader::decode(MARKED_VALUE), DisplacedHeader::MonitorSentinel);
        let unlocked = DisplacedHeader::Unlocked(neutral);
        assert_eq!(DisplacedHeader::decode(unlocked.encode()), unlocked);
    }
}
