use core::num::NonZeroUsize;

use crate::markword::{THREAD_MASK_IN_PLACE, THREAD_SHIFT};

/// The identity of a locking thread.
///
/// An identity is a non-zero word with its low [`THREAD_SHIFT`] bits clear,
/// so it can be merged into a biased mark word as is, and stored into an
/// object monitor's `owner` field. Zero is reserved for "no owner".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ThreadIdentity(NonZeroUsize);

impl ThreadIdentity {
    /// Creates the identity for the thread numbered `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit in the identity bits of a mark word.
    pub const fn from_index(index: usize) -> Self {
        let max = THREAD_MASK_IN_PLACE >> THREAD_SHIFT;
        assert!(index < max, "thread index does not fit in a mark word");
        match NonZeroUsize::new((index + 1) << THREAD_SHIFT) {
            Some(word) => Self(word),
            None => unreachable!(),
        }
    }

    /// Reinterprets a raw word as an identity, if it is a valid one.
    pub const fn from_word(word: usize) -> Option<Self> {
        if word & !THREAD_MASK_IN_PLACE != 0 {
            return None;
        }
        match NonZeroUsize::new(word) {
            Some(word) => Some(Self(word)),
            None => None,
        }
    }

    /// Returns the raw identity word.
    #[inline(always)]
    pub const fn word(self) -> usize {
        self.0.get()
    }

    /// Returns the identity of the calling thread.
    ///
    /// Identities are handed out lazily, in the order threads first ask for
    /// one, and stay fixed for the thread's lifetime.
    #[cfg(feature = "thread_local")]
    #[cfg_attr(docsrs, doc(cfg(feature = "thread_local")))]
    pub fn current() -> Self {
        use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};
        use std::cell::Cell;

        static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

        std::thread_local! {
            static CURRENT: Cell<Option<ThreadIdentity>> = const { Cell::new(None) };
        }

        CURRENT.with(|current| match current.get() {
            Some(identity) => identity,
            None => {
                let identity = Self::from_index(NEXT_INDEX.fetch_add(1, Relaxed));
                current.set(Some(identity));
                identity
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::ThreadIdentity;
    use crate::markword::THREAD_SHIFT;

    #[test]
    fn from_index_is_aligned_and_non_zero() {
        let first = ThreadIdentity::from_index(0);
        assert_eq!(first.word(), 1 << THREAD_SHIFT);
        let other = ThreadIdentity::from_index(41);
        assert_eq!(other.word() & ((1 << THREAD_SHIFT) - 1), 0);
        assert_ne!(first, other);
    }

    #[test]
    fn from_word_rejects_invalid() {
        assert_eq!(ThreadIdentity::from_word(0), None);
        assert_eq!(ThreadIdentity::from_word(0x1001), None);
        let id = ThreadIdentity::from_index(3);
        assert_eq!(ThreadIdentity::from_word(id.word()), Some(id));
    }

    #[test]
    #[should_panic]
    fn from_index_overflow() {
        let _ = ThreadIdentity::from_index(usize::MAX);
    }

    #[cfg(feature = "thread_local")]
    #[test]
    fn current_is_stable_and_distinct() {
        let here = ThreadIdentity::current();
        assert_eq!(here, ThreadIdentity::current());
        let there = std::thread::spawn(ThreadIdentity::current).join().unwrap();
        assert_ne!(here, there);
    }
}
