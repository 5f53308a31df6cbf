//! Primitives the lock algorithm needs from its host.

/// The page granularity assumed when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// The smallest page size the recursion test accepts.
pub const MIN_PAGE_SIZE: usize = 16;

/// Host primitives used by the stack-lock recursion test.
///
/// Two lock records belong to the same thread when the one stored in the
/// mark word lies at most a page above the current stack pointer. The test
/// is approximate on purpose: it may report a genuine recursive lock as
/// foreign, in which case the slow path takes over.
///
/// # Safety
///
/// The recursion test grants the lock without any atomic operation, so
/// implementors must make sure it never matches a record owned by another
/// thread. For any lock record a thread other than the caller owns,
/// `record_addr - stack_pointer()` must not fall within
/// `0..page_size()`. Native thread stacks separated by guard pages of at
/// least `page_size()` bytes satisfy this, with `stack_pointer()` at or
/// below the caller's current frame. A `page_size()` that is not a power
/// of two of at least [`MIN_PAGE_SIZE`] disables the test.
///
/// A platform is therefore only implemented with `unsafe impl`:
///
/// ```compile_fail,E0200
/// use marklock::Platform;
///
/// struct ZeroPage;
///
/// impl Platform for ZeroPage {
///     fn stack_pointer(&self) -> usize {
///         0
///     }
///
///     fn page_size(&self) -> usize {
///         0
///     }
/// }
/// ```
pub unsafe trait Platform {
    /// Returns the current stack pointer of the calling thread, or an
    /// address known to be at most a few words above it.
    fn stack_pointer(&self) -> usize;

    /// Returns the page size, a power of two of at least [`MIN_PAGE_SIZE`].
    fn page_size(&self) -> usize;
}

/// Returns `true` if the stack-locked `mark` belongs to a lock record
/// within a page above the current stack pointer of `platform`.
///
/// Equivalent to `(mark - sp) & (7 - page_size) == 0` in wrapping
/// arithmetic, which also requires the distance to be 8-byte aligned. An
/// invalid page size never matches.
#[inline]
pub(crate) fn is_near_stack<P: Platform + ?Sized>(platform: &P, mark: usize) -> bool {
    let page_size = platform.page_size();
    if !is_valid_page_size(page_size) {
        return false;
    }
    proximity_delta(mark, platform.stack_pointer(), page_size) == 0
}

#[inline(always)]
const fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE
}

/// Computes the masked distance between `mark` and `sp`.
///
/// Zero means `sp <= mark < sp + page_size` with an 8-aligned difference.
#[inline(always)]
pub const fn proximity_delta(mark: usize, sp: usize, page_size: usize) -> usize {
    mark.wrapping_sub(sp) & 7usize.wrapping_sub(page_size)
}

// SAFETY: Forwards to `P`, which upholds the contract.
unsafe impl<P: Platform + ?Sized> Platform for &P {
    #[inline(always)]
    fn stack_pointer(&self) -> usize {
        (**self).stack_pointer()
    }

    #[inline(always)]
    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

/// Uses the address of a local as the stack pointer.
///
/// The local lives in the frame of the lock call, below any lock record the
/// caller owns, so a record the caller or its recent ancestors allocated is
/// found within the configured page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeStack {
    page_size: usize,
}

impl NativeStack {
    /// Creates a `NativeStack` with the [`DEFAULT_PAGE_SIZE`].
    pub const fn new() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE }
    }

    /// Creates a `NativeStack` with a custom page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two of at least
    /// [`MIN_PAGE_SIZE`].
    pub const fn with_page_size(page_size: usize) -> Self {
        assert!(is_valid_page_size(page_size), "invalid page size");
        Self { page_size }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for NativeStack {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

/// A stack slot with the alignment of a lock record.
#[repr(align(8))]
struct StackMarker;

// SAFETY: The marker lives in the frame of the lock call, below every record
// the calling thread owns, and thread stacks are separated by guard pages.
// A record of another thread is therefore never within a page above it.
unsafe impl Platform for NativeStack {
    #[inline(always)]
    fn stack_pointer(&self) -> usize {
        let marker = StackMarker;
        core::hint::black_box(&marker) as *const StackMarker as usize
    }

    #[inline(always)]
    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod test {
    use super::{is_near_stack, proximity_delta, NativeStack, Platform};

    #[test]
    fn proximity_within_page() {
        let sp = 0x7fff_0000;
        assert_eq!(proximity_delta(sp, sp, 4096), 0);
        assert_eq!(proximity_delta(sp + 8, sp, 4096), 0);
        assert_eq!(proximity_delta(sp + 4088, sp, 4096), 0);
    }

    #[test]
    fn proximity_outside_page() {
        let sp = 0x7fff_0000;
        assert_ne!(proximity_delta(sp + 4096, sp, 4096), 0);
        assert_ne!(proximity_delta(sp - 8, sp, 4096), 0);
        // Misaligned distances never match.
        assert_ne!(proximity_delta(sp + 4, sp, 4096), 0);
    }

    #[test]
    fn native_stack_sees_callers_record() {
        #[repr(align(8))]
        struct Slot(u64);
        let slot = Slot(0);
        let addr = core::hint::black_box(&slot) as *const Slot as usize;
        let stack = NativeStack::new();
        assert!(is_near_stack(&stack, addr));
    }

    struct Host {
        sp: usize,
        page_size: usize,
    }

    // SAFETY: Only used to check the page size validation, no lock is taken.
    unsafe impl Platform for Host {
        fn stack_pointer(&self) -> usize {
            self.sp
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    #[test]
    fn invalid_page_size_never_matches() {
        // With a zero page every 8-aligned word would pass the mask.
        assert_eq!(proximity_delta(0x1000, 0, 0), 0);
        for page_size in [0, 1, 8, 12, 1000, 4097] {
            let host = Host { sp: 0, page_size };
            assert!(!is_near_stack(&host, 0x1000));
            assert!(!is_near_stack(&host, 0));
        }
        let host = Host { sp: 0x1000, page_size: 16 };
        assert!(is_near_stack(&host, 0x1008));
        assert!(!is_near_stack(&host, 0x1010));
    }

    #[test]
    #[should_panic]
    fn invalid_page_size() {
        let _ = NativeStack::with_page_size(1000);
    }
}
