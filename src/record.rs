use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::AtomicUsize;
use crate::markword::DisplacedHeader;
use crate::thread::ThreadIdentity;

/// A caller-allocated record backing one lock acquisition.
///
/// `LockRecord` plays the part of a "box" on the acquiring thread's stack:
/// a stack lock stores the record's address into the object's mark word and
/// keeps the displaced header here. To lock an object, a record must stay
/// at the same address and be left untouched by anyone else until the
/// matching unlock. After that, the record can be reused for another
/// acquisition.
///
/// Records are expected to live on the stack. The recursion test compares
/// their address against the current stack pointer, so a record allocated
/// elsewhere still works, but recursive acquisitions through it always take
/// the slow path.
///
/// # Examples
///
/// ```
/// use marklock::LockRecord;
///
/// let record = LockRecord::new();
/// ```
#[repr(C, align(8))]
pub struct LockRecord {
    displaced: AtomicUsize,
    owner: AtomicUsize,
}

impl LockRecord {
    /// Creates a new, unused `LockRecord` (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        let displaced = AtomicUsize::new(0);
        let owner = AtomicUsize::new(0);
        Self { displaced, owner }
    }

    /// Creates a new, unused `LockRecord` with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new() -> Self {
        let displaced = AtomicUsize::new(0);
        let owner = AtomicUsize::new(0);
        Self { displaced, owner }
    }

    /// Returns the address this record publishes into a mark word.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Returns the displaced header stored by the last acquisition.
    #[inline]
    pub fn displaced_header(&self) -> DisplacedHeader {
        DisplacedHeader::decode(self.displaced.load(Relaxed))
    }

    /// Overwrites the displaced header.
    #[inline]
    pub(crate) fn set_displaced_header(&self, header: DisplacedHeader) {
        self.displaced.store(header.encode(), Relaxed);
    }

    /// Returns the thread that last stack-locked through this record.
    #[inline]
    pub(crate) fn owner(&self) -> Option<ThreadIdentity> {
        ThreadIdentity::from_word(self.owner.load(Relaxed))
    }

    /// Records the acquiring thread.
    #[inline]
    pub(crate) fn set_owner(&self, thread: ThreadIdentity) {
        self.owner.store(thread.word(), Relaxed);
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for LockRecord {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(tarpaulin_include))]
impl Debug for LockRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRecord")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("displaced", &self.displaced_header())
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::LockRecord;
    use crate::markword::{DisplacedHeader, MarkWord};
    use crate::thread::ThreadIdentity;

    #[test]
    fn record_is_aligned() {
        let record = LockRecord::new();
        assert_eq!(record.addr() & 7, 0);
        assert_eq!(core::mem::align_of::<LockRecord>(), 8);
    }

    #[test]
    fn displaced_header_round_trips() {
        let record = LockRecord::new();
        assert_eq!(record.displaced_header(), DisplacedHeader::Recursive);
        let header = DisplacedHeader::Unlocked(MarkWord::new(0x0f01));
        record.set_displaced_header(header);
        assert_eq!(record.displaced_header(), header);
        record.set_displaced_header(DisplacedHeader::MonitorSentinel);
        assert_eq!(record.displaced_header(), DisplacedHeader::MonitorSentinel);
    }

    #[test]
    fn owner() {
        let record = LockRecord::new();
        assert_eq!(record.owner(), None);
        let thread = ThreadIdentity::from_index(2);
        record.set_owner(thread);
        assert_eq!(record.owner(), Some(thread));
    }
}
