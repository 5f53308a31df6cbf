//! Stack locking.
//!
//! A stack lock swaps the object's neutral mark word for the address of a
//! lock record owned by the acquiring thread, keeping the neutral word in
//! the record. A thread locking an object it already stack-locked finds
//! its own record in the mark word; since that record lives a little above
//! the current stack pointer, the re-entry is told apart from contention
//! without any bookkeeping, and is recorded with a zero displaced header.

use crate::cas::{cas, CasOrder};
use crate::fast::Outcome;
use crate::markword::{DisplacedHeader, LockState, MarkWord};
use crate::object::ObjectHeader;
use crate::platform::{self, Platform};
use crate::record::LockRecord;
use crate::stats::{count, Counter, LockCounters};
use crate::thread::ThreadIdentity;

/// Attempts to stack-lock `header` through `record`, given the mark word
/// `mark` the caller just read.
///
/// A neutral word is swapped for the record address with a single CAS. A
/// word that already points to a lock record is checked for recursion.
/// Every other state falls back.
pub(crate) fn acquire<P: Platform>(
    header: &ObjectHeader<'_>,
    record: &LockRecord,
    thread: ThreadIdentity,
    platform: &P,
    mark: MarkWord,
    counters: Option<&LockCounters>,
) -> Outcome {
    match mark.classify() {
        LockState::Neutral => {
            let neutral = mark.set_unlocked();
            record.set_displaced_header(DisplacedHeader::Unlocked(neutral));
            record.set_owner(thread);
            // Release publishes the record fields to a thread that will
            // later inflate this lock from the record address.
            let locked = MarkWord::encode_stack_lock(record.addr());
            let res = cas(header.mark_word(), neutral.value(), locked.value(), CasOrder::ACQ_REL);
            if res.success {
                count(counters, Counter::FastPathEntry);
                return Outcome::Success;
            }
            reenter(record, platform, MarkWord::new(res.observed), counters)
        }
        LockState::StackLocked(_) => reenter(record, platform, mark, counters),
        // A biased word is never swapped for a stack lock here, and an
        // inflated one is not ours to handle.
        LockState::Biased { .. } | LockState::Inflated(_) => Outcome::Fallback,
    }
}

/// Accepts `observed` as a recursive stack lock if it points into the
/// caller's stack, within a page of the current stack pointer.
fn reenter<P: Platform>(
    record: &LockRecord,
    platform: &P,
    observed: MarkWord,
    counters: Option<&LockCounters>,
) -> Outcome {
    let LockState::StackLocked(_) = observed.classify() else { return Outcome::Fallback };
    if observed.is_inflating() || !platform::is_near_stack(platform, observed.value()) {
        return Outcome::Fallback;
    }
    record.set_displaced_header(DisplacedHeader::Recursive);
    count(counters, Counter::FastPathEntry);
    Outcome::Success
}

/// Attempts to release a lock `thread` took through `record`.
///
/// Recursive stack locks write nothing. If the lock was inflated in the
/// meantime, the release goes through the monitor instead.
pub(crate) fn release(
    header: &ObjectHeader<'_>,
    record: &LockRecord,
    thread: ThreadIdentity,
) -> Outcome {
    let displaced = record.displaced_header();
    if let DisplacedHeader::Recursive = displaced {
        return Outcome::Success;
    }
    if header.load_mark().has_monitor() {
        return header.monitor().fast_exit(thread);
    }
    let DisplacedHeader::Unlocked(neutral) = displaced else { return Outcome::Fallback };
    let locked = MarkWord::encode_stack_lock(record.addr());
    let res = cas(header.mark_word(), locked.value(), neutral.value(), CasOrder::RELEASE);
    Outcome::from_success(res.success)
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{acquire, release};
    use crate::fast::Outcome;
    use crate::markword::{DisplacedHeader, LockState, MarkWord};
    use crate::object::{ObjectClass, ObjectHeader};
    use crate::platform::{NativeStack, Platform};
    use crate::record::LockRecord;
    use crate::stats::{Counter, LockCounters};
    use crate::test::{FarStack, FixedStack};
    use crate::thread::ThreadIdentity;

    static CLASS: ObjectClass = ObjectClass::unbiasable();
    const T1: ThreadIdentity = ThreadIdentity::from_index(1);
    const T2: ThreadIdentity = ThreadIdentity::from_index(2);

    #[test]
    fn uncontended_lock_and_unlock() {
        let hashed = MarkWord::new(0x2a << 9 | 1);
        let header = ObjectHeader::with_mark(&CLASS, hashed);
        let record = LockRecord::new();
        let out = acquire(&header, &record, T1, &NativeStack::new(), header.mark(), None);
        assert_eq!(out, Outcome::Success);
        assert_eq!(header.mark().classify(), LockState::StackLocked(record.addr()));
        assert_eq!(record.displaced_header(), DisplacedHeader::Unlocked(hashed));
        assert_eq!(record.owner(), Some(T1));
        assert_eq!(release(&header, &record, T1), Outcome::Success);
        assert_eq!(header.mark(), hashed);
    }

    #[test]
    fn recursive_lock_writes_nothing_on_unlock() {
        static COUNTERS: LockCounters = LockCounters::new();
        let header = ObjectHeader::new(&CLASS);
        let outer = LockRecord::new();
        let inner = LockRecord::new();
        let platform = FixedStack::below(&outer);
        let outcome = acquire(&header, &outer, T1, &platform, header.mark(), Some(&COUNTERS));
        assert!(outcome.is_success());
        let locked = header.mark();
        assert!(acquire(&header, &inner, T1, &platform, locked, Some(&COUNTERS)).is_success());
        assert_eq!(inner.displaced_header(), DisplacedHeader::Recursive);
        assert_eq!(header.mark(), locked);
        assert_eq!(COUNTERS.get(Counter::FastPathEntry), 2);
        assert_eq!(release(&header, &inner, T1), Outcome::Success);
        assert_eq!(header.mark(), locked);
        assert_eq!(release(&header, &outer, T1), Outcome::Success);
        assert_eq!(header.mark(), MarkWord::NEUTRAL);
    }

    #[test]
    fn recursion_after_lost_cas() {
        let header = ObjectHeader::new(&CLASS);
        let outer = LockRecord::new();
        let inner = LockRecord::new();
        let platform = FixedStack::below(&outer);
        assert!(acquire(&header, &outer, T1, &platform, header.mark(), None).is_success());
        // A stale neutral read makes the CAS fail on our own stack lock.
        let out = acquire(&header, &inner, T1, &platform, MarkWord::NEUTRAL, None);
        assert_eq!(out, Outcome::Success);
        assert_eq!(inner.displaced_header(), DisplacedHeader::Recursive);
    }

    #[test]
    fn far_record_is_a_false_negative() {
        let header = ObjectHeader::new(&CLASS);
        let outer = LockRecord::new();
        let inner = LockRecord::new();
        let outcome = acquire(&header, &outer, T1, &NativeStack::new(), header.mark(), None);
        assert!(outcome.is_success());
        let locked = header.mark();
        let out = acquire(&header, &inner, T1, &FarStack, locked, None);
        assert_eq!(out, Outcome::Fallback);
        assert_eq!(header.mark(), locked);
    }

    /// A host reporting a zero page, which would make the proximity mask
    /// accept every 8-aligned record address.
    struct ZeroPage;

    // SAFETY: Violates the page size contract on purpose, which the
    // recursion test must detect.
    unsafe impl Platform for ZeroPage {
        fn stack_pointer(&self) -> usize {
            0
        }

        fn page_size(&self) -> usize {
            0
        }
    }

    #[test]
    fn zero_page_never_grants_recursion() {
        let header = ObjectHeader::new(&CLASS);
        let owner = LockRecord::new();
        let contender = LockRecord::new();
        let outcome = acquire(&header, &owner, T1, &NativeStack::new(), header.mark(), None);
        assert!(outcome.is_success());
        let locked = header.mark();
        assert_eq!(locked.value() & 7, 0);
        let out = acquire(&header, &contender, T2, &ZeroPage, locked, None);
        assert_eq!(out, Outcome::Fallback);
        assert_eq!(header.mark(), locked);
        assert_eq!(release(&header, &owner, T1), Outcome::Success);
    }

    #[test]
    fn biased_and_inflated_words_fall_back() {
        let header = ObjectHeader::with_mark(&CLASS, MarkWord::anonymously_biased(0));
        let record = LockRecord::new();
        let out = acquire(&header, &record, T1, &NativeStack::new(), header.mark(), None);
        assert_eq!(out, Outcome::Fallback);
        assert_eq!(header.mark(), MarkWord::anonymously_biased(0));

        let header = ObjectHeader::new(&CLASS);
        header.publish_monitor(MarkWord::NEUTRAL, Some(T2));
        let out = acquire(&header, &record, T1, &NativeStack::new(), header.mark(), None);
        assert_eq!(out, Outcome::Fallback);
    }

    #[test]
    fn inflating_marker_falls_back() {
        let header = ObjectHeader::with_mark(&CLASS, MarkWord::INFLATING);
        let record = LockRecord::new();
        let out = acquire(&header, &record, T1, &FixedStack::at(0), header.mark(), None);
        assert_eq!(out, Outcome::Fallback);
    }

    #[test]
    fn release_of_inflated_stack_lock_uses_monitor() {
        let header = ObjectHeader::new(&CLASS);
        let record = LockRecord::new();
        let outcome = acquire(&header, &record, T1, &NativeStack::new(), header.mark(), None);
        assert!(outcome.is_success());
        // What the slow path does when another thread contends.
        header.publish_monitor(MarkWord::NEUTRAL, record.owner());
        assert_eq!(release(&header, &record, T1), Outcome::Success);
        assert_eq!(header.monitor().owner(), None);
        assert!(header.mark().has_monitor());
    }

    #[test]
    fn release_of_foreign_stack_lock_falls_back() {
        let header = ObjectHeader::new(&CLASS);
        let owner = LockRecord::new();
        let other = LockRecord::new();
        let outcome = acquire(&header, &owner, T1, &NativeStack::new(), header.mark(), None);
        assert!(outcome.is_success());
        other.set_displaced_header(DisplacedHeader::Unlocked(MarkWord::NEUTRAL));
        let locked = header.mark();
        assert_eq!(release(&header, &other, T2), Outcome::Fallback);
        assert_eq!(header.mark(), locked);
    }
}
