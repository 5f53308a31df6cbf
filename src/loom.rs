pub mod models {
    use core::array;

    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::fast::{FastPath, LockConfig};
    use crate::markword::{DisplacedHeader, MarkWord};
    use crate::object::{ObjectClass, ObjectHeader};
    use crate::record::LockRecord;
    use crate::relax::Yield;
    use crate::sync::Synchronized;
    use crate::synchronizer::Synchronizer;
    use crate::test::FarStack;
    use crate::thread::ThreadIdentity;

    // Three or more threads make these models run for too long.
    const LOCKS: usize = 2;

    static CLASS: ObjectClass = ObjectClass::unbiasable();

    fn fast_path() -> FastPath<FarStack> {
        FastPath::new(LockConfig::DEFAULT, FarStack)
    }

    /// Evaluates that concurrent `fast_lock` calls on a neutral object let
    /// at most one thread in at a time, therefore no data races.
    pub fn fast_lock_exclusion() {
        model(|| {
            let header = Arc::new(ObjectHeader::new(&CLASS));
            let data = Arc::new(UnsafeCell::new(0usize));
            let handles: [_; LOCKS] = array::from_fn(|index| {
                let (header, data) = (Arc::clone(&header), Arc::clone(&data));
                thread::spawn(move || {
                    let fast = fast_path();
                    let record = LockRecord::new();
                    let me = ThreadIdentity::from_index(index);
                    // SAFETY: `record` outlives the acquisition and every
                    // model thread has its own identity.
                    if unsafe { fast.fast_lock(&header, &record, me) }.is_fallback() {
                        return 0;
                    }
                    // SAFETY: The object lock is held.
                    data.with_mut(|n| unsafe { *n += 1 });
                    // SAFETY: `me` holds the lock through `record`.
                    assert!(unsafe { fast.fast_unlock(&header, &record, me) }.is_success());
                    1
                })
            });
            let acquired: usize = handles.map(|handle| handle.join().unwrap()).into_iter().sum();
            // SAFETY: Every thread has been joined.
            let value = data.with(|n| unsafe { *n });
            assert_eq!(acquired, value);
            assert!((1..=LOCKS).contains(&value));
            assert_eq!(header.mark(), MarkWord::NEUTRAL);
        });
    }

    /// Evaluates that writes made before a "1-0" monitor exit are visible to
    /// the next owner of the monitor.
    pub fn one_zero_release_visibility() {
        model(|| {
            let header = Arc::new(ObjectHeader::new(&CLASS));
            let data = Arc::new(UnsafeCell::new(0usize));
            let owner = ThreadIdentity::from_index(0);
            header.publish_monitor(MarkWord::NEUTRAL, Some(owner));

            let releaser = {
                let (header, data) = (Arc::clone(&header), Arc::clone(&data));
                thread::spawn(move || {
                    let record = LockRecord::new();
                    record.set_displaced_header(DisplacedHeader::MonitorSentinel);
                    // SAFETY: `owner` holds the monitor.
                    data.with_mut(|n| unsafe { *n = 1 });
                    // SAFETY: `owner` holds the monitor, the record stands
                    // for its acquisition.
                    let outcome = unsafe { fast_path().fast_unlock(&header, &record, owner) };
                    assert!(outcome.is_success());
                })
            };
            let acquirer = thread::spawn(move || {
                let fast = fast_path();
                let record = LockRecord::new();
                let me = ThreadIdentity::from_index(1);
                // SAFETY: `record` outlives the acquisition and `me` is only
                // used by this thread.
                while unsafe { fast.fast_lock(&header, &record, me) }.is_fallback() {
                    thread::yield_now();
                }
                // SAFETY: The monitor is held.
                assert_eq!(data.with(|n| unsafe { *n }), 1);
                // SAFETY: `me` holds the monitor.
                assert!(unsafe { fast.fast_unlock(&header, &record, me) }.is_success());
            });
            releaser.join().unwrap();
            acquirer.join().unwrap();
        });
    }

    /// Evaluates that concurrent `Synchronizer` acquisitions, inflation
    /// included, serialize all mutations against the shared data.
    pub fn synchronizer_lock_join() {
        model(|| {
            let data = Arc::new(Synchronized::new(&CLASS, UnsafeCell::new(0usize)));
            let handles: [_; LOCKS] = array::from_fn(|index| {
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let sync = Synchronizer::<_, Yield>::new(fast_path());
                    let mut record = LockRecord::new();
                    let me = ThreadIdentity::from_index(index);
                    // SAFETY: Every model thread has its own identity.
                    unsafe {
                        data.lock_with_then(&sync, &mut record, me, |cell| {
                            cell.with_mut(|n| *n += 1);
                        });
                    }
                })
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let sync = Synchronizer::<_, Yield>::new(fast_path());
            let mut record = LockRecord::new();
            let me = ThreadIdentity::from_index(LOCKS);
            // SAFETY: Every model thread has its own identity.
            let value = unsafe {
                data.lock_with_then(&sync, &mut record, me, |cell| cell.with(|n| *n))
            };
            assert_eq!(LOCKS, value);
        });
    }
}
