use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crate::platform::{Platform, DEFAULT_PAGE_SIZE};
use crate::record::LockRecord;
use crate::thread::ThreadIdentity;

/// A platform whose stack pointer never moves.
#[cfg_attr(all(loom, test), allow(dead_code))]
#[derive(Clone, Copy, Debug)]
pub struct FixedStack(usize);

#[cfg_attr(all(loom, test), allow(dead_code))]
impl FixedStack {
    /// A stack pointer at `sp`.
    pub const fn at(sp: usize) -> Self {
        Self(sp)
    }

    /// A stack pointer a few words below `record`, as if `record` had been
    /// allocated by a caller of the current frame.
    pub fn below(record: &LockRecord) -> Self {
        Self(record.addr().wrapping_sub(64))
    }
}

// SAFETY: Tests lock through a fixed stack pointer only from the thread
// that placed the records below it.
unsafe impl Platform for FixedStack {
    fn stack_pointer(&self) -> usize {
        self.0
    }

    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }
}

/// A platform whose stack is never near any lock record, so every recursive
/// stack lock is missed.
#[derive(Clone, Copy, Debug)]
pub struct FarStack;

// SAFETY: No lock record lives a page above address 8.
unsafe impl Platform for FarStack {
    fn stack_pointer(&self) -> usize {
        8
    }

    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }
}

/// Hands out a thread identity no other test uses.
#[cfg_attr(all(loom, test), allow(dead_code))]
pub fn identity() -> ThreadIdentity {
    static NEXT: AtomicUsize = AtomicUsize::new(1 << 10);
    ThreadIdentity::from_index(NEXT.fetch_add(1, Relaxed))
}

/// An arbitrary unsigned integer type.
#[cfg_attr(all(loom, test), allow(dead_code))]
pub type Int = u32;

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation, adapted to
    // a reentrant lock that runs closures against shared references.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use core::cell::Cell;
    use core::ops::RangeInclusive;
    use std::format;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::{identity, FarStack, Int};
    use crate::fast::{FastPath, LockConfig};
    use crate::object::ObjectClass;
    use crate::platform::NativeStack;
    use crate::record::LockRecord;
    use crate::relax::Relax;
    use crate::sync::Synchronized;
    use crate::synchronizer::Synchronizer;
    use crate::thread::ThreadIdentity;

    #[derive(Eq, PartialEq, Debug)]
    pub struct NonCopy(u32);

    pub struct Foo(Arc<AtomicUsize>);

    impl Drop for Foo {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    type Counter = Synchronized<'static, Cell<Int>>;

    static CLASS: ObjectClass = ObjectClass::new();

    const ITERS: Int = 1000;
    const THREADS: Int = 4;
    const EXPECTED_VALUE: Int = ITERS * THREADS;
    const EXPECTED_RANGE: RangeInclusive<Int> = 1..=EXPECTED_VALUE;

    fn synchronizer<R: Relax>(config: LockConfig) -> Synchronizer<NativeStack, R> {
        Synchronizer::new(FastPath::new(config, NativeStack::new()))
    }

    fn lock_inc<R: Relax>(
        sync: &Synchronizer<NativeStack, R>,
        data: &Counter,
        record: &mut LockRecord,
        thread: ThreadIdentity,
    ) {
        // SAFETY: Every test thread has its own identity.
        unsafe { data.lock_with_then(sync, record, thread, |n| n.set(n.get() + 1)) }
    }

    fn try_lock_inc<R: Relax>(
        sync: &Synchronizer<NativeStack, R>,
        data: &Counter,
        record: &mut LockRecord,
        thread: ThreadIdentity,
    ) {
        // SAFETY: Every test thread has its own identity.
        unsafe {
            data.try_lock_with_then(sync, record, thread, |n| {
                if let Some(n) = n {
                    n.set(n.get() + 1);
                }
            });
        }
    }

    fn lock_get(data: &Counter) -> Int {
        let sync = synchronizer::<crate::relax::Spin>(LockConfig::DEFAULT);
        let mut record = LockRecord::new();
        // SAFETY: Every test thread has its own identity.
        unsafe { data.lock_with_then(&sync, &mut record, identity(), Cell::get) }
    }

    fn lock_inc_for<R: Relax>(sync: &Synchronizer<NativeStack, R>, data: &Counter) {
        let mut record = LockRecord::new();
        let thread = identity();
        for _ in 0..ITERS {
            lock_inc(sync, data, &mut record, thread);
        }
    }

    fn try_lock_inc_for<R: Relax>(sync: &Synchronizer<NativeStack, R>, data: &Counter) {
        let mut record = LockRecord::new();
        let thread = identity();
        for _ in 0..ITERS {
            try_lock_inc(sync, data, &mut record, thread);
        }
    }

    fn mixed_lock_inc_for<R: Relax>(sync: &Synchronizer<NativeStack, R>, data: &Counter) {
        let mut record = LockRecord::new();
        let thread = identity();
        for r in 0..ITERS {
            let f = if r % 2 == 0 { lock_inc::<R> } else { try_lock_inc::<R> };
            f(sync, data, &mut record, thread);
        }
    }

    fn lots_and_lots<R>(config: LockConfig, f: fn(&Synchronizer<NativeStack, R>, &Counter)) -> Int
    where
        R: Relax + 'static,
    {
        // Headers start neutral, so biasing never kicks in across threads.
        let data = Arc::new(Counter::new(&CLASS, Cell::new(0)));
        let (tx, rx) = channel();
        for _ in 0..THREADS {
            let c_data = Arc::clone(&data);
            let c_tx = tx.clone();
            thread::spawn(move || {
                f(&synchronizer::<R>(config), &c_data);
                c_tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..THREADS {
            rx.recv().unwrap();
        }
        lock_get(&data)
    }

    pub fn lots_and_lots_lock<R: Relax + 'static>(config: LockConfig) {
        let value = lots_and_lots::<R>(config, lock_inc_for::<R>);
        assert_eq!(value, EXPECTED_VALUE);
    }

    pub fn lots_and_lots_try_lock<R: Relax + 'static>(config: LockConfig) {
        let value = lots_and_lots::<R>(config, try_lock_inc_for::<R>);
        assert!(EXPECTED_RANGE.contains(&value));
    }

    pub fn lots_and_lots_mixed_lock<R: Relax + 'static>(config: LockConfig) {
        let value = lots_and_lots::<R>(config, mixed_lock_inc_for::<R>);
        assert!(EXPECTED_RANGE.contains(&value));
    }

    pub fn smoke<R: Relax>(config: LockConfig) {
        let sync = synchronizer::<R>(config);
        let data = Counter::new(&CLASS, Cell::new(1));
        let mut record = LockRecord::new();
        let thread = identity();
        lock_inc(&sync, &data, &mut record, thread);
        lock_inc(&sync, &data, &mut record, thread);
        assert!(!data.is_locked());
        assert_eq!(data.into_inner().get(), 3);
    }

    pub fn nested<R: Relax>(config: LockConfig) {
        let sync = synchronizer::<R>(config);
        let data = Counter::new(&CLASS, Cell::new(0));
        let initial = data.header().mark();
        let (mut outer, mut inner) = (LockRecord::new(), LockRecord::new());
        let thread = identity();
        // SAFETY: Every test thread has its own identity.
        let value = unsafe {
            data.lock_with_then(&sync, &mut outer, thread, |n| {
                n.set(1);
                data.lock_with_then(&sync, &mut inner, thread, |n| {
                    n.set(n.get() + 1);
                    n.get()
                })
            })
        };
        assert_eq!(value, 2);
        assert!(!data.is_locked());
        // Unless inflated, the header is back to what it was.
        let mark = data.header().mark();
        assert!(mark == initial || mark.has_monitor());
    }

    pub fn released_object_is_free_for_other_threads<R: Relax + 'static>(config: LockConfig) {
        let data = Arc::new(Counter::new(&CLASS, Cell::new(0)));
        for _ in 0..2 {
            let c_data = Arc::clone(&data);
            thread::spawn(move || {
                let sync = synchronizer::<R>(config);
                let mut record = LockRecord::new();
                let thread = identity();
                for _ in 0..3 {
                    lock_inc(&sync, &c_data, &mut record, thread);
                }
            })
            .join()
            .unwrap();
            let mark = data.header().mark();
            assert!(mark.is_neutral() || mark.has_monitor());
        }
        assert_eq!(lock_get(&data), 6);
    }

    pub fn test_try_lock<R: Relax>() {
        let sync = synchronizer::<R>(LockConfig::DEFAULT);
        let far = Synchronizer::<FarStack, R>::new(FastPath::new(LockConfig::DEFAULT, FarStack));
        let data = Synchronized::new(&CLASS, ());
        let (mut record, mut other) = (LockRecord::new(), LockRecord::new());
        let (thread, contender) = (identity(), identity());
        // SAFETY: Every test thread has its own identity, `contender` stands
        // for a thread that never runs.
        unsafe {
            data.try_lock_with_then(&sync, &mut record, thread, |unit| {
                assert!(unit.is_some());
                assert!(data.is_locked());
                data.try_lock_with_then(&far, &mut other, contender, |unit| {
                    assert!(unit.is_none());
                });
            });
        }
        assert!(!data.is_locked());
    }

    pub fn test_synchronized_debug<R: Relax>() {
        let sync = synchronizer::<R>(LockConfig::DEFAULT);
        let value = 42;
        let data = Synchronized::new(&CLASS, value);
        let msg = format!("Synchronized {{ data: {value:?} }}");
        assert_eq!(msg, format!("{data:?}"));

        let mut record = LockRecord::new();
        let msg = "Synchronized { data: <locked> }";
        // SAFETY: Every test thread has its own identity.
        unsafe {
            data.lock_with_then(&sync, &mut record, identity(), |_| {
                assert_eq!(msg, format!("{data:?}"));
            });
        }
    }

    pub fn test_into_inner() {
        let data = Synchronized::new(&CLASS, NonCopy(10));
        assert_eq!(data.into_inner(), NonCopy(10));

        let num_drops = Arc::new(AtomicUsize::new(0));
        let data = Synchronized::new(&CLASS, Foo(num_drops.clone()));
        assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        {
            let _inner = data.into_inner();
            assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(num_drops.load(Ordering::SeqCst), 1);
    }

    pub fn test_get_mut() {
        let mut data = Synchronized::new(&CLASS, NonCopy(10));
        *data.get_mut() = NonCopy(20);
        assert_eq!(data.into_inner(), NonCopy(20));
    }

    pub fn test_lock_nested_objects<R: Relax + 'static>() {
        // Tests nested objects and access to underlying data.
        let inner = Arc::new(Counter::new(&CLASS, Cell::new(1)));
        let outer = Arc::new(Synchronized::new(&CLASS, inner));
        let _t = thread::spawn(move || {
            let sync = synchronizer::<R>(LockConfig::DEFAULT);
            let mut record = LockRecord::new();
            // SAFETY: Every test thread has its own identity.
            let val = unsafe {
                outer.lock_with_then(&sync, &mut record, identity(), |inner| lock_get(inner))
            };
            assert_eq!(val, 1);
        })
        .join();
    }

    pub fn test_acquire_more_than_one_lock<R: Relax + 'static>() {
        let shared = Arc::new(Counter::new(&CLASS, Cell::new(1)));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let c_shared = Arc::clone(&shared);
            let t = thread::spawn(move || {
                let sync = synchronizer::<R>(LockConfig::DEFAULT);
                let (mut record, mut local_record) = (LockRecord::new(), LockRecord::new());
                let thread = identity();
                let local = Counter::new(&CLASS, Cell::new(1));
                // SAFETY: Every test thread has its own identity.
                unsafe {
                    c_shared.lock_with_then(&sync, &mut record, thread, |_| {
                        lock_inc(&sync, &local, &mut local_record, thread);
                    });
                }
                assert_eq!(local.into_inner().get(), 2);
            });
            threads.push(t);
        }
        for thread in threads {
            thread.join().unwrap();
        }
    }

    pub fn test_lock_access_in_unwind<R: Relax + 'static>() {
        let data = Arc::new(Counter::new(&CLASS, Cell::new(1)));
        let c_data = Arc::clone(&data);
        let _ = thread::spawn(move || {
            struct Unwinder<R: Relax> {
                i: Arc<Counter>,
                sync: Synchronizer<NativeStack, R>,
            }
            impl<R: Relax> Drop for Unwinder<R> {
                fn drop(&mut self) {
                    let mut record = LockRecord::new();
                    lock_inc(&self.sync, &self.i, &mut record, identity());
                }
            }
            let sync = synchronizer::<R>(LockConfig::DEFAULT);
            let _u = Unwinder { i: c_data, sync };
            panic!();
        })
        .join();
        assert_eq!(lock_get(&data), 2);

        // A panic inside the closure releases the lock.
        let c_data = Arc::clone(&data);
        let _ = thread::spawn(move || {
            let sync = synchronizer::<R>(LockConfig::DEFAULT);
            let mut record = LockRecord::new();
            // SAFETY: Every test thread has its own identity.
            unsafe {
                c_data.lock_with_then(&sync, &mut record, identity(), |n| {
                    n.set(n.get() + 1);
                    panic!();
                })
            }
        })
        .join();
        assert!(!data.is_locked());
        assert_eq!(lock_get(&data), 3);
    }
}
