// Test suite from the Rust's Mutex implementation with minor modifications
// since the API is not compatible with this crate implementation and some
// new tests as well.
//
// Copyright 2014 The Rust Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::Cell;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use marklock::synchronizer::spins::Synchronizer;
use marklock::{BiasConfig, BiasEpoch, Counter, FastPath, LockConfig, LockCounters};
use marklock::{LockRecord, LockState, NativeStack, ObjectClass, ObjectHeader};
use marklock::{Synchronized, ThreadIdentity};

static CLASS: ObjectClass = ObjectClass::unbiasable();

fn synchronizer(config: LockConfig) -> Synchronizer {
    Synchronizer::new(FastPath::new(config, NativeStack::new()))
}

/// Runs `f` against the data of `sync` with a fresh record.
fn locked<T, R>(data: &Synchronized<'_, T>, index: usize, f: impl FnOnce(&T) -> R) -> R {
    let sync = synchronizer(LockConfig::DEFAULT);
    let mut record = LockRecord::new();
    let thread = ThreadIdentity::from_index(index);
    // SAFETY: Callers pass a distinct index per thread.
    unsafe { data.lock_with_then(&sync, &mut record, thread, f) }
}

#[test]
fn smoke() {
    let data = Synchronized::new(&CLASS, ());
    locked(&data, 0, |_| ());
    locked(&data, 0, |_| ());
    assert!(!data.is_locked());
}

#[test]
fn lots_and_lots() {
    const ITERS: u32 = 1000;
    const CONCURRENCY: usize = 3;

    let data = Arc::new(Synchronized::new(&CLASS, Cell::new(0u32)));
    let (tx, rx) = channel();
    for index in 0..CONCURRENCY {
        let (data, tx) = (Arc::clone(&data), tx.clone());
        thread::spawn(move || {
            for _ in 0..2 * ITERS {
                locked(&data, index, |cell| cell.set(cell.get() + 1));
            }
            tx.send(()).unwrap();
        });
    }
    drop(tx);
    for _ in 0..CONCURRENCY {
        rx.recv().unwrap();
    }
    let total = locked(&data, CONCURRENCY, |cell| cell.get());
    assert_eq!(total, ITERS * CONCURRENCY as u32 * 2);
}

#[test]
fn reentrant_access_sees_same_data() {
    let data = Synchronized::new(&CLASS, Cell::new(1));
    let sync = synchronizer(LockConfig::DEFAULT);
    let thread = ThreadIdentity::from_index(0);
    let (mut outer, mut inner) = (LockRecord::new(), LockRecord::new());
    // SAFETY: Only this thread uses index 0.
    let value = unsafe {
        data.lock_with_then(&sync, &mut outer, thread, |cell| {
            cell.set(2);
            data.lock_with_then(&sync, &mut inner, thread, |cell| cell.get())
        })
    };
    assert_eq!(value, 2);
    assert!(!data.is_locked());
    assert_eq!(data.header().mark().classify(), LockState::Neutral);
}

#[test]
fn try_lock_on_held_object_fails() {
    let data = Arc::new(Synchronized::new(&CLASS, ()));
    let (held_tx, held_rx) = channel();
    let (done_tx, done_rx) = channel::<()>();
    let holder = {
        let data = Arc::clone(&data);
        thread::spawn(move || {
            locked(&data, 0, |_| {
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            });
        })
    };
    held_rx.recv().unwrap();
    let sync = synchronizer(LockConfig::DEFAULT);
    let mut record = LockRecord::new();
    // SAFETY: Only this thread uses index 1.
    let acquired = unsafe {
        data.try_lock_with_then(&sync, &mut record, ThreadIdentity::from_index(1), |d| {
            d.is_some()
        })
    };
    assert!(!acquired);
    done_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(!data.is_locked());
}

#[test]
fn biased_object_relocks_without_atomics() {
    static BIASABLE: ObjectClass = ObjectClass::new();
    static COUNTERS: LockCounters = LockCounters::new();
    static EPOCH: BiasEpoch = BiasEpoch::new(BiasConfig::enabled(0));

    let fast = FastPath::new(LockConfig::DEFAULT, NativeStack::new());
    let sync = Synchronizer::new(fast.with_counters(&COUNTERS).with_bias_epoch(&EPOCH));
    let header = Arc::new(ObjectHeader::with_prototype(&BIASABLE, &EPOCH.load()));
    let thread = ThreadIdentity::from_index(0);
    for _ in 0..3 {
        let record = LockRecord::new();
        // SAFETY: Only this thread uses index 0, and `record` outlives the
        // acquisition.
        unsafe {
            sync.enter(&header, &record, thread);
            sync.exit(&header, &record, thread);
        }
    }
    let snapshot = COUNTERS.snapshot();
    assert_eq!(snapshot.total_entry, 3);
    assert_eq!(snapshot.anonymously_biased_lock_entry, 1);
    assert_eq!(snapshot.biased_lock_entry, 2);
    assert_eq!(COUNTERS.get(Counter::SlowPathEntry), 0);
    let state = header.mark().classify();
    assert_eq!(state, LockState::Biased { thread: thread.word(), epoch: 0 });

    // The owner is done with the object, so the runtime may rebias it.
    // SAFETY: No thread holds a biased lock.
    assert_eq!(unsafe { EPOCH.bulk_rebias() }, 1);
    let other = ThreadIdentity::from_index(1);
    let c_header = Arc::clone(&header);
    thread::spawn(move || {
        let fast = FastPath::new(LockConfig::DEFAULT, NativeStack::new());
        let sync = Synchronizer::new(fast.with_bias_epoch(&EPOCH));
        let record = LockRecord::new();
        // SAFETY: Only this thread uses index 1.
        unsafe {
            sync.enter(&c_header, &record, other);
            sync.exit(&c_header, &record, other);
        }
    })
    .join()
    .unwrap();
    let state = header.mark().classify();
    assert_eq!(state, LockState::Biased { thread: other.word(), epoch: 1 });
}

#[test]
fn synchronized_released_by_exited_thread_with_biasing_enabled() {
    static BIASABLE: ObjectClass = ObjectClass::new();

    let config = LockConfig::DEFAULT.with_bias(BiasConfig::enabled(1));
    let data = Arc::new(Synchronized::new(&BIASABLE, Cell::new(0)));
    let increment = move |data: Arc<Synchronized<'static, Cell<i32>>>, index, tx: Sender<()>| {
        move || {
            let sync = synchronizer(config);
            let mut record = LockRecord::new();
            let thread = ThreadIdentity::from_index(index);
            // SAFETY: Each thread uses its own index.
            unsafe { data.lock_with_then(&sync, &mut record, thread, |c| c.set(c.get() + 1)) };
            tx.send(()).unwrap();
        }
    };
    let (tx, rx) = channel();
    thread::spawn(increment(Arc::clone(&data), 0, tx.clone())).join().unwrap();
    assert!(data.header().mark().is_neutral());

    // The first thread is gone; a second one must not wait on it.
    thread::spawn(increment(Arc::clone(&data), 1, tx));
    for _ in 0..2 {
        rx.recv_timeout(Duration::from_secs(3)).unwrap();
    }
    assert_eq!(locked(&data, 2, |cell| cell.get()), 2);
    assert!(data.header().mark().is_neutral());
}

#[test]
fn into_inner_and_get_mut() {
    let mut data = Synchronized::new(&CLASS, vec![1, 2]);
    data.get_mut().push(3);
    assert_eq!(data.into_inner(), [1, 2, 3]);
}

#[cfg(feature = "thread_local")]
#[test]
fn thread_local_identities() {
    let data = Arc::new(Synchronized::new(&CLASS, Cell::new(0)));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let data = Arc::clone(&data);
            thread::spawn(move || {
                let sync = synchronizer(LockConfig::DEFAULT);
                for _ in 0..100 {
                    data.lock_then(&sync, |cell| cell.set(cell.get() + 1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let sync = synchronizer(LockConfig::DEFAULT);
    assert_eq!(data.lock_then(&sync, |cell| cell.get()), 400);
}
