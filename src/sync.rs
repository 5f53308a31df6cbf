use core::fmt::{self, Debug, Formatter};

use crate::object::{ObjectClass, ObjectHeader};
use crate::platform::Platform;
use crate::record::LockRecord;
use crate::relax::Relax;
use crate::synchronizer::Synchronizer;
use crate::thread::ThreadIdentity;

/// A value guarded by its own object lock.
///
/// `Synchronized` pairs an [`ObjectHeader`] with the data it protects, and
/// runs closures against the data while holding the lock. The lock is
/// reentrant, so closures only get a shared reference to the data: use
/// interior mutability, such as [`Cell`], to change it.
///
/// Acquisitions require a [`LockRecord`], mutably borrowed for the closure
/// scope, and the identity of the calling thread. With the `thread_local`
/// feature, [`lock_then`] and [`try_lock_then`] allocate the record on the
/// stack and look up the identity themselves.
///
/// Instances are never biased, whatever the biasing state of the
/// synchronizer: headers start neutral and every release restores the
/// neutral word, so a thread that locked the data and went away never
/// keeps other threads out.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
///
/// use marklock::synchronizer::spins::Synchronizer;
/// use marklock::{FastPath, LockConfig, LockRecord, NativeStack};
/// use marklock::{ObjectClass, Synchronized, ThreadIdentity};
///
/// static CLASS: ObjectClass = ObjectClass::new();
/// let sync = Synchronizer::new(FastPath::new(LockConfig::DEFAULT, NativeStack::new()));
/// let data = Synchronized::new(&CLASS, Cell::new(0));
/// let thread = ThreadIdentity::from_index(0);
///
/// let mut record = LockRecord::new();
/// // SAFETY: `thread` is only ever used by this thread.
/// let value = unsafe {
///     data.lock_with_then(&sync, &mut record, thread, |cell| {
///         cell.set(cell.get() + 1);
///         cell.get()
///     })
/// };
/// assert_eq!(value, 1);
/// ```
/// [`Cell`]: core::cell::Cell
/// [`lock_then`]: Synchronized::lock_then
/// [`try_lock_then`]: Synchronized::try_lock_then
pub struct Synchronized<'k, T: ?Sized> {
    header: ObjectHeader<'k>,
    data: T,
}

// The lock serializes every access to `data` across threads, as with
// `std::sync::ReentrantLock`.
unsafe impl<T: ?Sized + Send> Sync for Synchronized<'_, T> {}

impl<'k, T> Synchronized<'k, T> {
    /// Creates a new unlocked `Synchronized` (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new(class: &'k ObjectClass, value: T) -> Self {
        Self { header: ObjectHeader::new(class), data: value }
    }

    /// Creates a new unlocked `Synchronized` with Loom primitives
    /// (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new(class: &'k ObjectClass, value: T) -> Self {
        Self { header: ObjectHeader::new(class), data: value }
    }

    /// Consumes this `Synchronized`, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<'k, T: ?Sized> Synchronized<'k, T> {
    /// Returns the object header.
    pub fn header(&self) -> &ObjectHeader<'k> {
        &self.header
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// The mutable borrow statically guarantees that no lock is held.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Returns `true` if some thread holds the lock. A bias alone does not
    /// count as held.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    pub fn is_locked(&self) -> bool {
        self.header.is_locked()
    }

    /// Acquires the lock through `sync` and runs `f` against the data.
    ///
    /// The lock is released when `f` returns or unwinds.
    ///
    /// # Safety
    ///
    /// `thread` must be the identity of the calling thread, and no other
    /// live thread may use it.
    pub unsafe fn lock_with_then<P, R, F, Ret>(
        &self,
        sync: &Synchronizer<P, R>,
        record: &mut LockRecord,
        thread: ThreadIdentity,
        f: F,
    ) -> Ret
    where
        P: Platform,
        R: Relax,
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: `record` stays borrowed until the guard releases the lock,
        // and caller guarantees `thread` is unique.
        unsafe { sync.enter(&self.header, record, thread) };
        let guard = Guard { sync, header: &self.header, record, thread };
        let ret = f(&self.data);
        drop(guard);
        ret
    }

    /// Attempts to acquire the lock through the fast path only, and runs `f`
    /// against the data if it succeeded, or against [`None`] otherwise.
    ///
    /// This function does not block.
    ///
    /// # Safety
    ///
    /// `thread` must be the identity of the calling thread, and no other
    /// live thread may use it.
    pub unsafe fn try_lock_with_then<P, R, F, Ret>(
        &self,
        sync: &Synchronizer<P, R>,
        record: &mut LockRecord,
        thread: ThreadIdentity,
        f: F,
    ) -> Ret
    where
        P: Platform,
        R: Relax,
        F: FnOnce(Option<&T>) -> Ret,
    {
        // SAFETY: `record` stays borrowed until the guard releases the lock,
        // and caller guarantees `thread` is unique.
        if unsafe { sync.fast_path().fast_lock(&self.header, record, thread) }.is_fallback() {
            return f(None);
        }
        let guard = Guard { sync, header: &self.header, record, thread };
        let ret = f(Some(&self.data));
        drop(guard);
        ret
    }

    /// Acquires the lock on behalf of the current thread and runs `f`
    /// against the data.
    ///
    /// A [`LockRecord`] is transparently allocated in the stack.
    #[cfg(feature = "thread_local")]
    #[cfg_attr(docsrs, doc(cfg(feature = "thread_local")))]
    pub fn lock_then<P, R, F, Ret>(&self, sync: &Synchronizer<P, R>, f: F) -> Ret
    where
        P: Platform,
        R: Relax,
        F: FnOnce(&T) -> Ret,
    {
        let mut record = LockRecord::new();
        // SAFETY: The identity is the current thread's own.
        unsafe { self.lock_with_then(sync, &mut record, ThreadIdentity::current(), f) }
    }

    /// Attempts to acquire the lock on behalf of the current thread, through
    /// the fast path only, and runs `f` against the data if it succeeded.
    ///
    /// A [`LockRecord`] is transparently allocated in the stack.
    #[cfg(feature = "thread_local")]
    #[cfg_attr(docsrs, doc(cfg(feature = "thread_local")))]
    pub fn try_lock_then<P, R, F, Ret>(&self, sync: &Synchronizer<P, R>, f: F) -> Ret
    where
        P: Platform,
        R: Relax,
        F: FnOnce(Option<&T>) -> Ret,
    {
        let mut record = LockRecord::new();
        // SAFETY: The identity is the current thread's own.
        unsafe { self.try_lock_with_then(sync, &mut record, ThreadIdentity::current(), f) }
    }
}

#[cfg(not(all(loom, test)))]
#[cfg(not(tarpaulin_include))]
impl<T: Default> Default for Synchronized<'static, T> {
    /// Creates a `Synchronized` of a fresh unbiasable class.
    fn default() -> Self {
        static CLASS: ObjectClass = ObjectClass::unbiasable();
        Self::new(&CLASS, T::default())
    }
}

impl<T: ?Sized + Debug> Debug for Synchronized<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Synchronized");
        if self.is_locked() {
            d.field("data", &format_args!("<locked>"));
        } else {
            d.field("data", &&self.data);
        }
        d.finish()
    }
}

/// Releases the lock when dropped, including on unwind.
struct Guard<'a, 'k, P: Platform, R: Relax> {
    sync: &'a Synchronizer<P, R>,
    header: &'a ObjectHeader<'k>,
    record: &'a LockRecord,
    thread: ThreadIdentity,
}

impl<P: Platform, R: Relax> Drop for Guard<'_, '_, P, R> {
    fn drop(&mut self) {
        // SAFETY: A guard is only created once `thread` holds the lock
        // through `record`.
        unsafe { self.sync.exit(self.header, self.record, self.thread) };
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::cell::Cell;

    use crate::fast::LockConfig;
    use crate::BiasConfig;
    use crate::relax::{Loop, Spin, SpinBackoff, Yield};
    use crate::test::tests;

    const UNBIASED: LockConfig = LockConfig::DEFAULT;
    const BIASED: LockConfig = LockConfig::DEFAULT.with_bias(BiasConfig::enabled(1));

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots_lock::<Spin>(UNBIASED);
    }

    #[test]
    fn lots_and_lots_spin_backoff() {
        tests::lots_and_lots_lock::<SpinBackoff>(UNBIASED);
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots_lock::<Yield>(UNBIASED);
    }

    #[test]
    fn lots_and_lots_loop() {
        tests::lots_and_lots_lock::<Loop>(UNBIASED);
    }

    #[test]
    fn lots_and_lots_biasing_enabled() {
        tests::lots_and_lots_lock::<Yield>(BIASED);
    }

    #[test]
    fn biasing_enabled_never_biases() {
        tests::released_object_is_free_for_other_threads::<Spin>(BIASED);
    }

    #[test]
    fn lots_and_lots_try_lock() {
        tests::lots_and_lots_try_lock::<Yield>(UNBIASED);
    }

    #[test]
    fn lots_and_lots_mixed_lock() {
        tests::lots_and_lots_mixed_lock::<Yield>(UNBIASED);
    }

    #[test]
    fn smoke() {
        tests::smoke::<Spin>(UNBIASED);
        tests::smoke::<Spin>(BIASED);
    }

    #[test]
    fn nested() {
        tests::nested::<Spin>(UNBIASED);
        tests::nested::<Spin>(BIASED);
    }

    #[test]
    fn test_try_lock() {
        tests::test_try_lock::<Spin>();
    }

    #[test]
    fn test_debug() {
        tests::test_synchronized_debug::<Spin>();
    }

    #[test]
    fn test_into_inner() {
        tests::test_into_inner();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut();
    }

    #[test]
    fn test_default() {
        let data: super::Synchronized<'static, Cell<u32>> = Default::default();
        assert_eq!(data.into_inner().get(), 0);
    }

    #[test]
    fn test_lock_nested_objects() {
        tests::test_lock_nested_objects::<Spin>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Yield>();
    }

    #[test]
    fn test_lock_access_in_unwind() {
        tests::test_lock_access_in_unwind::<Yield>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn synchronizer_lock_join() {
        models::synchronizer_lock_join();
    }
}
