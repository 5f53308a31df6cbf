pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{fence, AtomicIsize, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{fence, AtomicIsize, AtomicUsize};
}
