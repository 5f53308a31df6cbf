//! Busy-wait policies for the slow path.
//!
//! The fast path never waits. When the [`Synchronizer`] has to wait, for a
//! monitor owner to leave or for an inflation in progress to complete, it
//! calls [`Relax::relax`] between two polls of the shared state.
//!
//! [`Synchronizer`]: crate::Synchronizer

/// A policy run between two polls of a contended lock.
pub trait Relax {
    /// Creates the state of one waiting period.
    fn new() -> Self;

    /// Waits a little before the next poll.
    fn relax(&mut self);
}

/// Hints the processor that the thread is spinning, through
/// [`core::hint::spin_loop`].
///
/// A spinning waiter keeps its time slice, so it can delay the very thread
/// it waits for if both share a core. Prefer [`Yield`] when `std` is
/// available and lock holders may be preempted.
#[derive(Debug)]
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// Gives the rest of the time slice back to the scheduler.
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
#[derive(Debug)]
pub struct Yield;

#[cfg(all(any(feature = "yield", test), not(all(loom, test))))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        std::thread::yield_now();
    }
}

/// Under Loom, a waiter must yield to the model scheduler or the model
/// never lets the thread it waits for run.
#[cfg(all(loom, test))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        loom::thread::yield_now();
    }
}

/// Polls again right away, without any hint.
///
/// Only useful on targets whose spin hint is broken. Use [`Spin`] otherwise.
#[derive(Debug)]
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

// The backoff policies double their spin count on every call, as
// crossbeam-utils' `Backoff` does.

/// Spins like [`Spin`], doubling the number of spin hints on every call up
/// to a limit.
#[derive(Debug)]
pub struct SpinBackoff {
    step: Step,
}

impl SpinBackoff {
    const SPIN_LIMIT: u32 = 6;
}

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.step.spin_to(Self::SPIN_LIMIT);
        self.step.step_to(Self::SPIN_LIMIT);
    }
}

/// Spins with backoff like [`SpinBackoff`] for a while, then yields to the
/// scheduler like [`Yield`].
#[cfg(feature = "yield")]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
#[derive(Debug)]
pub struct YieldBackoff {
    step: Step,
}

#[cfg(feature = "yield")]
impl YieldBackoff {
    const SPIN_LIMIT: u32 = SpinBackoff::SPIN_LIMIT;
    const YIELD_LIMIT: u32 = 10;
}

#[cfg(feature = "yield")]
impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.step.0 <= Self::SPIN_LIMIT {
            self.step.spin_to(Self::SPIN_LIMIT);
        } else {
            std::thread::yield_now();
        }
        self.step.step_to(Self::YIELD_LIMIT);
    }
}

/// Number of calls made so far, saturating.
#[derive(Debug)]
struct Step(u32);

impl Step {
    /// Runs `2^min(step, max)` spin hints.
    fn spin_to(&self, max: u32) {
        for _ in 0..1u32 << self.0.min(max) {
            core::hint::spin_loop();
        }
    }

    /// Advances the step, stopping past `end`.
    fn step_to(&mut self, end: u32) {
        if self.0 <= end {
            self.0 += 1;
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Loop, Relax, Spin, SpinBackoff, Step, Yield};

    fn relax_n<R: Relax>(n: usize) {
        let mut relax = R::new();
        for _ in 0..n {
            relax.relax();
        }
    }

    #[test]
    fn policies_return() {
        relax_n::<Spin>(4);
        relax_n::<Yield>(4);
        relax_n::<Loop>(4);
        relax_n::<SpinBackoff>(16);
    }

    #[test]
    fn step_saturates() {
        let mut step = Step(0);
        for _ in 0..20 {
            step.step_to(6);
        }
        assert_eq!(step.0, 7);
    }
}
