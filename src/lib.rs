//! A fast path for adaptive object locks: biased, stack-locked and inflated
//! monitor acquisition over a single shared mark word.
//!
//! Every lockable object carries an [`ObjectHeader`], a word-sized mark word
//! plus the monitor that backs it once contended. A lock moves through
//! three tiers:
//!
//! - **biased**: the object is reserved for a single thread, which then
//!   locks and unlocks it without any atomic read-modify-write;
//! - **stack-locked**: the mark word is swapped for the address of a
//!   [`LockRecord`] on the owner's stack, holding the displaced header. A
//!   thread re-entering its own lock recognizes its record by stack
//!   proximity and records a recursion instead; and
//! - **inflated**: the mark word points at an [`ObjectMonitor`], which
//!   tracks the owner, the recursion count and the waiting threads.
//!
//! [`FastPath::fast_lock`] and [`FastPath::fast_unlock`] only ever attempt
//! the cheap transitions between those tiers. They never block and never
//! wait; when a transition loses a race or needs a revocation or an
//! inflation, they report [`Outcome::Fallback`] and the caller must finish
//! the operation through a slow path. The [`Synchronizer`] is such a slow
//! path, and [`Synchronized`] wraps a value with a lock that is driven by
//! one.
//!
//! ## Lock records and thread identities
//!
//! An acquisition is made through a [`LockRecord`] that must stay at the
//! same address until the matching release, and on behalf of a
//! [`ThreadIdentity`]. The lock trusts the identity it is given, so
//! identities must never be shared by live threads. This is the reason
//! [`Synchronized::lock_with_then`] and [`FastPath::fast_lock`] are unsafe.
//! For the same reason [`Platform`] is an unsafe trait: its stack pointer
//! and page size decide which records count as the caller's own.
//!
//! ## Features
//!
//! This crate does not provide any default features. Features that can be
//! enabled are:
//!
//! ### yield
//!
//! The `yield` feature requires linking to the standard library, so it is not
//! suitable for `no_std` environments. By enabling the `yield` feature, the
//! [`relax::Yield`] and [`relax::YieldBackoff`] policies become available,
//! which call [`std::thread::yield_now`] while waiting in the slow path.
//!
//! ### thread_local
//!
//! The `thread_local` feature also requires linking to the standard library.
//! It provides [`ThreadIdentity::current`], and the safe
//! [`Synchronized::lock_then`] and [`Synchronized::try_lock_then`] methods
//! that allocate the lock record on the stack.
//!
//! [`std::thread::yield_now`]: https://doc.rust-lang.org/std/thread/fn.yield_now.html
//! [`ThreadIdentity::current`]: ThreadIdentity
//! [`Synchronized::lock_then`]: Synchronized
//! [`Synchronized::try_lock_then`]: Synchronized
//! [`relax::YieldBackoff`]: https://docs.rs/marklock/latest/marklock/relax/struct.YieldBackoff.html

#![cfg_attr(not(any(feature = "yield", feature = "thread_local", test)), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod cas;
pub mod markword;
pub mod relax;
pub mod synchronizer;

mod bias;
mod fast;
mod monitor;
mod object;
mod platform;
mod record;
mod stack;
mod stats;
mod sync;
mod thread;

pub use bias::{bias_state, BiasConfig, BiasEpoch, BiasState};
pub use fast::{DiagnoseValueBased, FastPath, LockConfig, Outcome};
pub use markword::{DisplacedHeader, LockState, MarkWord};
pub use monitor::ObjectMonitor;
pub use object::{ObjectClass, ObjectHeader};
pub use platform::{proximity_delta, NativeStack, Platform, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use record::LockRecord;
pub use stats::{Counter, CounterSnapshot, LockCounters};
pub use sync::Synchronized;
pub use synchronizer::Synchronizer;
pub use thread::ThreadIdentity;

pub(crate) mod cfg;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
pub(crate) mod loom;
