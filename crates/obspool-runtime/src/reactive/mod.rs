#![forbid(unsafe_code)]

//! Topic-based change notification for reactive object models.
//!
//! This module provides the registry that routes "this attribute changed"
//! notifications to observer handles:
//!
//! - [`ObserverPool`]: topic → (observer → [`ChangeFilter`]) registry with
//!   add/remove/has/clear/notify.
//! - [`Observer`]: the capability a handle must provide (validity check and
//!   invocation).
//! - [`Callback`] / [`CallbackRef`]: closure owner and the weak handle that
//!   is registered with the pool.
//! - [`DeferredTask`]: a write captured during dispatch and replayed after it.
//!
//! # Architecture
//!
//! `ObserverPool` uses `Rc<RefCell<..>>` for single-threaded shared
//! ownership, so observers may hold a handle to the pool and call back into
//! it. Dispatch iterates a snapshot of the topic's subscriptions with the
//! borrow released; structural writes made meanwhile are queued and replayed
//! when the outermost dispatch returns.
//!
//! # Invariants
//!
//! 1. A topic is present only while it has at least one observer.
//! 2. Observers added during a dispatch pass are not invoked by that pass.
//! 3. Deferred writes replay in issue order, once, after the outermost pass.
//! 4. Invalid observers are never invoked and never reported as errors; they
//!    are pruned after the pass that met them.
//! 5. An observer failure stops the pass but not the replay.
//!
//! [`ChangeFilter`]: obspool_core::ChangeFilter

pub mod guard;
pub mod observer;
pub mod pool;
pub mod store;

pub use guard::DeferredTask;
pub use observer::{Callback, CallbackRef, Observer, ObserverError};
pub use pool::{CallbackPool, ObserverPool, PoolConfig, PoolError};
pub use store::{Reference, SubscriptionMap};
