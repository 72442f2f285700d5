#![forbid(unsafe_code)]

//! Runtime: the re-entrant observer registry.
//!
//! # Role in obspool
//! `obspool-runtime` owns the [`ObserverPool`]: it stores which observers
//! listen to which topics, filters deliveries by [`ChangeFilter`], and keeps
//! iteration sound while observers subscribe, unsubscribe or clear the pool
//! from inside a notification.
//!
//! # How it fits in the system
//! A host object model decides *when* something changed and calls
//! [`ObserverPool::notify`]. It supplies opaque topic keys and observer
//! handles; the pool only hashes, compares and calls them.
//!
//! ```
//! use obspool_runtime::{Callback, CallbackPool, ChangeFilter};
//!
//! let pool: CallbackPool<&str, i32> = CallbackPool::new();
//! let printer = Callback::from_fn(|v: &i32| assert_eq!(*v, 3));
//! pool.add("width", printer.handle(), ChangeFilter::UPDATE).unwrap();
//!
//! pool.notify_with("width", &3, ChangeFilter::UPDATE).unwrap();
//! // Dropping the owner makes the handle invalid; the next dispatch prunes it.
//! drop(printer);
//! pool.notify("width", &4).unwrap();
//! assert!(!pool.has_topic("width"));
//! ```

pub mod reactive;

pub use obspool_core::ChangeFilter;
pub use reactive::{
    Callback, CallbackPool, CallbackRef, DeferredTask, Observer, ObserverError, ObserverPool,
    PoolConfig, PoolError, Reference,
};
