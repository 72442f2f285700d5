#![forbid(unsafe_code)]

//! Observer handles.
//!
//! # Design
//!
//! The pool never owns the code it calls. It stores *handles* implementing
//! [`Observer`], and asks each handle two questions: is your target still
//! alive, and please run with this payload.
//!
//! [`Callback`] / [`CallbackRef`] are the stock implementation: the owner
//! keeps a strong `Rc` to the closure and registers a weak [`CallbackRef`]
//! with the pool. Dropping the owner invalidates the handle, and the pool
//! prunes it the next time it dispatches on that topic.
//!
//! # Identity
//!
//! `CallbackRef` equality and hashing use the address of the shared closure
//! allocation. A `Weak` keeps that allocation reserved even after the closure
//! is dropped, so a dead handle still compares equal to its clones and can be
//! located for removal.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

/// Capability the pool requires from an observer handle.
pub trait Observer<P: ?Sized> {
    /// Whether the target of this handle still exists. Invalid handles are
    /// never invoked and are pruned lazily during dispatch.
    fn is_valid(&self) -> bool;

    /// Deliver `payload`.
    ///
    /// # Errors
    ///
    /// A failure aborts the remainder of the dispatch pass that invoked it.
    fn invoke(&self, payload: &P) -> Result<(), ObserverError>;
}

/// Failure reported by an observer invocation.
#[derive(Debug)]
pub struct ObserverError {
    message: String,
    source: Option<Box<dyn std::error::Error + 'static>>,
}

impl ObserverError {
    /// Create an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + 'static>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer failed: {}", self.message)
    }
}

impl std::error::Error for ObserverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref()
    }
}

/// Owning side of a callback subscription.
///
/// Keep this alive for as long as the callback should fire. Handles obtained
/// from [`Callback::handle`] become invalid once every clone of the owner
/// has been dropped.
pub struct Callback<P: ?Sized> {
    inner: Rc<dyn Fn(&P) -> Result<(), ObserverError>>,
}

impl<P: ?Sized + 'static> Callback<P> {
    /// Wrap a fallible closure.
    pub fn new(f: impl Fn(&P) -> Result<(), ObserverError> + 'static) -> Self {
        Self { inner: Rc::new(f) }
    }

    /// Wrap a closure that cannot fail.
    pub fn from_fn(f: impl Fn(&P) + 'static) -> Self {
        Self::new(move |payload| {
            f(payload);
            Ok(())
        })
    }

    /// A weak handle suitable for registering with a pool.
    #[must_use]
    pub fn handle(&self) -> CallbackRef<P> {
        CallbackRef {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl<P: ?Sized> Clone for Callback<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P: ?Sized> fmt::Debug for Callback<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("handles", &Rc::weak_count(&self.inner))
            .finish()
    }
}

/// Weak, cloneable observer handle for a [`Callback`].
pub struct CallbackRef<P: ?Sized> {
    inner: Weak<dyn Fn(&P) -> Result<(), ObserverError>>,
}

impl<P: ?Sized> CallbackRef<P> {
    fn addr(&self) -> *const () {
        Weak::as_ptr(&self.inner) as *const ()
    }
}

impl<P: ?Sized + 'static> Observer<P> for CallbackRef<P> {
    fn is_valid(&self) -> bool {
        self.inner.strong_count() > 0
    }

    fn invoke(&self, payload: &P) -> Result<(), ObserverError> {
        match self.inner.upgrade() {
            Some(f) => f(payload),
            // The owner went away between the validity check and the call.
            None => Ok(()),
        }
    }
}

impl<P: ?Sized> Clone for CallbackRef<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<P: ?Sized> PartialEq for CallbackRef<P> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self.addr(), other.addr())
    }
}

impl<P: ?Sized> Eq for CallbackRef<P> {}

impl<P: ?Sized> Hash for CallbackRef<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<P: ?Sized> fmt::Debug for CallbackRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRef")
            .field("addr", &self.addr())
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
