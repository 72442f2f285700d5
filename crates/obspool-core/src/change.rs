#![forbid(unsafe_code)]

//! Change-kind filter flags.
//!
//! Every subscription stores a [`ChangeFilter`] mask, and every notification
//! carries one. A subscriber is invoked only when the two masks share at
//! least one bit.
//!
//! ```
//! use obspool_core::ChangeFilter;
//!
//! let stored = ChangeFilter::UPDATE | ChangeFilter::DELETE;
//! assert!(stored.matches(ChangeFilter::UPDATE));
//! assert!(!stored.matches(ChangeFilter::CREATE));
//! assert!(stored.matches(ChangeFilter::ANY));
//! ```

use bitflags::bitflags;

bitflags! {
    /// Kinds of change a subscriber is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeFilter: u8 {
        /// A value was produced for the first time (default computed).
        const CREATE = 1 << 0;
        /// An existing value was replaced.
        const UPDATE = 1 << 1;
        /// A value was deleted.
        const DELETE = 1 << 2;
        /// A stateless event was emitted.
        const EVENT = 1 << 3;
        /// A computed property changed.
        const PROPERTY = 1 << 4;
        /// The contents of a container value changed in place.
        const CONTAINER = 1 << 5;
        /// Wildcard: every bit set, including unnamed ones.
        const ANY = 0xFF;
    }
}

impl ChangeFilter {
    /// Whether a subscription stored with `self` should fire for a
    /// notification requesting `requested`.
    #[inline]
    #[must_use]
    pub const fn matches(self, requested: Self) -> bool {
        self.bits() & requested.bits() != 0
    }
}

impl Default for ChangeFilter {
    /// Subscriptions without an explicit filter listen to everything.
    fn default() -> Self {
        Self::ANY
    }
}
