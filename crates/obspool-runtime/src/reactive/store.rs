#![forbid(unsafe_code)]

//! Two-level topic storage.
//!
//! [`TopicStore`] maps each topic to its [`SubscriptionMap`] (observer →
//! [`ChangeFilter`]). The operations here apply immediately; deferral during
//! dispatch is layered on top by the pool.
//!
//! # Invariants
//!
//! 1. A topic present in the store maps to a non-empty subscription map.
//!    Emptied maps are removed, never retained.
//! 2. Lookups never create entries.
//! 3. A failed insert leaves no partial topic or observer behind.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::ControlFlow;

use obspool_core::ChangeFilter;

use super::observer::Observer;
use super::pool::PoolError;

/// Per-topic mapping from observer handle to the filter it subscribed with.
pub type SubscriptionMap<O> = HashMap<O, ChangeFilter>;

/// A reference held by the pool, yielded during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a, T, O> {
    /// A topic key.
    Topic(&'a T),
    /// An observer handle.
    Observer(&'a O),
}

#[derive(Debug)]
pub(crate) struct TopicStore<T, O> {
    topics: HashMap<T, SubscriptionMap<O>>,
    max_topics: Option<usize>,
}

impl<T, O> TopicStore<T, O>
where
    T: Eq + Hash,
    O: Eq + Hash,
{
    pub(crate) fn with_capacity(capacity: usize, max_topics: Option<usize>) -> Self {
        Self {
            topics: HashMap::with_capacity(capacity),
            max_topics,
        }
    }

    pub(crate) fn has_topic<Q>(&self, topic: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.topics.get(topic).is_some_and(|map| !map.is_empty())
    }

    pub(crate) fn has_observer<Q>(&self, topic: &Q, observer: &O, filter: ChangeFilter) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.topics
            .get(topic)
            .and_then(|map| map.get(observer))
            .is_some_and(|stored| stored.matches(filter))
    }

    pub(crate) fn get_key_value<Q>(&self, topic: &Q) -> Option<(&T, &SubscriptionMap<O>)>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.topics.get_key_value(topic)
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn observer_count<Q>(&self, topic: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.topics.get(topic).map_or(0, HashMap::len)
    }

    /// Subscribe `observer` to `topic`, or overwrite its filter.
    ///
    /// An invalid observer is accepted and ignored: its owner is already
    /// gone, so there is nothing to register.
    pub(crate) fn insert<P: ?Sized>(
        &mut self,
        topic: T,
        observer: O,
        filter: ChangeFilter,
    ) -> Result<(), PoolError>
    where
        O: Observer<P>,
    {
        if !observer.is_valid() {
            return Ok(());
        }

        match self.topics.get_mut(&topic) {
            Some(map) => match map.get_mut(&observer) {
                Some(stored) => {
                    if *stored != filter {
                        *stored = filter;
                    }
                }
                None => {
                    map.try_reserve(1)?;
                    map.insert(observer, filter);
                }
            },
            None => {
                if let Some(limit) = self.max_topics {
                    if self.topics.len() >= limit {
                        return Err(PoolError::CapacityExceeded { limit });
                    }
                }
                // Reserve both levels before touching the outer table.
                let mut map = SubscriptionMap::new();
                map.try_reserve(1)?;
                self.topics.try_reserve(1)?;
                map.insert(observer, filter);
                self.topics.insert(topic, map);
            }
        }
        Ok(())
    }

    /// Unsubscribe one observer. Missing topics and observers are fine.
    pub(crate) fn remove_observer<Q>(&mut self, topic: &Q, observer: &O)
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(map) = self.topics.get_mut(topic) else {
            return;
        };
        map.remove(observer);
        if map.is_empty() {
            self.topics.remove(topic);
        }
    }

    pub(crate) fn remove_topic<Q>(&mut self, topic: &Q)
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.topics.remove(topic);
    }

    pub(crate) fn clear(&mut self) {
        self.topics.clear();
    }

    /// Approximate bytes held by the tables, excluding whatever the keys
    /// themselves point to.
    pub(crate) fn memory_footprint(&self) -> usize {
        let outer = self.topics.capacity()
            * (std::mem::size_of::<T>() + std::mem::size_of::<SubscriptionMap<O>>());
        let inner: usize = self
            .topics
            .values()
            .map(|map| {
                map.capacity()
                    * (std::mem::size_of::<O>() + std::mem::size_of::<ChangeFilter>())
            })
            .sum();
        outer + inner
    }

    pub(crate) fn visit_references<'a, B>(
        &'a self,
        visit: &mut impl FnMut(Reference<'a, T, O>) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        for (topic, map) in &self.topics {
            visit(Reference::Topic(topic))?;
            for observer in map.keys() {
                visit(Reference::Observer(observer))?;
            }
        }
        ControlFlow::Continue(())
    }
}
