#![forbid(unsafe_code)]

//! Topic/observer registry with re-entrant-safe dispatch.
//!
//! # Design
//!
//! [`ObserverPool`] maps topics to subscription maps (observer → filter).
//! It is a cheap, cloneable handle over `Rc<RefCell<..>>` so observers can
//! capture it and call back into it while a notification is running.
//!
//! During [`notify`](ObserverPool::notify) the pool dispatches over a
//! snapshot of the topic's subscriptions and enters deferral mode: `add`,
//! `remove_*` and `clear` are queued as [`DeferredTask`]s and replayed, in
//! order, once the outermost dispatch returns.
//!
//! # Performance
//!
//! | Operation          | Complexity                           |
//! |--------------------|--------------------------------------|
//! | `has_*`            | O(1)                                 |
//! | `add` / `remove_*` | O(1) amortized                       |
//! | `notify` (miss)    | O(1), no allocation                  |
//! | `notify` (hit)     | O(S) where S = subscribers on topic  |
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Observer error | `invoke` returned `Err` | Rest of pass skipped; queue still replayed; error returned |
//! | Allocation | `try_reserve` failed | Call fails; no partial insert |
//! | Topic limit | `max_topics` reached | `CapacityExceeded`; state unchanged |
//! | Dead observer | `is_valid()` false | Not invoked; pruned after the pass; not an error |
//! | Re-entrant `is_valid` | `is_valid` calls back into the pool | Panics (`RefCell` borrow rules) |

use std::cell::RefCell;
use std::collections::TryReserveError;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::rc::Rc;

use obspool_core::ChangeFilter;
#[cfg(feature = "tracing")]
use obspool_core::{debug, trace};

use super::guard::{DeferredQueue, DeferredTask, MutationGuard};
use super::observer::{CallbackRef, Observer, ObserverError};
use super::store::{Reference, TopicStore};

/// Errors reported by pool operations.
#[derive(Debug)]
pub enum PoolError {
    /// An observer reported failure; the dispatch pass was aborted.
    Observer(ObserverError),
    /// Growing a table or the deferred queue failed.
    Allocation(TryReserveError),
    /// Adding a new topic would exceed [`PoolConfig::max_topics`].
    CapacityExceeded { limit: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observer(err) => write!(f, "{err}"),
            Self::Allocation(err) => write!(f, "allocation failed: {err}"),
            Self::CapacityExceeded { limit } => {
                write!(f, "topic limit of {limit} reached")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Observer(err) => Some(err),
            Self::Allocation(err) => Some(err),
            Self::CapacityExceeded { .. } => None,
        }
    }
}

impl From<TryReserveError> for PoolError {
    fn from(err: TryReserveError) -> Self {
        Self::Allocation(err)
    }
}

impl From<ObserverError> for PoolError {
    fn from(err: ObserverError) -> Self {
        Self::Observer(err)
    }
}

/// Lets observers use `?` on pool calls. A nested observer failure is passed
/// through unchanged; anything else becomes the source of a new error.
impl From<PoolError> for ObserverError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Observer(inner) => inner,
            other => ObserverError::with_source("pool operation failed", other),
        }
    }
}

/// Pool sizing and limits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolConfig {
    /// Initial capacity of the topic table.
    pub topic_capacity: usize,
    /// Initial capacity of the deferred-task queue.
    pub task_capacity: usize,
    /// Maximum number of distinct topics; `None` is unbounded.
    pub max_topics: Option<usize>,
}

impl PoolConfig {
    /// Set the initial topic table capacity.
    #[must_use]
    pub fn with_topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity;
        self
    }

    /// Set the initial deferred queue capacity.
    #[must_use]
    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    /// Bound the number of distinct topics.
    #[must_use]
    pub fn with_max_topics(mut self, limit: Option<usize>) -> Self {
        self.max_topics = limit;
        self
    }
}

/// Shared interior of an [`ObserverPool`].
#[derive(Debug)]
pub(crate) struct PoolInner<T, O> {
    pub(crate) store: TopicStore<T, O>,
    pub(crate) deferred: DeferredQueue<T, O>,
}

impl<T, O> PoolInner<T, O>
where
    T: Eq + Hash,
    O: Eq + Hash,
{
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            store: TopicStore::with_capacity(config.topic_capacity, config.max_topics),
            deferred: DeferredQueue::with_capacity(config.task_capacity),
        }
    }
}

/// Registry routing change notifications from topics to observers.
///
/// Cloning a pool creates a new handle to the **same** registry.
///
/// # Invariants
///
/// 1. A missing topic and a topic with no observers are indistinguishable.
/// 2. Every observer subscribed when a dispatch pass starts is visited at
///    most once in that pass; observers added during the pass are not.
/// 3. Writes issued during dispatch apply after the outermost pass, in
///    issue order.
pub struct ObserverPool<T, O, P: ?Sized> {
    inner: Rc<RefCell<PoolInner<T, O>>>,
    _payload: PhantomData<fn(&P)>,
}

/// Pool of weak closure handles.
pub type CallbackPool<T, P> = ObserverPool<T, CallbackRef<P>, P>;

// Manual Clone: shares the same Rc.
impl<T, O, P: ?Sized> Clone for ObserverPool<T, O, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            _payload: PhantomData,
        }
    }
}

impl<T, O, P: ?Sized> fmt::Debug for ObserverPool<T, O, P>
where
    T: Eq + Hash,
    O: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ObserverPool")
            .field("topics", &inner.store.topic_count())
            .field("dispatch_depth", &inner.deferred.depth())
            .field("pending_tasks", &inner.deferred.len())
            .finish()
    }
}

impl<T, O, P> Default for ObserverPool<T, O, P>
where
    T: Eq + Hash + Clone,
    O: Observer<P> + Eq + Hash + Clone,
    P: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, O, P> ObserverPool<T, O, P>
where
    T: Eq + Hash + Clone,
    O: Observer<P> + Eq + Hash + Clone,
    P: ?Sized,
{
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create an empty pool with explicit sizing and limits.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner::new(&config))),
            _payload: PhantomData,
        }
    }

    /// Whether `topic` has at least one observer.
    #[must_use]
    pub fn has_topic<Q>(&self, topic: &Q) -> bool
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.borrow().store.has_topic(topic)
    }

    /// Whether `observer` is subscribed to `topic` with any filter.
    #[must_use]
    pub fn has_observer<Q>(&self, topic: &Q, observer: &O) -> bool
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.has_observer_with(topic, observer, ChangeFilter::ANY)
    }

    /// Whether `observer` is subscribed to `topic` with a filter sharing a
    /// bit with `filter`.
    #[must_use]
    pub fn has_observer_with<Q>(&self, topic: &Q, observer: &O, filter: ChangeFilter) -> bool
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.borrow().store.has_observer(topic, observer, filter)
    }

    /// Subscribe `observer` to `topic`.
    ///
    /// Re-adding an observer overwrites its filter. Adding an invalid
    /// observer succeeds and stores nothing. During dispatch the add is
    /// deferred until the outermost pass returns.
    ///
    /// # Errors
    ///
    /// [`PoolError::Allocation`] or [`PoolError::CapacityExceeded`]; the pool
    /// is left unchanged.
    pub fn add(&self, topic: T, observer: O, filter: ChangeFilter) -> Result<(), PoolError> {
        let mut inner = self.inner.borrow_mut();
        if inner.deferred.is_active() {
            return defer(
                &mut inner.deferred,
                DeferredTask::Add {
                    topic,
                    observer,
                    filter,
                },
            );
        }
        inner.store.insert::<P>(topic, observer, filter)
    }

    /// Unsubscribe `observer` from `topic`. Unknown pairs are a no-op.
    ///
    /// # Errors
    ///
    /// [`PoolError::Allocation`] if the removal had to be deferred and the
    /// queue could not grow.
    pub fn remove_observer<Q>(&self, topic: &Q, observer: &O) -> Result<(), PoolError>
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.deferred.is_active() {
            return defer(
                &mut inner.deferred,
                DeferredTask::RemoveObserver {
                    topic: topic.to_owned(),
                    observer: observer.clone(),
                },
            );
        }
        inner.store.remove_observer(topic, observer);
        Ok(())
    }

    /// Drop every subscription on `topic`. Unknown topics are a no-op.
    ///
    /// # Errors
    ///
    /// [`PoolError::Allocation`] if the removal had to be deferred and the
    /// queue could not grow.
    pub fn remove_topic<Q>(&self, topic: &Q) -> Result<(), PoolError>
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.deferred.is_active() {
            return defer(
                &mut inner.deferred,
                DeferredTask::RemoveTopic {
                    topic: topic.to_owned(),
                },
            );
        }
        inner.store.remove_topic(topic);
        Ok(())
    }

    /// Drop every topic and subscription.
    ///
    /// # Errors
    ///
    /// [`PoolError::Allocation`] if the clear had to be deferred and the
    /// queue could not grow.
    pub fn clear(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.borrow_mut();
        if inner.deferred.is_active() {
            return defer(&mut inner.deferred, DeferredTask::Clear);
        }
        inner.store.clear();
        Ok(())
    }

    /// Deliver `payload` to every observer on `topic`.
    ///
    /// # Errors
    ///
    /// See [`notify_with`](Self::notify_with).
    pub fn notify<Q>(&self, topic: &Q, payload: &P) -> Result<(), PoolError>
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.notify_with(topic, payload, ChangeFilter::ANY)
    }

    /// Deliver `payload` to every observer on `topic` whose filter shares a
    /// bit with `filter`.
    ///
    /// Invalid observers met during the pass are skipped and pruned once it
    /// ends. Writes made by observers are deferred until the outermost
    /// dispatch returns.
    ///
    /// # Errors
    ///
    /// The first observer failure aborts the rest of the pass and is
    /// returned after the deferred queue has been replayed. Otherwise the
    /// first replay failure, if any, is returned.
    pub fn notify_with<Q>(&self, topic: &Q, payload: &P, filter: ChangeFilter) -> Result<(), PoolError>
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (key, snapshot) = {
            let inner = self.inner.borrow();
            let Some((key, map)) = inner.store.get_key_value(topic) else {
                return Ok(());
            };
            let snapshot: Vec<(O, ChangeFilter)> = map
                .iter()
                .map(|(observer, stored)| (observer.clone(), *stored))
                .collect();
            (key.clone(), snapshot)
        };

        #[cfg(feature = "tracing")]
        trace!(
            subscribers = snapshot.len(),
            filter = filter.bits(),
            "dispatch pass started"
        );

        let guard = MutationGuard::<T, O, P>::activate(&self.inner);
        let dispatched = self.dispatch(key, snapshot, payload, filter);
        let replayed = guard.release();
        dispatched.and(replayed)
    }

    fn dispatch(
        &self,
        topic: T,
        snapshot: Vec<(O, ChangeFilter)>,
        payload: &P,
        filter: ChangeFilter,
    ) -> Result<(), PoolError> {
        for (observer, stored) in snapshot {
            if !observer.is_valid() {
                #[cfg(feature = "tracing")]
                debug!("pruning invalid observer");
                let task = DeferredTask::RemoveObserver {
                    topic: topic.clone(),
                    observer,
                };
                defer(&mut self.inner.borrow_mut().deferred, task)?;
                continue;
            }
            if stored.matches(filter) {
                observer.invoke(payload)?;
            }
        }
        Ok(())
    }

    /// Number of topics with at least one observer.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.borrow().store.topic_count()
    }

    /// Number of observers subscribed to `topic`, including invalid ones not
    /// yet pruned.
    #[must_use]
    pub fn observer_count<Q>(&self, topic: &Q) -> usize
    where
        T: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.borrow().store.observer_count(topic)
    }

    /// Whether the pool holds no topics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topic_count() == 0
    }

    /// Whether a dispatch pass is in progress.
    #[must_use]
    pub fn is_dispatching(&self) -> bool {
        self.inner.borrow().deferred.is_active()
    }

    /// Number of writes waiting for the current dispatch to finish.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.borrow().deferred.len()
    }

    /// Approximate bytes held by the pool's own tables and queue.
    ///
    /// Heap data owned by topics and observers is not included.
    #[must_use]
    pub fn memory_footprint(&self) -> usize {
        let inner = self.inner.borrow();
        std::mem::size_of::<PoolInner<T, O>>()
            + inner.store.memory_footprint()
            + inner.deferred.memory_footprint()
    }

    /// Visit every topic and observer the pool holds, both subscribed and
    /// queued for replay. Stops at the first `Break`.
    ///
    /// # Panics
    ///
    /// Panics if `visit` mutates this pool.
    pub fn visit_references<B>(
        &self,
        mut visit: impl FnMut(Reference<'_, T, O>) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let inner = self.inner.borrow();
        inner.store.visit_references(&mut visit)?;
        inner.deferred.visit_references(&mut visit)
    }
}

fn defer<T, O>(queue: &mut DeferredQueue<T, O>, task: DeferredTask<T, O>) -> Result<(), PoolError>
where
    T: Eq + Hash,
    O: Eq + Hash,
{
    #[cfg(feature = "tracing")]
    trace!(task = task.name(), depth = queue.depth(), "write deferred");
    queue.push(task)
}
