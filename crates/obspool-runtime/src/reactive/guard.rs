#![forbid(unsafe_code)]

//! Deferred mutation during dispatch.
//!
//! While a notification is dispatching, structural writes to the pool are
//! captured as [`DeferredTask`]s instead of being applied. The pool owns a
//! single [`DeferredQueue`]; nested dispatches share it through a depth
//! counter and only the outermost [`MutationGuard`] drains it.
//!
//! # Invariants
//!
//! 1. Tasks replay in the order they were queued, regardless of nesting.
//! 2. Replay happens exactly once per outermost activation, on every exit
//!    path (normal return, observer failure, unwinding).
//! 3. A failing task does not stop the drain; the first failure is the one
//!    reported.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::ControlFlow;

use obspool_core::ChangeFilter;
#[cfg(feature = "tracing")]
use obspool_core::{debug, trace, warn};

use super::observer::Observer;
use super::pool::{PoolError, PoolInner};
use super::store::{Reference, TopicStore};

/// A structural mutation captured during dispatch, replayed afterwards.
///
/// Tasks own their arguments: the call that queued them has usually
/// returned long before they run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredTask<T, O> {
    /// Subscribe `observer` to `topic` with `filter`.
    Add {
        topic: T,
        observer: O,
        filter: ChangeFilter,
    },
    /// Unsubscribe `observer` from `topic`.
    RemoveObserver { topic: T, observer: O },
    /// Drop every subscription on `topic`.
    RemoveTopic { topic: T },
    /// Drop everything.
    Clear,
}

impl<T, O> DeferredTask<T, O> {
    /// Short label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::RemoveObserver { .. } => "remove_observer",
            Self::RemoveTopic { .. } => "remove_topic",
            Self::Clear => "clear",
        }
    }
}

impl<T, O> DeferredTask<T, O>
where
    T: Eq + Hash,
    O: Eq + Hash,
{

    pub(crate) fn apply<P: ?Sized>(self, store: &mut TopicStore<T, O>) -> Result<(), PoolError>
    where
        O: Observer<P>,
    {
        match self {
            Self::Add {
                topic,
                observer,
                filter,
            } => store.insert::<P>(topic, observer, filter),
            Self::RemoveObserver { topic, observer } => {
                store.remove_observer(&topic, &observer);
                Ok(())
            }
            Self::RemoveTopic { topic } => {
                store.remove_topic(&topic);
                Ok(())
            }
            Self::Clear => {
                store.clear();
                Ok(())
            }
        }
    }
}

/// Dispatch depth plus the queue shared by every activation.
#[derive(Debug)]
pub(crate) struct DeferredQueue<T, O> {
    depth: usize,
    tasks: VecDeque<DeferredTask<T, O>>,
}

impl<T, O> DeferredQueue<T, O> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            depth: 0,
            tasks: VecDeque::with_capacity(capacity),
        }
    }

    /// Whether a dispatch is in progress, i.e. writes must be deferred.
    pub(crate) fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Queue a task. Ownership moves to the queue.
    pub(crate) fn push(&mut self, task: DeferredTask<T, O>) -> Result<(), PoolError> {
        self.tasks.try_reserve(1)?;
        self.tasks.push_back(task);
        Ok(())
    }

    pub(crate) fn memory_footprint(&self) -> usize {
        self.tasks.capacity() * std::mem::size_of::<DeferredTask<T, O>>()
    }

    pub(crate) fn visit_references<'a, B>(
        &'a self,
        visit: &mut impl FnMut(Reference<'a, T, O>) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        for task in &self.tasks {
            match task {
                DeferredTask::Add {
                    topic, observer, ..
                }
                | DeferredTask::RemoveObserver { topic, observer } => {
                    visit(Reference::Topic(topic))?;
                    visit(Reference::Observer(observer))?;
                }
                DeferredTask::RemoveTopic { topic } => visit(Reference::Topic(topic))?,
                DeferredTask::Clear => {}
            }
        }
        ControlFlow::Continue(())
    }
}

/// RAII activation of the pool's deferral mode.
///
/// Call [`release`](Self::release) to deactivate and collect replay
/// failures. If the guard is dropped without release (an observer
/// panicked), it still deactivates and replays, logging any failure.
pub(crate) struct MutationGuard<'a, T, O, P: ?Sized>
where
    T: Eq + Hash,
    O: Observer<P> + Eq + Hash,
{
    pool: &'a RefCell<PoolInner<T, O>>,
    released: bool,
    _payload: PhantomData<fn(&P)>,
}

impl<'a, T, O, P: ?Sized> MutationGuard<'a, T, O, P>
where
    T: Eq + Hash,
    O: Observer<P> + Eq + Hash,
{
    /// Enter deferral mode. Joins the existing activation if one is live.
    pub(crate) fn activate(pool: &'a RefCell<PoolInner<T, O>>) -> Self {
        pool.borrow_mut().deferred.depth += 1;
        Self {
            pool,
            released: false,
            _payload: PhantomData,
        }
    }

    /// Leave deferral mode. The outermost activation replays the queue.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the replayed tasks.
    pub(crate) fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        deactivate::<T, O, P>(self.pool)
    }
}

impl<T, O, P: ?Sized> Drop for MutationGuard<'_, T, O, P>
where
    T: Eq + Hash,
    O: Observer<P> + Eq + Hash,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Only reachable while unwinding; never panic again here.
        if self.pool.try_borrow_mut().is_err() {
            return;
        }
        if let Err(_err) = deactivate::<T, O, P>(self.pool) {
            #[cfg(feature = "tracing")]
            warn!(error = %_err, "deferred replay failed while unwinding dispatch");
        }
    }
}

fn deactivate<T, O, P: ?Sized>(pool: &RefCell<PoolInner<T, O>>) -> Result<(), PoolError>
where
    T: Eq + Hash,
    O: Observer<P> + Eq + Hash,
{
    let mut inner = pool.borrow_mut();
    let PoolInner { store, deferred } = &mut *inner;

    deferred.depth = deferred.depth.saturating_sub(1);
    if deferred.depth > 0 {
        return Ok(());
    }

    #[cfg(feature = "tracing")]
    let queued = deferred.tasks.len();
    let mut first_error = None;
    while let Some(task) = deferred.tasks.pop_front() {
        #[cfg(feature = "tracing")]
        let name = task.name();
        if let Err(err) = task.apply::<P>(store) {
            #[cfg(feature = "tracing")]
            warn!(task = name, error = %err, "deferred task failed during replay");
            first_error.get_or_insert(err);
        } else {
            #[cfg(feature = "tracing")]
            trace!(task = name, "deferred task applied");
        }
    }

    #[cfg(feature = "tracing")]
    if queued > 0 {
        debug!(queued, failed = first_error.is_some(), "deferred queue drained");
    }

    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::observer::ObserverError;
    use crate::reactive::pool::PoolConfig;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Id(u32);

    impl Observer<()> for Id {
        fn is_valid(&self) -> bool {
            true
        }

        fn invoke(&self, _: &()) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    type Inner = RefCell<PoolInner<&'static str, Id>>;

    fn inner(config: PoolConfig) -> Inner {
        RefCell::new(PoolInner::new(&config))
    }

    fn activate(pool: &Inner) -> MutationGuard<'_, &'static str, Id, ()> {
        MutationGuard::activate(pool)
    }

    fn add(topic: &'static str, id: u32) -> DeferredTask<&'static str, Id> {
        DeferredTask::Add {
            topic,
            observer: Id(id),
            filter: ChangeFilter::ANY,
        }
    }

    #[test]
    fn depth_tracks_nesting() {
        let pool = inner(PoolConfig::default());
        assert!(!pool.borrow().deferred.is_active());

        let outer = activate(&pool);
        let nested = activate(&pool);
        assert_eq!(pool.borrow().deferred.depth(), 2);

        nested.release().unwrap();
        assert_eq!(pool.borrow().deferred.depth(), 1);
        outer.release().unwrap();
        assert!(!pool.borrow().deferred.is_active());
    }

    #[test]
    fn only_outermost_release_replays() {
        let pool = inner(PoolConfig::default());
        let outer = activate(&pool);
        let nested = activate(&pool);

        pool.borrow_mut().deferred.push(add("x", 1)).unwrap();
        nested.release().unwrap();
        assert_eq!(pool.borrow().deferred.len(), 1);
        assert!(!pool.borrow().store.has_topic("x"));

        outer.release().unwrap();
        assert_eq!(pool.borrow().deferred.len(), 0);
        assert!(pool.borrow().store.has_topic("x"));
    }

    #[test]
    fn replay_preserves_queue_order() {
        let pool = inner(PoolConfig::default());
        let guard = activate(&pool);
        {
            let mut p = pool.borrow_mut();
            p.deferred.push(add("x", 1)).unwrap();
            p.deferred.push(DeferredTask::Clear).unwrap();
            p.deferred.push(add("y", 2)).unwrap();
        }
        guard.release().unwrap();

        let p = pool.borrow();
        assert!(!p.store.has_topic("x"));
        assert!(p.store.has_topic("y"));
    }

    #[test]
    fn failed_task_does_not_stop_drain() {
        let pool = inner(PoolConfig::default().with_max_topics(Some(1)));
        let guard = activate(&pool);
        {
            let mut p = pool.borrow_mut();
            p.deferred.push(add("a", 1)).unwrap();
            p.deferred.push(add("b", 2)).unwrap();
            p.deferred.push(add("c", 3)).unwrap();
            p.deferred
                .push(DeferredTask::RemoveObserver {
                    topic: "a",
                    observer: Id(1),
                })
                .unwrap();
        }
        let err = guard.release().unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { limit: 1 }));

        let p = pool.borrow();
        assert_eq!(p.deferred.len(), 0);
        // The removal after both failures still ran.
        assert_eq!(p.store.topic_count(), 0);
    }

    #[test]
    fn dropped_guard_still_replays() {
        let pool = inner(PoolConfig::default());
        {
            let _guard = activate(&pool);
            pool.borrow_mut().deferred.push(add("x", 1)).unwrap();
        }
        let p = pool.borrow();
        assert!(!p.deferred.is_active());
        assert!(p.store.has_topic("x"));
    }

    #[test]
    fn queued_references_are_visited() {
        let mut queue: DeferredQueue<&'static str, Id> = DeferredQueue::with_capacity(4);
        queue.push(add("x", 1)).unwrap();
        queue.push(DeferredTask::RemoveTopic { topic: "y" }).unwrap();
        queue.push(DeferredTask::Clear).unwrap();

        let mut seen = Vec::new();
        let flow: ControlFlow<()> = queue.visit_references(&mut |r| {
            seen.push(match r {
                Reference::Topic(t) => format!("topic:{t}"),
                Reference::Observer(o) => format!("observer:{}", o.0),
            });
            ControlFlow::Continue(())
        });
        assert!(flow.is_continue());
        assert_eq!(seen, ["topic:x", "observer:1", "topic:y"]);
    }

    #[test]
    fn task_names() {
        assert_eq!(add("x", 1).name(), "add");
        assert_eq!(DeferredTask::<&str, Id>::Clear.name(), "clear");
        assert_eq!(
            DeferredTask::<&str, Id>::RemoveTopic { topic: "x" }.name(),
            "remove_topic"
        );
        // Labels need no hashing on the payload types.
        let task = DeferredTask::<f64, f64>::RemoveObserver {
            topic: 1.0,
            observer: 2.0,
        };
        assert_eq!(task.name(), "remove_observer");
    }
}
