//! # Weak Events
//!
//! An event source that forwards firings to local handlers and to far-side
//! subscribers without keeping ordinary subscribers alive.
//!
//! ## Holding
//! - Method subscribers on an object are held weakly. A collected target makes
//!   its entry invalid; it is purged on the next firing.
//! - Closures and proxies have nothing else keeping them alive, so their
//!   entries hold them strongly.
//! - Static handlers have no target at all.
//!
//! ## Firing
//! - `fire` runs subscribers in order, outside the lock, on a snapshot.
//!   Connectivity failures purge the entry. Every other failure is collected
//!   and returned as one `Aggregate` after all subscribers ran.
//! - `fire_queued` enqueues one job on the event's own `TaskQueue`, so
//!   firings are forwarded in order and never overlap. Inside a job the
//!   subscribers run concurrently. Faults nobody awaited are retained and
//!   returned by the next `fire_queued`, or passed to `on_fault`.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::task_queue::TaskQueue;
use crate::value::IntoArgs;

type Target = Option<Arc<dyn Any + Send + Sync>>;
type Invoker<A> = Arc<dyn Fn(Target, A) -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Holder {
    Static,
    Weak(Weak<dyn Any + Send + Sync>),
    Strong(Arc<dyn Any + Send + Sync>),
}

/// Outcome of invoking one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// The target was collected or the entry was removed. Nothing ran.
    Invalid,
}

/// One subscription.
pub struct WeakEventEntry<A> {
    holder: Holder,
    identity: usize,
    method: String,
    invoker: Invoker<A>,
    removed: AtomicBool,
}

fn identity_of<T: ?Sized>(target: &Arc<T>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl<A: Clone + Send + 'static> WeakEventEntry<A> {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_static(&self) -> bool {
        matches!(self.holder, Holder::Static)
    }

    /// True if the method matches and the target is the same object, or the entry is static.
    pub fn matches<T: ?Sized>(&self, target: Option<&Arc<T>>, method: &str) -> bool {
        self.matches_identity(target.map(identity_of), method)
    }

    fn matches_identity(&self, identity: Option<usize>, method: &str) -> bool {
        self.method == method && (self.is_static() || identity == Some(self.identity))
    }

    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Runs the subscriber if its target is still alive.
    pub async fn invoke(&self, args: A) -> Result<Validity> {
        if self.is_removed() {
            return Ok(Validity::Invalid);
        }
        // resolve once and keep the strong handle for the whole call
        let target = match &self.holder {
            Holder::Static => None,
            Holder::Strong(target) => Some(target.clone()),
            Holder::Weak(weak) => match weak.upgrade() {
                Some(target) => Some(target),
                None => return Ok(Validity::Invalid),
            },
        };
        (self.invoker)(target, args).await?;
        Ok(Validity::Valid)
    }
}

impl<A> std::fmt::Debug for WeakEventEntry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let holder = match self.holder {
            Holder::Static => "static",
            Holder::Weak(_) => "weak",
            Holder::Strong(_) => "strong",
        };
        f.debug_struct("WeakEventEntry")
            .field("method", &self.method)
            .field("holder", &holder)
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish()
    }
}

struct EventInner<A> {
    name: String,
    entries: RwLock<Vec<Arc<WeakEventEntry<A>>>>,
    queue: TaskQueue,
}

impl<A: Clone + Send + 'static> EventInner<A> {
    fn snapshot(&self) -> Vec<Arc<WeakEventEntry<A>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn purge(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| !entry.is_removed());
        if entries.len() != before {
            debug!("{}: purged {} subscribers", self.name, before - entries.len());
        }
    }

    /// Sorts one firing's outcomes. Returns the failures to report.
    fn settle(&self, outcomes: Vec<(Arc<WeakEventEntry<A>>, Result<Validity>)>) -> Vec<Error> {
        let mut failures = Vec::new();
        let mut stale = false;
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(Validity::Valid) => {}
                Ok(Validity::Invalid) => {
                    entry.remove();
                    stale = true;
                }
                Err(e) if e.is_connectivity() => {
                    debug!("{}: dropping subscriber {}: {}", self.name, entry.method, e);
                    entry.remove();
                    stale = true;
                }
                Err(e) => failures.push(e),
            }
        }
        if stale {
            self.purge();
        }
        failures
    }
}

fn aggregate(failures: Vec<Error>) -> Result<()> {
    if failures.is_empty() { Ok(()) } else { Err(Error::Aggregate(failures)) }
}

/// An event source with weakly held subscribers.
///
/// Cheap to clone; clones share subscribers and the firing queue.
pub struct WeakEvent<A> {
    inner: Arc<EventInner<A>>,
}

impl<A> Clone for WeakEvent<A> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<A: Clone + Send + 'static> WeakEvent<A> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_fault_capacity(name, 64)
    }

    /// Like `new`, retaining at most `capacity` unobserved faults from queued firings.
    pub fn with_fault_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(EventInner {
                queue: TaskQueue::with_fault_capacity(format!("{}-queue", name), capacity),
                name,
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    fn push(&self, entry: WeakEventEntry<A>) -> Arc<WeakEventEntry<A>> {
        let entry = Arc::new(entry);
        self.inner.entries.write().unwrap_or_else(|e| e.into_inner()).push(entry.clone());
        entry
    }

    /// Subscribes `handler` on `target` without keeping `target` alive.
    pub fn subscribe<T, F, Fut>(&self, target: &Arc<T>, method: impl Into<String>, handler: F) -> Arc<WeakEventEntry<A>>
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        let invoker: Invoker<A> = Arc::new(move |target: Target, args: A| {
            match target.and_then(|t| t.downcast::<T>().ok()) {
                Some(target) => handler(target, args).boxed(),
                None => futures::future::ready(Err(Error::InvalidTarget("subscriber has another type".into()))).boxed(),
            }
        });
        self.push(WeakEventEntry {
            holder: Holder::Weak(weak),
            identity: identity_of(target),
            method: method.into(),
            invoker,
            removed: AtomicBool::new(false),
        })
    }

    /// Subscribes a handler with no target. It lives as long as the event.
    pub fn subscribe_static<F, Fut>(&self, method: impl Into<String>, handler: F) -> Arc<WeakEventEntry<A>>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let invoker: Invoker<A> = Arc::new(move |_, args: A| handler(args).boxed());
        self.push(WeakEventEntry {
            holder: Holder::Static,
            identity: 0,
            method: method.into(),
            invoker,
            removed: AtomicBool::new(false),
        })
    }

    /// Subscribes a closure. The entry owns the closure and its captures.
    pub fn subscribe_closure<F, Fut>(&self, handler: F) -> Arc<WeakEventEntry<A>>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let state = Arc::new(handler);
        let identity = identity_of(&state);
        let invoker: Invoker<A> = Arc::new(move |target: Target, args: A| {
            match target.and_then(|t| t.downcast::<F>().ok()) {
                Some(handler) => (*handler)(args).boxed(),
                None => futures::future::ready(Err(Error::InvalidTarget("closure state lost".into()))).boxed(),
            }
        });
        self.push(WeakEventEntry {
            holder: Holder::Strong(state),
            identity,
            method: "closure".into(),
            invoker,
            removed: AtomicBool::new(false),
        })
    }

    /// Unsubscribes every entry for `method` on `target`, plus static entries for `method`.
    pub fn unsubscribe<T: ?Sized>(&self, target: &Arc<T>, method: &str) -> usize {
        self.remove_where(|entry| entry.matches(Some(target), method))
    }

    pub fn unsubscribe_static(&self, method: &str) -> usize {
        self.remove_where(|entry| entry.is_static() && entry.method == method)
    }

    pub fn unsubscribe_entry(&self, entry: &Arc<WeakEventEntry<A>>) -> bool {
        self.remove_where(|e| std::ptr::eq(e, Arc::as_ptr(entry))) > 0
    }

    fn remove_where(&self, pred: impl Fn(&WeakEventEntry<A>) -> bool) -> usize {
        let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| {
            if pred(entry) {
                entry.remove();
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    /// Live, not yet purged entries.
    pub fn subscriber_count(&self) -> usize {
        self.inner.snapshot().iter().filter(|e| !e.is_removed()).count()
    }

    /// Invokes every subscriber in subscription order and waits for all of them.
    pub async fn fire(&self, args: A) -> Result<()> {
        let snapshot = self.inner.snapshot();
        let mut outcomes = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            let outcome = entry.invoke(args.clone()).await;
            outcomes.push((entry, outcome));
        }
        aggregate(self.inner.settle(outcomes))
    }

    /// Queues one forwarding job for this firing and returns immediately.
    ///
    /// Returns faults retained from earlier jobs, if any, as an `Aggregate`.
    pub fn fire_queued(&self, args: A) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.queue.add(async move {
            let snapshot = inner.snapshot();
            let pending: Vec<_> = snapshot.iter().map(|entry| entry.invoke(args.clone())).collect();
            let results = join_all(pending).await;
            let outcomes = snapshot.into_iter().zip(results).collect();
            aggregate(inner.settle(outcomes))
        })?;
        aggregate(self.inner.queue.take_faults())
    }

    /// Waits for queued firings to finish. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.inner.queue.flush(timeout).await
    }

    /// Faults from queued firings that nobody observed yet.
    pub fn take_faults(&self) -> Vec<Error> {
        self.inner.queue.take_faults()
    }

    /// Routes faults from queued firings to `handler` instead of retaining them.
    pub fn on_fault(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        self.inner.queue.on_fault(handler);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<A: IntoArgs + Clone + Send + 'static> WeakEvent<A> {
    /// Forwards each firing to `method` on a far-side object.
    ///
    /// The entry holds the proxy strongly; a broken channel or a released
    /// object purges it.
    pub fn subscribe_remote(&self, proxy: Proxy, method: impl Into<String>) -> Arc<WeakEventEntry<A>> {
        let method = method.into();
        let identity = proxy.identity();
        let name = method.clone();
        let invoker: Invoker<A> = Arc::new(move |target: Target, args: A| {
            let name = name.clone();
            async move {
                let proxy = target
                    .and_then(|t| t.downcast::<Proxy>().ok())
                    .ok_or_else(|| Error::InvalidTarget("proxy lost".into()))?;
                proxy.call(&name, args).await?;
                Ok(())
            }
            .boxed()
        });
        self.push(WeakEventEntry {
            holder: Holder::Strong(Arc::new(proxy)),
            identity,
            method,
            invoker,
            removed: AtomicBool::new(false),
        })
    }

    pub fn unsubscribe_remote(&self, proxy: &Proxy, method: &str) -> usize {
        let identity = proxy.identity();
        self.remove_where(|entry| !entry.is_static() && entry.matches_identity(Some(identity), method))
    }
}

impl<A> std::fmt::Debug for WeakEvent<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakEvent").field("name", &self.inner.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use crate::error::Fault;
    use crate::error::FaultKind;

    struct Listener {
        hits: AtomicUsize,
    }

    fn listener() -> Arc<Listener> {
        Arc::new(Listener { hits: AtomicUsize::new(0) })
    }

    fn on_tick(event: &WeakEvent<i32>, target: &Arc<Listener>) -> Arc<WeakEventEntry<i32>> {
        event.subscribe(target, "OnTick", |l: Arc<Listener>, _| async move {
            l.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_collected_subscriber_is_invalid() -> Result<()> {
        let event = WeakEvent::<i32>::new("tick");
        let target = listener();
        let entry = on_tick(&event, &target);
        assert_eq!(entry.invoke(1).await?, Validity::Valid);
        assert_eq!(target.hits.load(Ordering::SeqCst), 1);

        drop(target);
        assert_eq!(entry.invoke(2).await?, Validity::Invalid);
        event.fire(3).await?;
        assert_eq!(event.subscriber_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_weak_entry_does_not_keep_target() {
        let event = WeakEvent::<i32>::new("tick");
        let target = listener();
        let _entry = on_tick(&event, &target);
        assert_eq!(Arc::strong_count(&target), 1);
    }

    #[tokio::test]
    async fn test_connectivity_failure_purges_and_others_aggregate() {
        let event = WeakEvent::<i32>::new("tick");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = calls.clone();
        event.subscribe_closure(move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("A");
                Ok(())
            }
        });
        let log = calls.clone();
        event.subscribe_closure(move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("B");
                Err(Error::Connectivity("gone".into()))
            }
        });
        let log = calls.clone();
        event.subscribe_closure(move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("C");
                Ok(())
            }
        });

        assert!(event.fire(1).await.is_ok());
        assert_eq!(*calls.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(event.subscriber_count(), 2);

        event.subscribe_static("Fail", |_| async { Err(Error::Timeout) });
        calls.lock().unwrap().clear();
        match event.fire(2).await {
            Err(Error::Aggregate(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], Error::Timeout));
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
        assert_eq!(*calls.lock().unwrap(), vec!["A", "C"]);
        assert_eq!(event.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_matches_target_and_method() {
        let event = WeakEvent::<i32>::new("tick");
        let a = listener();
        let b = listener();
        let entry = on_tick(&event, &a);
        on_tick(&event, &b);

        assert!(entry.matches(Some(&a), "OnTick"));
        assert!(!entry.matches(Some(&b), "OnTick"));
        assert!(!entry.matches(Some(&a), "OnTock"));

        assert_eq!(event.unsubscribe(&a, "OnTick"), 1);
        assert!(entry.is_removed());
        assert_eq!(event.subscriber_count(), 1);

        let stat = event.subscribe_static("OnTick", |_| async { Ok(()) });
        assert!(stat.matches(Some(&a), "OnTick"));
        assert!(stat.matches::<Listener>(None, "OnTick"));
        assert_eq!(event.unsubscribe_static("OnTick"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_entry_removes_only_that_entry() {
        let event = WeakEvent::<i32>::new("tick");
        let a = listener();
        let first = on_tick(&event, &a);
        let second = on_tick(&event, &a);

        assert!(event.unsubscribe_entry(&first));
        assert!(first.is_removed());
        assert!(!second.is_removed());
        assert!(!event.unsubscribe_entry(&first));

        event.fire(1).await.unwrap();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(event.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_target_is_reported_not_purged() {
        let event = WeakEvent::<i32>::new("tick");
        event.subscribe_static("Gone", |_| async {
            Err(Error::Remote(Fault::new(FaultKind::InstanceNotFound, "Listener", "no such object")))
        });
        event.subscribe_static("Typo", |_| async { Err(Error::InvalidTarget("empty method name".into())) });

        match event.fire(1).await {
            Err(Error::Aggregate(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], Error::InvalidTarget(_)));
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
        assert_eq!(event.subscriber_count(), 1);
        assert!(event.fire(2).await.is_err());
    }

    #[tokio::test]
    async fn test_queued_firings_are_ordered() {
        let event = WeakEvent::<i32>::new("tick");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        event.subscribe_closure(move |n| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis((5 - n) as u64)).await;
                log.lock().unwrap().push(n);
                Ok(())
            }
        });

        for n in 0..5 {
            event.fire_queued(n).unwrap();
        }
        assert!(event.flush(Duration::from_secs(1)).await);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queued_faults_surface_on_next_fire() {
        let event = WeakEvent::<i32>::new("tick");
        event.subscribe_static("Fail", |_| async { Err(Error::Timeout) });

        assert!(event.fire_queued(1).is_ok());
        assert!(event.flush(Duration::from_secs(1)).await);
        match event.fire_queued(2) {
            Err(Error::Aggregate(faults)) => assert_eq!(faults.len(), 1),
            other => panic!("expected retained fault, got {:?}", other),
        }
        assert!(event.flush(Duration::from_secs(1)).await);
        assert_eq!(event.take_faults().len(), 1);
    }
}
