//! # Sequential Task Queue
//!
//! Runs boxed futures one at a time, strictly in the order they were added.
//! A single worker task is spawned on the first `add`; completion of one item
//! starts the next.
//!
//! Failures of completed items never vanish: they go to the configured
//! fault handler, or are retained in a bounded `FaultSink` until polled.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

type Job = BoxFuture<'static, Result<()>>;
type FaultHandler = Arc<dyn Fn(Error) + Send + Sync>;

struct SinkState {
    retained: VecDeque<Error>,
    handler: Option<FaultHandler>,
}

/// Destination for faults raised where nobody is waiting.
///
/// With a handler set, every fault is passed to it. Otherwise the most recent
/// `capacity` faults are kept for `take()`.
pub struct FaultSink {
    capacity: usize,
    state: Mutex<SinkState>,
}

impl FaultSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SinkState { retained: VecDeque::new(), handler: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_handler(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        self.lock().handler = Some(Arc::new(handler));
    }

    pub fn report(&self, fault: Error) {
        let handler = {
            let mut state = self.lock();
            match &state.handler {
                Some(handler) => handler.clone(),
                None => {
                    if state.retained.len() == self.capacity {
                        if let Some(dropped) = state.retained.pop_front() {
                            warn!("fault sink full, dropping oldest fault: {}", dropped);
                        }
                    }
                    state.retained.push_back(fault);
                    return;
                }
            }
        };
        handler(fault);
    }

    /// Removes and returns every retained fault, oldest first.
    pub fn take(&self) -> Vec<Error> {
        self.lock().retained.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueueState {
    tx: Option<mpsc::UnboundedSender<Job>>,
    disabled: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    outstanding: watch::Sender<usize>,
    faults: FaultSink,
}

/// A FIFO of async jobs executed one at a time.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_fault_capacity(name, 64)
    }

    pub fn with_fault_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState { tx: None, disabled: false }),
                outstanding,
                faults: FaultSink::new(capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues `work`. Fails only once the queue has been disabled.
    ///
    /// The first call spawns the worker, so it must run inside a tokio runtime.
    pub fn add<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut state = self.lock();
        if state.disabled {
            return Err(Error::Disabled);
        }
        let tx = match &state.tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(Self::worker(self.inner.clone(), rx));
                state.tx = Some(tx.clone());
                tx
            }
        };
        self.inner.outstanding.send_modify(|n| *n += 1);
        if tx.send(Box::pin(work)).is_err() {
            self.inner.outstanding.send_modify(|n| *n -= 1);
            return Err(Error::Disabled);
        }
        Ok(())
    }

    async fn worker(inner: Arc<QueueInner>, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            let outcome = std::panic::AssertUnwindSafe(job).catch_unwind().await;
            let fault = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(Error::Panicked(panic_message(panic.as_ref()))),
            };
            if let Some(fault) = fault {
                debug!("{}: queued item failed: {}", inner.name, fault);
                inner.faults.report(fault);
            }
            inner.outstanding.send_modify(|n| *n -= 1);
        }
        debug!("{}: queue worker stopped", inner.name);
    }

    /// Waits until every added item has completed. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.outstanding.subscribe();
        matches!(tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await, Ok(Ok(_)))
    }

    /// Flushes, then closes the queue for good. Returns whether it drained.
    pub async fn flush_and_disable(&self, timeout: Duration) -> bool {
        let drained = self.flush(timeout).await;
        let mut state = self.lock();
        state.disabled = true;
        // the worker exits once the remaining items run
        state.tx = None;
        drained
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    /// Items added and not yet completed, including the running one.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    pub fn on_fault(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        self.inner.faults.set_handler(handler);
    }

    /// Retained faults from completed items, oldest first.
    pub fn take_faults(&self) -> Vec<Error> {
        self.inner.faults.take()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_items_run_in_order_without_overlap() {
        let queue = TaskQueue::new("ordered");
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(false));

        for i in 1..=3 {
            let log = log.clone();
            let running = running.clone();
            queue
                .add(async move {
                    assert!(!running.swap(true, Ordering::SeqCst), "items overlapped");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().unwrap().push(i);
                    running.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        assert!(queue.flush(Duration::from_millis(50)).await);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.take_faults().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_times_out() {
        let queue = TaskQueue::new("slow");
        queue
            .add(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .unwrap();
        assert!(!queue.flush(Duration::from_millis(50)).await);
        assert_eq!(queue.outstanding(), 1);
        assert!(queue.flush(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_disable_rejects_add() {
        let queue = TaskQueue::new("closing");
        queue.add(async { Ok(()) }).unwrap();
        assert!(queue.flush_and_disable(Duration::from_secs(1)).await);
        assert!(queue.is_disabled());
        assert!(matches!(queue.add(async { Ok(()) }), Err(Error::Disabled)));
    }

    #[tokio::test]
    async fn test_faults_are_retained_then_handled() {
        let queue = TaskQueue::new("faulty");
        queue.add(async { Err(Error::Timeout) }).unwrap();
        queue.add(async { panic!("boom") }).unwrap();
        assert!(queue.flush(Duration::from_secs(1)).await);

        let faults = queue.take_faults();
        assert_eq!(faults.len(), 2);
        assert!(matches!(faults[0], Error::Timeout));
        assert!(matches!(&faults[1], Error::Panicked(msg) if msg == "boom"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue.on_fault(move |e| sink.lock().unwrap().push(e.to_string()));
        queue.add(async { Err(Error::Cancelled) }).unwrap();
        assert!(queue.flush(Duration::from_secs(1)).await);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(queue.take_faults().is_empty());
    }

    #[test]
    fn test_sink_is_bounded() {
        let sink = FaultSink::new(2);
        sink.report(Error::Timeout);
        sink.report(Error::Cancelled);
        sink.report(Error::Disabled);
        let kept = sink.take();
        assert_eq!(kept.len(), 2);
        assert!(matches!(kept[0], Error::Cancelled));
        assert!(sink.is_empty());
    }
}
