//! # Cancellation
//!
//! A `CancellationSource` owns the cancelled flag and an optional deadline.
//! Tokens observe it; they never cancel.
//!
//! The source is itself a remote type, so a token can be observed and
//! cancelled from the far side through a `RemoteCancellationToken`. Remote
//! registrations travel as `Callback` objects and are invoked back over the
//! channel.
//!
//! ## Invariants
//! - `cancel()` is idempotent. Every registered callback runs exactly once.
//! - `cancel_after(None)` removes the deadline without cancelling.
//! - Cancellation is cooperative: nothing is interrupted, callers check.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::skeleton::Args;
use crate::skeleton::RemoteType;
use crate::surrogate::SurrogateRegistry;
use crate::value::Value;

/// Wire name of the cancellation source.
pub const SOURCE_TYPE: &str = "CancellationSource";
/// Interface implemented by the cancellation source.
pub const TOKEN_INTERFACE: &str = "ICancellationToken";
/// Wire name of a callback object.
pub const CALLBACK_TYPE: &str = "Callback";

type OnCancel = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SourceState {
    callbacks: Vec<(u64, OnCancel)>,
    next_id: u64,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// The authoritative side of a cancellation.
#[derive(Default)]
pub struct CancellationSource {
    cancelled: AtomicBool,
    state: Mutex<SourceState>,
    notify: Notify,
}

impl CancellationSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A source that cancels itself after `delay`. Must be called inside a tokio runtime.
    pub fn with_deadline(delay: Duration) -> Arc<Self> {
        let source = Self::new();
        source.cancel_after(Some(delay));
        source
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn token(self: &Arc<Self>) -> CancellationToken {
        CancellationToken { source: Some(self.clone()) }
    }

    /// Requests cancellation. Only the first call runs the callbacks.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let callbacks = {
            let mut state = self.lock();
            state.deadline = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.callbacks)
        };
        debug!("cancellation requested, running {} callbacks", callbacks.len());
        for (_, callback) in callbacks {
            callback();
        }
        self.notify.notify_waiters();
    }

    /// Replaces the deadline. `None` disables it without cancelling, and so
    /// does a delay too large to land on a representable instant.
    ///
    /// Arming a deadline spawns a timer, so it needs a tokio runtime; without
    /// one the deadline is still observed by `is_cancellation_requested`.
    pub fn cancel_after(self: &Arc<Self>, delay: Option<Duration>) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.deadline = delay.and_then(|d| Instant::now().checked_add(d));
        let Some(deadline) = state.deadline else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak: Weak<Self> = Arc::downgrade(self);
            state.timer = Some(runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(source) = weak.upgrade() {
                    source.cancel();
                }
            }));
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    pub fn is_cancellation_requested(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let expired = matches!(self.lock().deadline, Some(deadline) if Instant::now() >= deadline);
        if expired {
            self.cancel();
        }
        expired
    }

    /// Runs `callback` on cancellation, or right away if already cancelled.
    pub fn register(self: &Arc<Self>, callback: impl FnOnce() + Send + 'static) -> Registration {
        let mut state = self.lock();
        // checked under the lock: cancel() sets the flag before draining
        if self.cancelled.load(Ordering::SeqCst) {
            drop(state);
            callback();
            return Registration { source: Weak::new(), id: 0 };
        }
        state.next_id += 1;
        let id = state.next_id;
        state.callbacks.push((id, Box::new(callback)));
        Registration { source: Arc::downgrade(self), id }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_cancellation_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Handle to one registered callback.
#[derive(Debug)]
pub struct Registration {
    source: Weak<CancellationSource>,
    id: u64,
}

impl Registration {
    /// Removes the callback if it has not run. Returns true if it was removed.
    pub fn unregister(self) -> bool {
        let Some(source) = self.source.upgrade() else {
            return false;
        };
        let mut state = source.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(id, _)| *id != self.id);
        state.callbacks.len() != before
    }
}

/// The observing side of a cancellation. `none()` never cancels.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    source: Option<Arc<CancellationSource>>,
}

impl CancellationToken {
    pub fn none() -> Self {
        Self { source: None }
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_cancellation_requested())
    }

    pub fn throw_if_cancellation_requested(&self) -> Result<()> {
        if self.is_cancellation_requested() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Registers `callback`. A token with no source ignores it and returns `None`.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Option<Registration> {
        self.source.as_ref().map(|s| s.register(callback))
    }

    /// Resolves once cancellation is requested. Never resolves for `none()`.
    pub async fn cancelled(&self) {
        match &self.source {
            Some(source) => source.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// A callable object that can be handed to the peer.
pub struct Callback {
    f: Box<dyn Fn() + Send + Sync>,
}

impl Callback {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    pub fn invoke(&self) {
        (self.f)()
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

async fn remote_cancel_after(source: Arc<CancellationSource>, args: Args) -> std::result::Result<Value, Fault> {
    let millis: i64 = args.get(0)?;
    let delay = u64::try_from(millis).ok().map(Duration::from_millis);
    source.cancel_after(delay);
    Ok(Value::null())
}

async fn remote_register(source: Arc<CancellationSource>, args: Args) -> std::result::Result<Value, Fault> {
    let callback = args.proxy(0)?;
    let runtime = tokio::runtime::Handle::try_current().ok();
    source.register(move || {
        let Some(runtime) = runtime else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = callback.call("Invoke", ()).await {
                debug!("remote cancellation callback failed: {}", e);
            }
        });
    });
    Ok(Value::null())
}

/// Adds the cancellation source and callback remote types.
pub(crate) fn register_builtins(registry: &mut SurrogateRegistry) {
    registry
        .register_remote(
            RemoteType::<CancellationSource>::new(SOURCE_TYPE)
                .interface(TOKEN_INTERFACE)
                .method_sync("IsCancellationRequested", |source, _| {
                    Ok(Value::new(source.is_cancellation_requested()))
                })
                .method_sync("Cancel", |source, _| {
                    source.cancel();
                    Ok(Value::null())
                })
                .method("CancelAfter", remote_cancel_after)
                .method("Register", remote_register)
                .constructor(|_| Ok(CancellationSource::default())),
        )
        .register_remote(RemoteType::<Callback>::new(CALLBACK_TYPE).method_sync("Invoke", |callback, _| {
            callback.invoke();
            Ok(Value::null())
        }));
}

/// A token observed through a proxy to a far-side `CancellationSource`.
#[derive(Debug, Clone)]
pub struct RemoteCancellationToken {
    proxy: Proxy,
}

impl RemoteCancellationToken {
    pub fn new(proxy: Proxy) -> Result<Self> {
        if !proxy.implements(TOKEN_INTERFACE) {
            return Err(Error::Serialization(format!(
                "{} does not implement {}",
                proxy.type_name(),
                TOKEN_INTERFACE
            )));
        }
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn is_cancellation_requested(&self) -> Result<bool> {
        self.proxy.call_as::<bool>("IsCancellationRequested", ()).await
    }

    pub async fn throw_if_cancellation_requested(&self) -> Result<()> {
        if self.is_cancellation_requested().await? {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        self.proxy.call("Cancel", ()).await?;
        Ok(())
    }

    /// Replaces the far-side deadline. `None` disables it.
    pub async fn cancel_after(&self, delay: Option<Duration>) -> Result<()> {
        let millis = match delay {
            Some(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
            None => -1,
        };
        self.proxy.call("CancelAfter", (millis,)).await?;
        Ok(())
    }

    /// Runs `callback` here when the far side cancels.
    pub async fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.proxy.call("Register", (Callback::new(callback),)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let source = CancellationSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        source.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(source.token().is_cancellation_requested());
        assert!(matches!(source.token().throw_if_cancellation_requested(), Err(Error::Cancelled)));

        let counter = hits.clone();
        source.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_callback_does_not_run() {
        let source = CancellationSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let registration = source.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registration.unregister());
        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.can_be_cancelled());
        assert!(!token.is_cancellation_requested());
        assert!(token.register(|| {}).is_none());
        assert!(token.throw_if_cancellation_requested().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_and_stays() {
        let source = CancellationSource::with_deadline(Duration::from_millis(100));
        let token = source.token();
        assert!(!token.is_cancellation_requested());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(token.is_cancellation_requested());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(token.is_cancellation_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_deadline_does_not_cancel() {
        let source = CancellationSource::with_deadline(Duration::from_millis(100));
        source.cancel_after(None);
        assert!(source.deadline().is_none());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!source.is_cancellation_requested());

        source.cancel_after(Some(Duration::from_millis(10)));
        source.token().cancelled().await;
        assert!(source.is_cancellation_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_delay_means_no_deadline() {
        let source = CancellationSource::with_deadline(Duration::MAX);
        assert!(source.deadline().is_none());

        source.cancel_after(Some(Duration::from_millis(100)));
        assert!(source.deadline().is_some());
        source.cancel_after(Some(Duration::MAX));
        assert!(source.deadline().is_none());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!source.is_cancellation_requested());
    }
}
