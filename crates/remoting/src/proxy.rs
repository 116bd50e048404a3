//! # Proxies
//!
//! A `Proxy` stands in for an object owned by the peer. Every method call
//! goes through the owning connection's call path.
//!
//! Clones share one identity. When the last clone drops, the entry leaves the
//! instance registry and a `ReleaseInstance` frame tells the owner how many
//! descriptors for the id this side received.

use std::any::Any;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::de::DeserializeOwned;

use crate::connection::ConnectionInner;
use crate::error::Result;
use crate::registry::ObjectId;
use crate::value::IntoArgs;
use crate::value::Value;

pub(crate) struct ProxyInner {
    id: ObjectId,
    type_name: String,
    interfaces: Vec<String>,
    conn: Arc<ConnectionInner>,
    received: AtomicU64,
}

impl ProxyInner {
    pub(crate) fn note_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let count = self.received.load(Ordering::Relaxed);
        self.conn.release_proxy(&self.id, self as *const ProxyInner, count);
    }
}

/// A handle to an object owned by the peer.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn new(conn: Arc<ConnectionInner>, id: ObjectId, type_name: String, interfaces: Vec<String>) -> Self {
        Self {
            inner: Arc::new(ProxyInner { id, type_name, interfaces, conn, received: AtomicU64::new(1) }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.inner)
    }

    /// Address of the shared state, stable for the proxy's lifetime.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionInner> {
        &self.inner.conn
    }

    pub fn id(&self) -> &ObjectId {
        &self.inner.id
    }

    /// The owner's name for the object's type.
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.inner.type_name == interface || self.inner.interfaces.iter().any(|i| i == interface)
    }

    /// Returns true if both handles refer to the same proxy.
    pub fn ptr_eq(a: &Proxy, b: &Proxy) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Invokes `method` on the remote object.
    pub async fn call(&self, method: &str, args: impl IntoArgs) -> Result<Value> {
        self.inner.conn.invoke(&self.inner.id, method, args.into_args()).await
    }

    /// Invokes `method` and reads the result as `R`.
    pub async fn call_as<R: DeserializeOwned + Clone + Any>(&self, method: &str, args: impl IntoArgs) -> Result<R> {
        self.call(method, args).await?.to::<R>()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.inner.id)
            .field("type_name", &self.inner.type_name)
            .finish()
    }
}
