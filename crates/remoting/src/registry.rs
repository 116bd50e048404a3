//! # Instance Registry
//!
//! Maps objects to `ObjectId`s for one connection.
//!
//! ## Ownership
//!
//! - **Local** entries hold the object strongly. They count how many times
//!   the object was sent as a `RemoteObject`; the peer's release frames
//!   subtract from that count and the entry goes away at zero.
//! - **Remote** entries hold the proxy weakly. Dropping the last clone of the
//!   proxy removes the entry and tells the owner how many descriptors it had
//!   received.
//!
//! ## Invariants
//! - One id per local object (pointer identity) and one proxy per remote id.
//! - A single mutex guards every table. Removed objects are dropped after the
//!   lock is released, since their destructors may re-enter the registry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tracing::debug;
use uuid::Uuid;

use crate::descriptor::ReferenceDescriptor;
use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::proxy::ProxyInner;
use crate::value::Value;

/// Names an object across the channel. Minted by the owner, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::InvalidTarget("empty object id".into()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Local,
    Remote,
}

enum Held {
    Local(Arc<dyn Any + Send + Sync>),
    Remote(Weak<ProxyInner>),
}

struct Entry {
    type_name: String,
    interfaces: Vec<String>,
    held: Held,
    exported: u64,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<ObjectId, Entry>,
    by_address: HashMap<usize, ObjectId>,
}

fn address_of(object: &Arc<dyn Any + Send + Sync>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

#[derive(Default)]
pub struct InstanceRegistry {
    tables: Mutex<Tables>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the id of a local object, registering it first if needed.
    pub fn register_local_object(
        &self,
        object: &Arc<dyn Any + Send + Sync>,
        type_name: &str,
        interfaces: &[String],
    ) -> ObjectId {
        let mut tables = self.lock();
        Self::register_locked(&mut tables, object, type_name, interfaces)
    }

    fn register_locked(
        tables: &mut Tables,
        object: &Arc<dyn Any + Send + Sync>,
        type_name: &str,
        interfaces: &[String],
    ) -> ObjectId {
        let address = address_of(object);
        if let Some(id) = tables.by_address.get(&address) {
            return id.clone();
        }
        let id = ObjectId::mint();
        tables.entries.insert(id.clone(), Entry {
            type_name: type_name.to_string(),
            interfaces: interfaces.to_vec(),
            held: Held::Local(object.clone()),
            exported: 0,
        });
        tables.by_address.insert(address, id.clone());
        id
    }

    /// Counts one more `RemoteObject` descriptor sent for `id`.
    pub fn mark_exported(&self, id: &ObjectId) -> bool {
        match self.lock().entries.get_mut(id) {
            Some(entry) => {
                entry.exported += 1;
                true
            }
            None => false,
        }
    }

    /// Starts counting the exports of one outbound frame.
    pub(crate) fn pending_exports(&self) -> PendingExports<'_> {
        PendingExports { registry: self, taken: Vec::new() }
    }

    /// Registers and counts in one step. Also reports whether the entry is new.
    fn export_counted(
        &self,
        object: &Arc<dyn Any + Send + Sync>,
        type_name: &str,
        interfaces: &[String],
    ) -> (ObjectId, bool) {
        let mut tables = self.lock();
        let created = !tables.by_address.contains_key(&address_of(object));
        let id = Self::register_locked(&mut tables, object, type_name, interfaces);
        if let Some(entry) = tables.entries.get_mut(&id) {
            entry.exported += 1;
        }
        (id, created)
    }

    /// Takes back one count from an export that never left.
    fn unexport(&self, id: &ObjectId, created: bool) {
        let removed = {
            let mut tables = self.lock();
            let Some(entry) = tables.entries.get_mut(id) else {
                return;
            };
            entry.exported = entry.exported.saturating_sub(1);
            if !created || entry.exported > 0 {
                return;
            }
            let removed = tables.entries.remove(id);
            if let Some(Entry { held: Held::Local(object), .. }) = &removed {
                tables.by_address.remove(&address_of(object));
            }
            removed
        };
        drop(removed);
    }

    /// Applies a peer's release of `count` descriptors. Returns true if the entry was removed.
    pub fn release(&self, id: &str, count: u64) -> bool {
        let removed = {
            let mut tables = self.lock();
            let Some(entry) = tables.entries.get_mut(id) else {
                debug!("release for unknown object {}", id);
                return false;
            };
            if !matches!(entry.held, Held::Local(_)) {
                return false;
            }
            entry.exported = entry.exported.saturating_sub(count);
            if entry.exported > 0 {
                return false;
            }
            let removed = tables.entries.remove(id);
            if let Some(Entry { held: Held::Local(object), .. }) = &removed {
                tables.by_address.remove(&address_of(object));
            }
            removed
        };
        // dropped here, outside the lock
        removed.is_some()
    }

    /// Looks up a locally owned object for dispatch.
    pub fn resolve_local(&self, id: &str) -> Option<(Arc<dyn Any + Send + Sync>, String)> {
        let tables = self.lock();
        match tables.entries.get(id) {
            Some(Entry { held: Held::Local(object), type_name, .. }) => Some((object.clone(), type_name.clone())),
            _ => None,
        }
    }

    /// Resolves a `RemoteObject` descriptor to the one proxy for its id,
    /// creating it with `make` when no live proxy exists.
    ///
    /// An id that names a local object resolves to that object.
    pub(crate) fn resolve_or_create_proxy(
        &self,
        desc: &ReferenceDescriptor,
        make: impl FnOnce(ObjectId) -> Proxy,
    ) -> Result<Value> {
        let id = ObjectId::parse(&desc.object_id).map_err(|_| Error::Protocol("descriptor without object id".into()))?;

        let mut tables = self.lock();
        match tables.entries.get(&id) {
            Some(Entry { held: Held::Local(object), type_name, .. }) => {
                return Ok(Value::from_object(object.clone(), type_name.clone()));
            }
            Some(Entry { held: Held::Remote(weak), .. }) => {
                if let Some(inner) = weak.upgrade() {
                    inner.note_received();
                    let proxy = Proxy::from_inner(inner);
                    drop(tables);
                    return Ok(Value::new(proxy));
                }
            }
            None => {}
        }

        let proxy = make(id.clone());
        tables.entries.insert(id, Entry {
            type_name: desc.assembly_qualified_name.clone(),
            interfaces: desc.interfaces.clone(),
            held: Held::Remote(proxy.downgrade()),
            exported: 0,
        });
        drop(tables);
        Ok(Value::new(proxy))
    }

    /// Removes a remote entry if it still belongs to the dying proxy.
    pub(crate) fn forget_proxy(&self, id: &ObjectId, dying: *const ProxyInner) -> bool {
        let mut tables = self.lock();
        let owned = matches!(
            tables.entries.get(id),
            Some(Entry { held: Held::Remote(weak), .. }) if Weak::as_ptr(weak) == dying
        );
        if owned {
            tables.entries.remove(id);
        }
        owned
    }

    /// Drops every entry. Used when the channel closes.
    pub fn clear(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut tables = self.lock();
            tables.by_address.clear();
            tables.entries.drain().map(|(_, entry)| entry).collect()
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn ownership(&self, id: &str) -> Option<Ownership> {
        self.lock().entries.get(id).map(|entry| match entry.held {
            Held::Local(_) => Ownership::Local,
            Held::Remote(_) => Ownership::Remote,
        })
    }

    /// Number of outstanding descriptors the peer has not released.
    pub fn exported_count(&self, id: &str) -> Option<u64> {
        self.lock().entries.get(id).map(|entry| entry.exported)
    }

    pub fn interfaces(&self, id: &str) -> Option<Vec<String>> {
        self.lock().entries.get(id).map(|entry| entry.interfaces.clone())
    }
}

/// Export counts taken while one outbound frame is built.
///
/// Dropping the guard without `commit` gives every count back and removes
/// entries that this frame registered, so a frame that fails to build or
/// send leaves the registry as it found it.
pub(crate) struct PendingExports<'r> {
    registry: &'r InstanceRegistry,
    taken: Vec<(ObjectId, bool)>,
}

impl PendingExports<'_> {
    pub fn export(&mut self, object: &Arc<dyn Any + Send + Sync>, type_name: &str, interfaces: &[String]) -> ObjectId {
        let (id, created) = self.registry.export_counted(object, type_name, interfaces);
        self.taken.push((id.clone(), created));
        id
    }

    /// The frame went out; the peer now holds these counts.
    pub fn commit(mut self) {
        self.taken.clear();
    }
}

impl Drop for PendingExports<'_> {
    fn drop(&mut self) {
        // newest first, so the export that created an entry is undone last
        for (id, created) in self.taken.drain(..).rev() {
            self.registry.unexport(&id, created);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Engine;

    fn object() -> Arc<dyn Any + Send + Sync> {
        Arc::new(Engine)
    }

    #[test]
    fn test_register_is_idempotent_by_identity() {
        let registry = InstanceRegistry::new();
        let a = object();
        let b = object();

        let id_a = registry.register_local_object(&a, "Engine", &[]);
        assert_eq!(registry.register_local_object(&a.clone(), "Engine", &[]), id_a);
        let id_b = registry.register_local_object(&b, "Engine", &[]);
        assert_ne!(id_a, id_b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ownership(id_a.as_str()), Some(Ownership::Local));
    }

    #[test]
    fn test_release_counts_down_to_removal() {
        let registry = InstanceRegistry::new();
        let engine = object();
        let mut exports = registry.pending_exports();
        let id = exports.export(&engine, "Engine", &["IEngine".to_string()]);
        exports.export(&engine, "Engine", &[]);
        exports.commit();
        assert_eq!(registry.exported_count(id.as_str()), Some(2));

        assert!(!registry.release(id.as_str(), 1));
        assert!(registry.resolve_local(id.as_str()).is_some());
        assert!(registry.release(id.as_str(), 1));
        assert!(registry.resolve_local(id.as_str()).is_none());

        // a later export mints a fresh id
        let mut exports = registry.pending_exports();
        let again = exports.export(&engine, "Engine", &[]);
        exports.commit();
        assert_ne!(again, id);
    }

    #[test]
    fn test_uncommitted_exports_are_given_back() {
        let registry = InstanceRegistry::new();
        let published = object();
        let fresh = object();
        let kept = registry.register_local_object(&published, "Engine", &[]);

        let mut exports = registry.pending_exports();
        assert_eq!(exports.export(&published, "Engine", &[]), kept);
        let dropped = exports.export(&fresh, "Engine", &[]);
        exports.export(&fresh, "Engine", &[]);
        assert_eq!(registry.exported_count(dropped.as_str()), Some(2));
        drop(exports);

        // a registration made before the frame survives with its old count
        assert_eq!(registry.exported_count(kept.as_str()), Some(0));
        // one made by the frame goes away with it
        assert!(!registry.contains(dropped.as_str()));
        assert_eq!(registry.len(), 1);
        assert_ne!(registry.register_local_object(&fresh, "Engine", &[]), dropped);
    }

    #[test]
    fn test_release_of_unknown_id_is_ignored() {
        let registry = InstanceRegistry::new();
        assert!(!registry.release("missing", 3));
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = InstanceRegistry::new();
        let engine = object();
        let id = registry.register_local_object(&engine, "Engine", &[]);
        assert!(registry.mark_exported(&id));
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert_eq!(Arc::strong_count(&engine), 1);
    }

    #[test]
    fn test_ids_are_minted_and_never_empty() {
        assert!(!ObjectId::mint().as_str().is_empty());
        assert!(ObjectId::parse("").is_err());
    }
}
