//! # Serialization Surrogates
//!
//! The registry that decides, per value, how it crosses the wire.
//!
//! ## Strategies
//!
//! - **ValueCopy**: plain structured content, decoded lazily by the receiver.
//! - **InterfaceOnly**: a copy declared as an interface; wrapped with its type
//!   name so the receiver rebuilds the concrete type.
//! - **ReferenceProxy**: the object stays here; the peer gets a descriptor and
//!   builds a proxy.
//! - **PeerProxy**: a proxy to an object the peer owns; sent back by id.
//! - **ManualBinary**: a placeholder in the structured pass, raw bytes after
//!   the frame.
//! - **List**: each element classified on its own.
//!
//! ## Invariants
//! - Classification is total over registered types and runs before any byte
//!   of a frame is written. Anything else is a `Serialization` error.
//! - The registry is built once and shared read-only by every connection.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::skeleton::RemoteType;
use crate::skeleton::Skeleton;
use crate::value::Declared;
use crate::value::Value;

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value>;
type DecodeFn = fn(serde_json::Value) -> Result<Arc<dyn Any + Send + Sync>>;
type LenFn = fn(&(dyn Any + Send + Sync)) -> Result<usize>;
type WriteFn = fn(&(dyn Any + Send + Sync), &mut Vec<u8>) -> Result<()>;
type ReadFn = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>>;

/// A type that streams its own bytes instead of being structured.
pub trait ManualBinary: Any + Send + Sync + Sized {
    /// Exact number of bytes `write_to` will append.
    fn byte_len(&self) -> usize;

    fn write_to(&self, out: &mut Vec<u8>) -> Result<()>;

    fn read_from(bytes: &[u8]) -> Result<Self>;
}

pub(crate) enum SurrogateKind {
    Value { encode: EncodeFn, decode: Option<DecodeFn> },
    Remote(Arc<dyn Skeleton>),
    Manual { len: LenFn, write: WriteFn, read: ReadFn },
}

/// How one registered type is marshaled.
pub struct Surrogate {
    name: String,
    kind: SurrogateKind,
}

impl Surrogate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> &SurrogateKind {
        &self.kind
    }

    pub(crate) fn skeleton(&self) -> Option<&Arc<dyn Skeleton>> {
        match &self.kind {
            SurrogateKind::Remote(skeleton) => Some(skeleton),
            _ => None,
        }
    }

    pub(crate) fn interfaces(&self) -> Vec<String> {
        self.skeleton().map(|s| s.interfaces().to_vec()).unwrap_or_default()
    }

    pub(crate) fn encode_value(&self, object: &(dyn Any + Send + Sync)) -> Result<serde_json::Value> {
        match &self.kind {
            SurrogateKind::Value { encode, .. } => encode(object),
            _ => Err(Error::Serialization(format!("{} is not a value type", self.name))),
        }
    }

    /// Rebuilds a fresh instance from copied content.
    pub(crate) fn decode_value(&self, json: serde_json::Value) -> Result<Value> {
        match &self.kind {
            SurrogateKind::Value { decode: Some(decode), .. } => Ok(Value::from_object(decode(json)?, self.name.clone())),
            _ => Err(Error::Serialization(format!("{} cannot be rebuilt from a copy", self.name))),
        }
    }

    pub(crate) fn manual_len(&self, object: &(dyn Any + Send + Sync)) -> Result<usize> {
        match &self.kind {
            SurrogateKind::Manual { len, .. } => len(object),
            _ => Err(Error::Serialization(format!("{} is not a manual-binary type", self.name))),
        }
    }

    pub(crate) fn manual_write(&self, object: &(dyn Any + Send + Sync), out: &mut Vec<u8>) -> Result<()> {
        match &self.kind {
            SurrogateKind::Manual { write, .. } => write(object, out),
            _ => Err(Error::Serialization(format!("{} is not a manual-binary type", self.name))),
        }
    }

    pub(crate) fn manual_read(&self, bytes: &[u8]) -> Result<Value> {
        match &self.kind {
            SurrogateKind::Manual { read, .. } => Ok(Value::from_object(read(bytes)?, self.name.clone())),
            _ => Err(Error::Serialization(format!("{} is not a manual-binary type", self.name))),
        }
    }
}

/// The outcome of classifying one value.
///
/// `'r` borrows the registry, `'v` borrows the classified value.
pub enum Strategy<'r, 'v> {
    Null,
    /// Received content forwarded as-is.
    Data(&'v serde_json::Value),
    ValueCopy(&'r Surrogate),
    InterfaceOnly(&'r Surrogate, String),
    ReferenceProxy(&'r Surrogate),
    PeerProxy(Proxy),
    ManualBinary(&'r Surrogate),
    List(&'v [Value]),
}

impl Strategy<'_, '_> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Data(_) => "data",
            Self::ValueCopy(_) => "value-copy",
            Self::InterfaceOnly(..) => "interface-only",
            Self::ReferenceProxy(_) => "reference-proxy",
            Self::PeerProxy(_) => "peer-proxy",
            Self::ManualBinary(_) => "manual-binary",
            Self::List(_) => "list",
        }
    }
}

fn concrete<T: Any>(object: &(dyn Any + Send + Sync)) -> Result<&T> {
    object
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Serialization(format!("expected {}", std::any::type_name::<T>())))
}

fn encode_as<T: Serialize + Any>(object: &(dyn Any + Send + Sync)) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(concrete::<T>(object)?)?)
}

fn decode_as<T: DeserializeOwned + Any + Send + Sync>(json: serde_json::Value) -> Result<Arc<dyn Any + Send + Sync>> {
    Ok(Arc::new(serde_json::from_value::<T>(json)?))
}

fn manual_len_of<T: ManualBinary>(object: &(dyn Any + Send + Sync)) -> Result<usize> {
    Ok(concrete::<T>(object)?.byte_len())
}

fn manual_write_of<T: ManualBinary>(object: &(dyn Any + Send + Sync), out: &mut Vec<u8>) -> Result<()> {
    concrete::<T>(object)?.write_to(out)
}

fn manual_read_of<T: ManualBinary>(bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
    Ok(Arc::new(T::read_from(bytes)?))
}

/// Maps types to surrogates, by `TypeId` for sending and by name for receiving.
pub struct SurrogateRegistry {
    by_type: HashMap<TypeId, Arc<Surrogate>>,
    by_name: HashMap<String, Arc<Surrogate>>,
}

impl Default for SurrogateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SurrogateRegistry {
    /// A registry with the built-in scalar, string and byte types, plus the
    /// cancellation source and callback remote types.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .register_value::<()>("unit")
            .register_value::<bool>("bool")
            .register_value::<i32>("i32")
            .register_value::<i64>("i64")
            .register_value::<u32>("u32")
            .register_value::<u64>("u64")
            .register_value::<f64>("f64")
            .register_value::<String>("string")
            .register_value::<Vec<u8>>("bytes")
            .register_value::<Vec<String>>("string[]")
            .register_value::<Vec<i32>>("i32[]")
            .register_value::<Vec<i64>>("i64[]")
            .register_encode_only::<&'static str>("string");
        crate::cancel::register_builtins(&mut registry);
        registry
    }

    pub fn empty() -> Self {
        Self { by_type: HashMap::new(), by_name: HashMap::new() }
    }

    fn insert(&mut self, type_id: TypeId, surrogate: Surrogate, by_name: bool) -> &mut Self {
        let surrogate = Arc::new(surrogate);
        if by_name {
            self.by_name.insert(surrogate.name.clone(), surrogate.clone());
        }
        self.by_type.insert(type_id, surrogate);
        self
    }

    /// Registers a type that is copied by value.
    pub fn register_value<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let kind = SurrogateKind::Value { encode: encode_as::<T>, decode: Some(decode_as::<T>) };
        self.insert(TypeId::of::<T>(), Surrogate { name: name.into(), kind }, true)
    }

    /// Registers a type that can be sent as a copy but never rebuilt here.
    ///
    /// The name is not used for receiving.
    pub fn register_encode_only<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Serialize + Any + Send + Sync,
    {
        let kind = SurrogateKind::Value { encode: encode_as::<T>, decode: None };
        self.insert(TypeId::of::<T>(), Surrogate { name: name.into(), kind }, false)
    }

    /// Registers a type whose instances stay with their owner.
    pub fn register_remote<T: Any + Send + Sync>(&mut self, remote: RemoteType<T>) -> &mut Self {
        let skeleton: Arc<dyn Skeleton> = Arc::new(remote);
        let name = skeleton.type_name().to_string();
        let type_id = skeleton.object_type();
        self.insert(type_id, Surrogate { name, kind: SurrogateKind::Remote(skeleton) }, true)
    }

    /// Registers a type that streams its own bytes after the frame.
    pub fn register_manual<T: ManualBinary>(&mut self, name: impl Into<String>) -> &mut Self {
        let kind = SurrogateKind::Manual {
            len: manual_len_of::<T>,
            write: manual_write_of::<T>,
            read: manual_read_of::<T>,
        };
        self.insert(TypeId::of::<T>(), Surrogate { name: name.into(), kind }, true)
    }

    pub fn by_name(&self, name: &str) -> Option<&Surrogate> {
        self.by_name.get(name).map(|s| s.as_ref())
    }

    pub fn by_type(&self, type_id: TypeId) -> Option<&Surrogate> {
        self.by_type.get(&type_id).map(|s| s.as_ref())
    }

    pub(crate) fn skeleton_of(&self, object: &(dyn Any + Send + Sync)) -> Option<&Arc<dyn Skeleton>> {
        self.by_type(Any::type_id(object))?.skeleton()
    }

    /// Chooses the strategy for `value` given its declared type.
    pub fn classify<'r, 'v>(&'r self, value: &'v Value, declared: &Declared) -> Result<Strategy<'r, 'v>> {
        let inst = match value {
            Value::Null => return Ok(Strategy::Null),
            Value::Data(json) => return Ok(Strategy::Data(json)),
            Value::Instance(inst) => inst,
        };

        let object: &(dyn Any + Send + Sync) = inst.object().as_ref();
        let type_id = Any::type_id(object);

        if let Some(proxy) = object.downcast_ref::<Proxy>() {
            return Ok(Strategy::PeerProxy(proxy.clone()));
        }
        if let Some(list) = object.downcast_ref::<Vec<Value>>() {
            return Ok(Strategy::List(list));
        }

        let surrogate = self.by_type(type_id).ok_or_else(|| {
            Error::Serialization(format!(
                "{} is neither copyable nor remotely referenceable",
                inst.type_name()
            ))
        })?;

        Ok(match (surrogate.kind(), declared) {
            (SurrogateKind::Value { .. }, Declared::Interface(name)) => Strategy::InterfaceOnly(surrogate, name.clone()),
            (SurrogateKind::Value { .. }, Declared::Any) => Strategy::ValueCopy(surrogate),
            (SurrogateKind::Remote(_), _) => Strategy::ReferenceProxy(surrogate),
            (SurrogateKind::Manual { .. }, _) => Strategy::ManualBinary(surrogate),
        })
    }

    /// Classifies `value` and, for lists, every element. Writes nothing.
    pub fn check(&self, value: &Value) -> Result<()> {
        match self.classify(value, &value.declared())? {
            Strategy::List(items) => items.iter().try_for_each(|item| self.check(item)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Circle {
        radius: f64,
    }

    struct Engine;

    struct Blob(Vec<u8>);

    impl ManualBinary for Blob {
        fn byte_len(&self) -> usize {
            self.0.len()
        }

        fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
            out.extend_from_slice(&self.0);
            Ok(())
        }

        fn read_from(bytes: &[u8]) -> Result<Self> {
            Ok(Blob(bytes.to_vec()))
        }
    }

    fn registry() -> SurrogateRegistry {
        let mut registry = SurrogateRegistry::new();
        registry
            .register_value::<Circle>("Circle")
            .register_remote(RemoteType::<Engine>::new("Engine").interface("IEngine"))
            .register_manual::<Blob>("Blob");
        registry
    }

    #[test]
    fn test_classification_per_kind() -> Result<()> {
        let registry = registry();

        let circle = Value::new(Circle { radius: 1.0 });
        assert_eq!(registry.classify(&circle, &Declared::Any)?.label(), "value-copy");
        match registry.classify(&circle, &Declared::Interface("IShape".into()))? {
            Strategy::InterfaceOnly(s, iface) => {
                assert_eq!(s.name(), "Circle");
                assert_eq!(iface, "IShape");
            }
            other => panic!("unexpected {}", other.label()),
        }

        let engine = Value::new(Engine);
        match registry.classify(&engine, &Declared::Any)? {
            Strategy::ReferenceProxy(s) => assert_eq!(s.interfaces(), vec!["IEngine".to_string()]),
            other => panic!("unexpected {}", other.label()),
        }

        assert_eq!(registry.classify(&Value::new(Blob(vec![1])), &Declared::Any)?.label(), "manual-binary");
        assert_eq!(registry.classify(&Value::null(), &Declared::Any)?.label(), "null");
        assert_eq!(registry.classify(&Value::new(7i32), &Declared::Any)?.label(), "value-copy");
        assert_eq!(registry.classify(&Value::new("text"), &Declared::Any)?.label(), "value-copy");
        Ok(())
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        struct Unknown;
        let registry = registry();
        match registry.classify(&Value::new(Unknown), &Declared::Any) {
            Err(Error::Serialization(msg)) => assert!(msg.contains("Unknown")),
            _ => panic!("expected a serialization error"),
        }
    }

    #[test]
    fn test_check_descends_into_lists() {
        struct Unknown;
        let registry = registry();
        let good = Value::list(vec![Value::new(1i32), Value::new(Engine)]);
        assert!(registry.check(&good).is_ok());
        let bad = Value::list(vec![Value::new(1i32), Value::list(vec![Value::new(Unknown)])]);
        assert!(matches!(registry.check(&bad), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_copy_rebuilt_by_name() -> Result<()> {
        let registry = registry();
        let surrogate = registry.by_name("Circle").ok_or(Error::Serialization("missing".into()))?;
        let json = surrogate.encode_value(&Circle { radius: 2.0 })?;
        let value = surrogate.decode_value(json)?;
        assert_eq!(value.downcast::<Circle>().as_deref(), Some(&Circle { radius: 2.0 }));
        Ok(())
    }
}
