//! # Remote Types
//!
//! A `RemoteType<T>` is the dispatch table for one reference-proxy type: its
//! wire name, the interfaces it implements, its methods by name and an
//! optional constructor for `CreateInstance`.
//!
//! Tables are built once, handed to the `SurrogateRegistry`, and looked up by
//! method name on every inbound call.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::value::Value;

/// The pending result of one dispatched method.
pub type MethodFuture = BoxFuture<'static, std::result::Result<Value, Fault>>;

type Method<T> = Arc<dyn Fn(Arc<T>, Args) -> MethodFuture + Send + Sync>;
type Constructor<T> = Arc<dyn Fn(Args) -> std::result::Result<T, Fault> + Send + Sync>;

/// Decoded arguments of an inbound call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Result<&Value> {
        self.values
            .get(index)
            .ok_or_else(|| Error::Serialization(format!("missing argument {}", index)))
    }

    /// Reads argument `index` as a copy of `T`.
    pub fn get<T: DeserializeOwned + Clone + Any>(&self, index: usize) -> Result<T> {
        self.value(index)?.to::<T>()
    }

    /// Returns argument `index` as a live local object.
    pub fn object<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        let value = self.value(index)?;
        value.downcast::<T>().ok_or_else(|| {
            Error::Serialization(format!(
                "argument {} is {}, expected {}",
                index,
                value.type_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Returns argument `index` as a proxy to an object owned by the caller.
    pub fn proxy(&self, index: usize) -> Result<Proxy> {
        let value = self.value(index)?;
        value
            .proxy()
            .ok_or_else(|| Error::Serialization(format!("argument {} is {}, expected a proxy", index, value.type_name())))
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }
}

/// Type-erased view of a `RemoteType<T>`.
pub(crate) trait Skeleton: Send + Sync {
    fn type_name(&self) -> &str;

    fn interfaces(&self) -> &[String];

    fn object_type(&self) -> TypeId;

    fn invoke(
        &self,
        target: Arc<dyn Any + Send + Sync>,
        method: &str,
        args: Args,
    ) -> std::result::Result<MethodFuture, Fault>;

    fn construct(&self, args: Args) -> std::result::Result<Arc<dyn Any + Send + Sync>, Fault>;
}

/// Builder and dispatch table for a type whose instances stay with their owner.
pub struct RemoteType<T> {
    name: String,
    interfaces: Vec<String>,
    methods: HashMap<String, Method<T>>,
    constructor: Option<Constructor<T>>,
}

impl<T: Any + Send + Sync> RemoteType<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            methods: HashMap::new(),
            constructor: None,
        }
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    /// Adds an async method. Replaces any method of the same name.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Fault>> + Send + 'static,
    {
        let method: Method<T> = Arc::new(move |target, args| Box::pin(f(target, args)));
        self.methods.insert(name.into(), method);
        self
    }

    /// Adds a method that completes without awaiting.
    pub fn method_sync<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, Args) -> std::result::Result<Value, Fault> + Send + Sync + 'static,
    {
        let method: Method<T> = Arc::new(move |target, args| {
            let result = f(&target, args);
            Box::pin(futures::future::ready(result))
        });
        self.methods.insert(name.into(), method);
        self
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(Args) -> std::result::Result<T, Fault> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

impl<T: Any + Send + Sync> Skeleton for RemoteType<T> {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    fn object_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn invoke(
        &self,
        target: Arc<dyn Any + Send + Sync>,
        method: &str,
        args: Args,
    ) -> std::result::Result<MethodFuture, Fault> {
        let entry = self.methods.get(method).ok_or_else(|| {
            Fault::new(FaultKind::MethodNotFound, self.name.clone(), format!("no method '{}'", method))
        })?;
        let target = target.downcast::<T>().map_err(|_| {
            Fault::new(FaultKind::InstanceNotFound, self.name.clone(), "target has a different type")
        })?;
        Ok(entry(target, args))
    }

    fn construct(&self, args: Args) -> std::result::Result<Arc<dyn Any + Send + Sync>, Fault> {
        let ctor = self.constructor.as_ref().ok_or_else(|| {
            Fault::new(FaultKind::MethodNotFound, self.name.clone(), "type cannot be created remotely")
        })?;
        Ok(Arc::new(ctor(args)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    use crate::surrogate::SurrogateRegistry;

    struct Counter {
        total: AtomicI64,
    }

    fn counter_type() -> RemoteType<Counter> {
        RemoteType::<Counter>::new("Counter")
            .interface("ICounter")
            .method_sync("Add", |c: &Counter, args| {
                let n: i64 = args.get(0)?;
                Ok(Value::new(c.total.fetch_add(n, Ordering::SeqCst) + n))
            })
            .method("Total", |c: Arc<Counter>, _| async move { Ok(Value::new(c.total.load(Ordering::SeqCst))) })
            .constructor(|args| Ok(Counter { total: AtomicI64::new(args.get(0)?) }))
    }

    #[tokio::test]
    async fn test_dispatch_by_name() -> std::result::Result<(), Fault> {
        let skeleton = counter_type();
        let object = skeleton.construct(Args::new(vec![Value::new(10i64)]))?;

        let added = skeleton.invoke(object.clone(), "Add", Args::new(vec![Value::new(5i64)]))?.await?;
        assert_eq!(added.to::<i64>()?, 15);
        let total = skeleton.invoke(object, "Total", Args::default())?.await?;
        assert_eq!(total.to::<i64>()?, 15);
        assert_eq!(skeleton.interfaces(), &["ICounter".to_string()]);
        Ok(())
    }

    #[test]
    fn test_registered_under_object_type_and_name() {
        let skeleton = counter_type();
        assert_eq!(Skeleton::type_name(&skeleton), "Counter");
        assert_eq!(skeleton.object_type(), TypeId::of::<Counter>());

        let mut registry = SurrogateRegistry::new();
        registry.register_remote(counter_type());
        let counter: Arc<dyn Any + Send + Sync> = Arc::new(Counter { total: AtomicI64::new(0) });
        let found = registry.skeleton_of(counter.as_ref()).expect("found by object type");
        assert_eq!(found.type_name(), "Counter");
        assert!(registry.by_name("Counter").and_then(|s| s.skeleton()).is_some());
        assert!(registry.skeleton_of(&3u8).is_none());
    }

    #[test]
    fn test_unknown_method_and_wrong_target() {
        let skeleton = counter_type();
        let wrong: Arc<dyn Any + Send + Sync> = Arc::new(3u8);
        match skeleton.invoke(wrong.clone(), "Nope", Args::default()) {
            Err(fault) => assert_eq!(fault.kind, FaultKind::MethodNotFound),
            Ok(_) => panic!("expected a fault"),
        }
        match skeleton.invoke(wrong, "Add", Args::default()) {
            Err(fault) => assert_eq!(fault.kind, FaultKind::InstanceNotFound),
            Ok(_) => panic!("expected a fault"),
        }
    }

    #[test]
    fn test_missing_argument_is_serialization_fault() {
        let skeleton = counter_type();
        match skeleton.construct(Args::default()) {
            Err(fault) => assert_eq!(fault.kind, FaultKind::Serialization),
            Ok(_) => panic!("expected a fault"),
        }
    }
}
