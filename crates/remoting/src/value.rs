//! # Dynamic Values
//!
//! `Value` is what crosses a call boundary: arguments, results and event
//! payloads.
//!
//! - `Instance` holds a live object. Its surrogate decides how it travels.
//! - `Data` holds structured content received from the peer. It is decoded
//!   into a concrete type lazily, at the point of use (`to::<T>()`).
//! - `Null` travels as JSON `null`.

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;

/// The statically declared type of a value at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared {
    /// No declared type; copies travel as plain structured content.
    Any,
    /// Declared as an interface; copies travel wrapped with their concrete type.
    Interface(String),
}

/// A live object plus the metadata needed to marshal it.
#[derive(Clone)]
pub struct Instance {
    object: Arc<dyn Any + Send + Sync>,
    type_name: Cow<'static, str>,
    declared: Option<Arc<str>>,
}

impl Instance {
    pub(crate) fn object(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.object
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

#[derive(Clone)]
pub enum Value {
    Null,
    Instance(Instance),
    Data(serde_json::Value),
}

impl Value {
    /// Wraps an owned value. Passing a `Value` returns it unchanged.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
        match boxed.downcast::<Value>() {
            Ok(value) => *value,
            Err(other) => Self::Instance(Instance {
                object: Arc::from(other),
                type_name: Cow::Borrowed(std::any::type_name::<T>()),
                declared: None,
            }),
        }
    }

    /// Wraps a shared object without copying it.
    ///
    /// Reference-proxy objects keep their identity across calls only when
    /// passed through the same `Arc`.
    pub fn shared<T: Any + Send + Sync>(object: Arc<T>) -> Self {
        Self::Instance(Instance {
            object,
            type_name: Cow::Borrowed(std::any::type_name::<T>()),
            declared: None,
        })
    }

    pub(crate) fn from_object(object: Arc<dyn Any + Send + Sync>, type_name: impl Into<String>) -> Self {
        Self::Instance(Instance { object, type_name: Cow::Owned(type_name.into()), declared: None })
    }

    /// A list whose elements are classified one by one.
    pub fn list(values: Vec<Value>) -> Self {
        Self::new(values)
    }

    pub fn null() -> Self {
        Self::Null
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Data(json) => json.is_null(),
            Self::Instance(_) => false,
        }
    }

    /// Declares this value as an interface at the call site.
    ///
    /// Has no effect on `Null` and `Data`.
    pub fn declared_as(self, interface: impl Into<String>) -> Self {
        match self {
            Self::Instance(mut inst) => {
                inst.declared = Some(Arc::from(interface.into()));
                Self::Instance(inst)
            }
            other => other,
        }
    }

    pub fn declared(&self) -> Declared {
        match self {
            Self::Instance(Instance { declared: Some(name), .. }) => Declared::Interface(name.to_string()),
            _ => Declared::Any,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Instance(inst) => inst.type_name(),
            Self::Data(_) => "data",
        }
    }

    /// Extracts a copy of the value as `T`.
    ///
    /// Live instances must be exactly `T`; received data is deserialized.
    pub fn to<T: DeserializeOwned + Clone + Any>(&self) -> Result<T> {
        match self {
            Self::Instance(inst) => inst.object.downcast_ref::<T>().cloned().ok_or_else(|| {
                Error::Serialization(format!(
                    "expected {}, found {}",
                    std::any::type_name::<T>(),
                    inst.type_name
                ))
            }),
            Self::Data(json) => serde_json::from_value(json.clone()).map_err(|e| {
                Error::Serialization(format!("cannot read {}: {}", std::any::type_name::<T>(), e))
            }),
            Self::Null => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                Error::Serialization(format!("null is not a {}", std::any::type_name::<T>()))
            }),
        }
    }

    /// Returns the shared object if this is a live `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Instance(inst) => inst.object.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn proxy(&self) -> Option<Proxy> {
        self.downcast::<Proxy>().map(|p| (*p).clone())
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(json) => Some(json),
            _ => None,
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Self::Instance(inst) => match inst.object.downcast::<Vec<Value>>() {
                Ok(list) => Ok(Arc::unwrap_or_clone(list)),
                Err(_) => Err(Error::Serialization(format!("{} is not a list", inst.type_name))),
            },
            Self::Data(serde_json::Value::Array(items)) => Ok(items.into_iter().map(Self::Data).collect()),
            other => Err(Error::Serialization(format!("{} is not a list", other.type_name()))),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Instance(inst) => match &inst.declared {
                Some(iface) => write!(f, "Instance({} as {})", inst.type_name, iface),
                None => write!(f, "Instance({})", inst.type_name),
            },
            Self::Data(json) => write!(f, "Data({})", json),
        }
    }
}

/// Converts a call's argument tuple into values.
pub trait IntoArgs {
    fn into_args(self) -> Vec<Value>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

macro_rules! impl_into_args {
    ($($name:ident),+) => {
        impl<$($name: Any + Send + Sync),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$(Value::new($name)),+]
            }
        }
    };
}

impl_into_args!(A);
impl_into_args!(A, B);
impl_into_args!(A, B, C);
impl_into_args!(A, B, C, D);

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_new_does_not_nest_values() {
        let inner = Value::new(5i32);
        let outer = Value::new(inner);
        assert_eq!(outer.downcast::<i32>().as_deref(), Some(&5));
    }

    #[test]
    fn test_lazy_data_decoding() -> Result<()> {
        let value = Value::Data(json!(7));
        assert_eq!(value.to::<i32>()?, 7);
        assert_eq!(value.to::<i64>()?, 7);
        assert!(matches!(value.to::<String>(), Err(Error::Serialization(_))));
        Ok(())
    }

    #[test]
    fn test_instance_extraction_is_exact() -> Result<()> {
        let value = Value::new(7i32);
        assert_eq!(value.to::<i32>()?, 7);
        assert!(value.to::<i64>().is_err());
        Ok(())
    }

    #[test]
    fn test_null_reads_as_option_and_unit() -> Result<()> {
        assert!(Value::null().is_null());
        assert_eq!(Value::null().to::<Option<i32>>()?, None);
        Value::null().to::<()>()?;
        Ok(())
    }

    #[test]
    fn test_lists() -> Result<()> {
        let list = Value::list(vec![Value::new(1i32), Value::null()]);
        let items = list.into_list()?;
        assert_eq!(items.len(), 2);

        let received = Value::Data(json!([1, 2, 3])).into_list()?;
        assert_eq!(received[2].to::<u32>()?, 3);
        Ok(())
    }

    #[test]
    fn test_declared_interface() {
        let value = Value::new(3u32).declared_as("IShape");
        assert_eq!(value.declared(), Declared::Interface("IShape".into()));
        assert_eq!(Value::null().declared_as("IShape").declared(), Declared::Any);
    }

    #[test]
    fn test_tuple_args() {
        let args = (2i32, "x".to_string(), Value::null()).into_args();
        assert_eq!(args.len(), 3);
        assert!(args[2].is_null());
    }
}
