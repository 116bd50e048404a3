//! # Marshaling
//!
//! Converts `Value`s to wire arguments and back for one connection.
//!
//! Encoding is pure: it classifies every value (lists included) before the
//! first byte is produced, then emits inline content or descriptors and
//! queues manual payloads on a `SerializationContext`. Sending is the
//! caller's job.
//!
//! Decoding runs in three steps: parse each inline argument, collect manual
//! placeholders in document order and load their raw segments, then rebuild
//! values, resolving references through the instance registry.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::json;
use wirepack::Decoder;

use crate::connection::ConnectionInner;
use crate::context::ReadContext;
use crate::context::SerializationContext;
use crate::descriptor::InterfaceOnly;
use crate::descriptor::ManualPlaceholder;
use crate::descriptor::ReferenceDescriptor;
use crate::descriptor::ReferenceKind;
use crate::descriptor::VALUES_KEY;
use crate::descriptor::reads_as_descriptor;
use crate::descriptor::wrapped_list;
use crate::error::Error;
use crate::error::Result;
use crate::frame::WireArg;
use crate::proxy::Proxy;
use crate::registry::InstanceRegistry;
use crate::registry::ObjectId;
use crate::registry::PendingExports;
use crate::surrogate::Strategy;
use crate::surrogate::Surrogate;
use crate::surrogate::SurrogateRegistry;
use crate::value::Instance;
use crate::value::Value;

/// Wire arguments plus the manual payloads that must follow them.
///
/// `exports` holds the reference counts taken for local objects; the
/// sender commits it once the frame is out.
pub(crate) struct EncodedArgs<'a> {
    pub args: Vec<WireArg<'static>>,
    pub ctx: SerializationContext<'a>,
    pub exports: PendingExports<'a>,
}

/// A top-level argument before raw segments are resolved.
enum Parsed {
    Json(serde_json::Value),
    Reference(ReferenceDescriptor),
}

pub(crate) struct Marshaller<'c> {
    conn: &'c Arc<ConnectionInner>,
}

impl<'c> Marshaller<'c> {
    pub fn new(conn: &'c Arc<ConnectionInner>) -> Self {
        Self { conn }
    }

    pub fn encode_args(&self, values: &[Value]) -> Result<EncodedArgs<'c>> {
        for value in values {
            self.conn.surrogates.check(value)?;
        }
        let registry: &'c InstanceRegistry = &self.conn.registry;
        let mut exports = registry.pending_exports();
        let mut ctx = SerializationContext::new();
        let mut args = Vec::with_capacity(values.len());
        for value in values {
            args.push(self.encode_arg(value, &mut ctx, &mut exports)?);
        }
        Ok(EncodedArgs { args, ctx, exports })
    }

    fn encode_arg(
        &self,
        value: &Value,
        ctx: &mut SerializationContext<'c>,
        exports: &mut PendingExports<'c>,
    ) -> Result<WireArg<'static>> {
        let surrogates: &'c SurrogateRegistry = &self.conn.surrogates;
        match surrogates.classify(value, &value.declared())? {
            Strategy::ReferenceProxy(surrogate) => {
                Ok(WireArg::Reference(self.describe_local(surrogate, value, exports)?))
            }
            Strategy::PeerProxy(proxy) => Ok(WireArg::Reference(self.describe_peer(&proxy)?)),
            Strategy::InterfaceOnly(surrogate, interface) => {
                let instance = surrogate.encode_value(instance_of(value)?.object().as_ref())?;
                Ok(WireArg::Reference(ReferenceDescriptor::serialized(surrogate.name(), vec![interface], instance)))
            }
            _ => {
                let json = self.to_json(value, ctx, exports)?;
                Ok(WireArg::Inline(Cow::Owned(serde_json::to_vec(&json)?)))
            }
        }
    }

    /// Structured form of a value nested inside other content.
    fn to_json(
        &self,
        value: &Value,
        ctx: &mut SerializationContext<'c>,
        exports: &mut PendingExports<'c>,
    ) -> Result<serde_json::Value> {
        let surrogates: &'c SurrogateRegistry = &self.conn.surrogates;
        Ok(match surrogates.classify(value, &value.declared())? {
            Strategy::Null => serde_json::Value::Null,
            Strategy::Data(json) => plain_content(json.clone())?,
            Strategy::ValueCopy(surrogate) => {
                plain_content(surrogate.encode_value(instance_of(value)?.object().as_ref())?)?
            }
            Strategy::InterfaceOnly(surrogate, _) => serde_json::to_value(InterfaceOnly {
                assembly_qualified_name: surrogate.name().to_string(),
                instance: surrogate.encode_value(instance_of(value)?.object().as_ref())?,
            })?,
            Strategy::ReferenceProxy(surrogate) => serde_json::to_value(self.describe_local(surrogate, value, exports)?)?,
            Strategy::PeerProxy(proxy) => serde_json::to_value(self.describe_peer(&proxy)?)?,
            Strategy::ManualBinary(surrogate) => {
                let placeholder = ctx.enqueue(surrogate, instance_of(value)?.object())?;
                serde_json::to_value(placeholder)?
            }
            Strategy::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.to_json(item, ctx, exports)?);
                }
                json!({ VALUES_KEY: out })
            }
        })
    }

    /// Registers a local object (if new), counts the export and describes it.
    fn describe_local(
        &self,
        surrogate: &Surrogate,
        value: &Value,
        exports: &mut PendingExports<'c>,
    ) -> Result<ReferenceDescriptor> {
        let interfaces = surrogate.interfaces();
        let id = exports.export(instance_of(value)?.object(), surrogate.name(), &interfaces);
        Ok(ReferenceDescriptor::reference(ReferenceKind::RemoteObject, surrogate.name(), id.as_str(), interfaces))
    }

    /// A proxy goes back to its owner by id.
    fn describe_peer(&self, proxy: &Proxy) -> Result<ReferenceDescriptor> {
        if !Arc::ptr_eq(proxy.connection(), self.conn) {
            return Err(Error::Serialization(format!(
                "proxy {} belongs to another connection",
                proxy.id()
            )));
        }
        Ok(ReferenceDescriptor::reference(
            ReferenceKind::RemoteProxy,
            proxy.type_name(),
            proxy.id().as_str(),
            proxy.interfaces().to_vec(),
        ))
    }

    /// Rebuilds values from wire arguments and the frame's trailing segments.
    pub fn decode_args<'a>(&self, args: Vec<WireArg<'a>>, segments: &mut Decoder<'a>) -> Result<Vec<Value>> {
        let mut parsed = Vec::with_capacity(args.len());
        for arg in args {
            parsed.push(match arg {
                WireArg::Inline(bytes) => Parsed::Json(serde_json::from_slice(&bytes)?),
                WireArg::Reference(desc) => Parsed::Reference(desc),
            });
        }

        let mut placeholders = Vec::new();
        for arg in &parsed {
            if let Parsed::Json(json) = arg {
                collect_placeholders(json, &mut placeholders)?;
            }
        }
        let ctx = ReadContext::load(&placeholders, segments)?;

        parsed
            .into_iter()
            .map(|arg| match arg {
                Parsed::Json(json) => self.from_json(json, &ctx),
                Parsed::Reference(desc) => self.resolve(desc),
            })
            .collect()
    }

    pub fn decode_one<'a>(&self, arg: WireArg<'a>, segments: &mut Decoder<'a>) -> Result<Value> {
        self.decode_args(vec![arg], segments)?
            .pop()
            .ok_or_else(|| Error::Protocol("missing result".into()))
    }

    fn from_json(&self, json: serde_json::Value, ctx: &ReadContext<'_>) -> Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        if let Some(desc) = ReferenceDescriptor::from_json(&json) {
            return self.resolve(desc?);
        }
        if let Some(wrapped) = InterfaceOnly::from_json(&json) {
            let surrogate = self.conn.surrogates.by_name(&wrapped.assembly_qualified_name).ok_or_else(|| {
                Error::Serialization(format!("unknown type '{}'", wrapped.assembly_qualified_name))
            })?;
            return surrogate.decode_value(wrapped.instance);
        }
        if let Some(placeholder) = ManualPlaceholder::from_json(&json) {
            let placeholder = placeholder?;
            let surrogate = self.conn.surrogates.by_name(&placeholder.manual_binary).ok_or_else(|| {
                Error::Serialization(format!("unknown manual type '{}'", placeholder.manual_binary))
            })?;
            return surrogate.manual_read(ctx.segment(&placeholder)?);
        }
        if wrapped_list(&json).is_some() {
            let serde_json::Value::Object(mut obj) = json else {
                return Err(Error::Serialization("malformed list".into()));
            };
            let items = match obj.remove(VALUES_KEY) {
                Some(serde_json::Value::Array(items)) => items,
                _ => return Err(Error::Serialization("malformed list".into())),
            };
            let values = items
                .into_iter()
                .map(|item| self.from_json(item, ctx))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::list(values));
        }
        Ok(Value::Data(json))
    }

    fn resolve(&self, desc: ReferenceDescriptor) -> Result<Value> {
        match desc.reference_type {
            ReferenceKind::RemoteProxy => {
                let (object, type_name) = self.conn.registry.resolve_local(&desc.object_id).ok_or_else(|| {
                    Error::Protocol(format!("peer referenced unknown local object '{}'", desc.object_id))
                })?;
                Ok(Value::from_object(object, type_name))
            }
            ReferenceKind::RemoteObject => {
                let conn = self.conn.clone();
                let type_name = desc.assembly_qualified_name.clone();
                let interfaces = desc.interfaces.clone();
                self.conn.registry.resolve_or_create_proxy(&desc, move |id: ObjectId| {
                    Proxy::new(conn, id, type_name, interfaces)
                })
            }
            ReferenceKind::SerializedObject => {
                let instance = desc
                    .instance
                    .ok_or_else(|| Error::Protocol("serialized object without content".into()))?;
                let surrogate = self.conn.surrogates.by_name(&desc.assembly_qualified_name).ok_or_else(|| {
                    Error::Serialization(format!("unknown type '{}'", desc.assembly_qualified_name))
                })?;
                surrogate.decode_value(instance)
            }
        }
    }
}

fn instance_of(value: &Value) -> Result<&Instance> {
    match value {
        Value::Instance(inst) => Ok(inst),
        other => Err(Error::Serialization(format!("{} is not an object", other.type_name()))),
    }
}

fn plain_content(json: serde_json::Value) -> Result<serde_json::Value> {
    if reads_as_descriptor(&json) {
        return Err(Error::Serialization("copied content uses a reserved descriptor shape".into()));
    }
    Ok(json)
}

/// Placeholders appear at top level and inside wrapped lists, in array order.
fn collect_placeholders(json: &serde_json::Value, out: &mut Vec<ManualPlaceholder>) -> Result<()> {
    if let Some(placeholder) = ManualPlaceholder::from_json(json) {
        out.push(placeholder?);
        return Ok(());
    }
    if let Some(items) = wrapped_list(json) {
        for item in items {
            collect_placeholders(item, out)?;
        }
    }
    Ok(())
}
