//! # Wire Descriptors
//!
//! The reserved shapes that travel in place of real objects.
//!
//! - `ReferenceDescriptor` names an object by id. At top level it is encoded as
//!   a TLV map; nested inside structured content it is a JSON object with a
//!   `ReferenceType` key.
//! - `InterfaceOnly` wraps a copied value with its type name
//!   (`AssemblyQualifiedName` + `Instance`).
//! - `ManualPlaceholder` stands in for a manual-binary payload whose bytes
//!   follow the frame (`ManualBinary` + `Length`).
//! - `{"Values": [...]}` wraps a list whose elements were classified one by one.
//!
//! These keys are reserved. Copied content whose top level would read back as
//! one of these shapes is refused when encoding.

use serde::Deserialize;
use serde::Serialize;
use wirepack::Decoder;
use wirepack::Encoder;

use crate::error::Error;
use crate::error::Result;

/// The JSON key marking a wrapped list.
pub const VALUES_KEY: &str = "Values";

/// How the receiver must interpret a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// The receiver already owns this object; resolve it locally.
    RemoteProxy,
    /// The sender owns this object; the receiver builds or reuses a proxy.
    RemoteObject,
    /// A fresh copy carrying its type; never cached by id.
    SerializedObject,
}

impl ReferenceKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::RemoteProxy => "RemoteProxy",
            Self::RemoteObject => "RemoteObject",
            Self::SerializedObject => "SerializedObject",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "RemoteProxy" => Ok(Self::RemoteProxy),
            "RemoteObject" => Ok(Self::RemoteObject),
            "SerializedObject" => Ok(Self::SerializedObject),
            _ => Err(Error::Protocol(format!("unknown reference kind '{}'", tag))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReferenceDescriptor {
    pub reference_type: ReferenceKind,
    pub assembly_qualified_name: String,
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Copied content, only for `SerializedObject`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<serde_json::Value>,
}

impl ReferenceDescriptor {
    pub fn reference(
        kind: ReferenceKind,
        type_name: impl Into<String>,
        object_id: impl Into<String>,
        interfaces: Vec<String>,
    ) -> Self {
        Self {
            reference_type: kind,
            assembly_qualified_name: type_name.into(),
            object_id: object_id.into(),
            interfaces,
            instance: None,
        }
    }

    pub fn serialized(type_name: impl Into<String>, interfaces: Vec<String>, instance: serde_json::Value) -> Self {
        Self {
            reference_type: ReferenceKind::SerializedObject,
            assembly_qualified_name: type_name.into(),
            object_id: String::new(),
            interfaces,
            instance: Some(instance),
        }
    }

    /// Encodes the descriptor as a TLV map.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        enc.entry_str("kind", self.reference_type.as_tag())?;
        enc.entry_str("type", &self.assembly_qualified_name)?;
        enc.entry_str("id", &self.object_id)?;

        enc.variant_begin("interfaces")?;
        enc.list_begin()?;
        for name in &self.interfaces {
            enc.str(name)?;
        }
        enc.list_end()?;
        enc.variant_end()?;

        if let Some(instance) = &self.instance {
            let text = serde_json::to_string(instance)?;
            enc.entry_str("instance", &text)?;
        }

        enc.map_end()?;
        Ok(())
    }

    /// Decodes a descriptor written by `encode`. Unknown fields are skipped.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut kind = None;
        let mut type_name = None;
        let mut object_id = None;
        let mut interfaces = Vec::new();
        let mut instance = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "kind" => kind = Some(ReferenceKind::from_tag(val.str()?)?),
                "type" => type_name = Some(val.str()?.to_string()),
                "id" => object_id = Some(val.str()?.to_string()),
                "interfaces" => {
                    let mut items = val.list()?;
                    while let Some(mut item) = items.next()? {
                        interfaces.push(item.str()?.to_string());
                    }
                }
                "instance" => {
                    let parsed = serde_json::from_str(val.str()?)
                        .map_err(|e| Error::Protocol(format!("descriptor instance: {}", e)))?;
                    instance = Some(parsed);
                }
                _ => val.skip()?,
            }
        }

        Ok(Self {
            reference_type: kind.ok_or(Error::Protocol("descriptor missing kind".into()))?,
            assembly_qualified_name: type_name.ok_or(Error::Protocol("descriptor missing type".into()))?,
            object_id: object_id.unwrap_or_default(),
            interfaces,
            instance,
        })
    }

    /// Recognizes a descriptor nested inside structured content.
    pub fn from_json(json: &serde_json::Value) -> Option<Result<Self>> {
        let obj = json.as_object()?;
        if !obj.contains_key("ReferenceType") {
            return None;
        }
        Some(
            serde_json::from_value(json.clone())
                .map_err(|e| Error::Protocol(format!("malformed reference descriptor: {}", e))),
        )
    }
}

/// A copied value wrapped with its concrete type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceOnly {
    pub assembly_qualified_name: String,
    pub instance: serde_json::Value,
}

impl InterfaceOnly {
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        let obj = json.as_object()?;
        if obj.len() != 2 || !obj.contains_key("AssemblyQualifiedName") || !obj.contains_key("Instance") {
            return None;
        }
        serde_json::from_value(json.clone()).ok()
    }
}

/// Marks the position of a manual-binary payload inside structured content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManualPlaceholder {
    pub manual_binary: String,
    pub length: u64,
    /// Position of the payload among this frame's raw segments.
    pub slot: u32,
}

impl ManualPlaceholder {
    pub fn from_json(json: &serde_json::Value) -> Option<Result<Self>> {
        let obj = json.as_object()?;
        if !obj.contains_key("ManualBinary") {
            return None;
        }
        Some(
            serde_json::from_value(json.clone())
                .map_err(|e| Error::Serialization(format!("malformed manual placeholder: {}", e))),
        )
    }
}

/// Recognizes `{"Values": [...]}`.
pub fn wrapped_list(json: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    let obj = json.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(VALUES_KEY)?.as_array()
}

/// True if the receiver would take `json` for one of the shapes above instead
/// of plain content.
pub fn reads_as_descriptor(json: &serde_json::Value) -> bool {
    let Some(obj) = json.as_object() else {
        return false;
    };
    obj.contains_key("ReferenceType")
        || obj.contains_key("ManualBinary")
        || InterfaceOnly::from_json(json).is_some()
        || wrapped_list(json).is_some()
}
