//! # Protocol Frames
//!
//! Every message on the channel is `[CallHeader][Payload][ManualSegments...]`.
//!
//! ## Layout
//!
//! - **Header**: map `{kind, seq}`. `seq` pairs a Reply with its call.
//! - **MethodCall**: map `{target, method, argc, args}`.
//! - **CreateInstance**: map `{type, argc, args}`.
//! - **Reply**: `Ok(args)` with exactly one argument, or `Err({kind, type, message})`.
//! - **ReleaseInstance**: map `{id, count}`. Never answered.
//! - **Shutdown**: unit. Never answered.
//!
//! An argument is `[IsInlineCopy: bool]` followed by either the structured
//! bytes of the value or a reference descriptor map.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`.
//! - **Forward Compatibility**: Unknown map fields are skipped.
//! - **Segments Last**: Raw segments are written after all tagged items, so
//!   `Frame::segments` is positioned exactly at the first one.

use std::borrow::Cow;

use wirepack::Decoder;
use wirepack::Encoder;

use crate::descriptor::ReferenceDescriptor;
use crate::error::Error;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    MethodCall,
    CreateInstance,
    Reply,
    ReleaseInstance,
    Shutdown,
}

impl FunctionKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::MethodCall => "MethodCall",
            Self::CreateInstance => "CreateInstance",
            Self::Reply => "Reply",
            Self::ReleaseInstance => "ReleaseInstance",
            Self::Shutdown => "Shutdown",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "MethodCall" => Ok(Self::MethodCall),
            "CreateInstance" => Ok(Self::CreateInstance),
            "Reply" => Ok(Self::Reply),
            "ReleaseInstance" => Ok(Self::ReleaseInstance),
            "Shutdown" => Ok(Self::Shutdown),
            _ => Err(Error::Protocol(format!("unknown function kind '{}'", tag))),
        }
    }

    /// Returns true if the sender waits for a Reply carrying the same seq.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::MethodCall | Self::CreateInstance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub kind: FunctionKind,
    pub seq: u64,
}

impl CallHeader {
    pub fn new(kind: FunctionKind, seq: u64) -> Self {
        Self { kind, seq }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        enc.entry_str("kind", self.kind.as_tag())?;
        enc.entry_u64("seq", self.seq)?;
        enc.map_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut kind = None;
        let mut seq = None;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "kind" => kind = Some(FunctionKind::from_tag(val.str()?)?),
                "seq" => seq = Some(val.u64()?),
                _ => val.skip()?,
            }
        }
        Ok(Self {
            kind: kind.ok_or(Error::Protocol("header missing kind".into()))?,
            seq: seq.ok_or(Error::Protocol("header missing seq".into()))?,
        })
    }
}

/// Reads only the header, for routing.
pub fn decode_header(bytes: &[u8]) -> Result<CallHeader> {
    CallHeader::decode(&mut Decoder::new(bytes))
}

/// One argument as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireArg<'a> {
    /// Structured bytes of a copied value.
    Inline(Cow<'a, [u8]>),
    /// A reference (or typed copy) described by its descriptor.
    Reference(ReferenceDescriptor),
}

impl WireArg<'_> {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Inline(bytes) => {
                enc.bool(true)?;
                enc.bytes(bytes)?;
            }
            Self::Reference(desc) => {
                enc.bool(false)?;
                desc.encode(enc)?;
            }
        }
        Ok(())
    }
}

fn encode_args(enc: &mut Encoder, args: &[WireArg<'_>]) -> Result<()> {
    let argc = u32::try_from(args.len()).map_err(|_| Error::Serialization("too many arguments".into()))?;
    enc.variant_begin("argc")?;
    enc.u32(argc)?;
    enc.variant_end()?;

    enc.variant_begin("args")?;
    enc.list_begin()?;
    for arg in args {
        arg.encode(enc)?;
    }
    enc.list_end()?;
    enc.variant_end()?;
    Ok(())
}

fn decode_args<'a>(mut dec: Decoder<'a>, argc: u32) -> Result<Vec<WireArg<'a>>> {
    let mut items = dec.list()?;
    // argc comes from the peer; grow with what is actually there
    let mut args = Vec::new();
    while let Some(mut flag) = items.next()? {
        let inline = flag.bool()?;
        let mut body = items
            .next()?
            .ok_or(Error::Protocol("argument flag without body".into()))?;
        if inline {
            args.push(WireArg::Inline(Cow::Borrowed(body.bytes()?)));
        } else {
            args.push(WireArg::Reference(ReferenceDescriptor::decode(&mut body)?));
        }
    }
    if args.len() != argc as usize {
        return Err(Error::Protocol(format!("argument count mismatch: declared {}, found {}", argc, args.len())));
    }
    Ok(args)
}

/// Encodes an outbound MethodCall frame (without its raw segments).
pub struct CallEncoder<'a> {
    pub seq: u64,
    pub target: &'a str,
    pub method: &'a str,
    pub args: &'a [WireArg<'a>],
}

impl<'a> CallEncoder<'a> {
    pub fn new(seq: u64, target: &'a str, method: &'a str, args: &'a [WireArg<'a>]) -> Self {
        Self { seq, target, method, args }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        CallHeader::new(FunctionKind::MethodCall, self.seq).encode(enc)?;
        enc.map_begin()?;
        enc.entry_str("target", self.target)?;
        enc.entry_str("method", self.method)?;
        encode_args(enc, self.args)?;
        enc.map_end()?;
        Ok(())
    }
}

/// Encodes an outbound CreateInstance frame (without its raw segments).
pub struct CreateEncoder<'a> {
    pub seq: u64,
    pub type_name: &'a str,
    pub args: &'a [WireArg<'a>],
}

impl<'a> CreateEncoder<'a> {
    pub fn new(seq: u64, type_name: &'a str, args: &'a [WireArg<'a>]) -> Self {
        Self { seq, type_name, args }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        CallHeader::new(FunctionKind::CreateInstance, self.seq).encode(enc)?;
        enc.map_begin()?;
        enc.entry_str("type", self.type_name)?;
        encode_args(enc, self.args)?;
        enc.map_end()?;
        Ok(())
    }
}

/// Encodes a successful Reply (without its raw segments).
pub struct ReplyOkEncoder<'a> {
    pub seq: u64,
    pub result: &'a WireArg<'a>,
}

impl<'a> ReplyOkEncoder<'a> {
    pub fn new(seq: u64, result: &'a WireArg<'a>) -> Self {
        Self { seq, result }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        CallHeader::new(FunctionKind::Reply, self.seq).encode(enc)?;
        enc.result_ok_begin()?;
        enc.list_begin()?;
        self.result.encode(enc)?;
        enc.list_end()?;
        enc.result_ok_end()?;
        Ok(())
    }
}

/// Encodes a fault Reply.
pub struct ReplyErrEncoder<'a> {
    pub seq: u64,
    pub fault: &'a Fault,
}

impl<'a> ReplyErrEncoder<'a> {
    pub fn new(seq: u64, fault: &'a Fault) -> Self {
        Self { seq, fault }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        CallHeader::new(FunctionKind::Reply, self.seq).encode(enc)?;
        enc.result_err_begin()?;
        enc.map_begin()?;
        enc.entry_str("kind", self.fault.kind.as_tag())?;
        enc.entry_str("type", &self.fault.type_name)?;
        enc.entry_str("message", &self.fault.message)?;
        enc.map_end()?;
        enc.result_err_end()?;
        Ok(())
    }
}

pub fn encode_release(enc: &mut Encoder, seq: u64, object_id: &str, count: u64) -> Result<()> {
    CallHeader::new(FunctionKind::ReleaseInstance, seq).encode(enc)?;
    enc.map_begin()?;
    enc.entry_str("id", object_id)?;
    enc.entry_u64("count", count)?;
    enc.map_end()?;
    Ok(())
}

pub fn encode_shutdown(enc: &mut Encoder, seq: u64) -> Result<()> {
    CallHeader::new(FunctionKind::Shutdown, seq).encode(enc)?;
    enc.unit()?;
    Ok(())
}

/// A decoded inbound frame body, borrowing from the received bytes.
#[derive(Debug)]
pub enum Frame<'a> {
    MethodCall {
        target: &'a str,
        method: &'a str,
        args: Vec<WireArg<'a>>,
    },
    CreateInstance {
        type_name: &'a str,
        args: Vec<WireArg<'a>>,
    },
    Reply(std::result::Result<WireArg<'a>, Fault>),
    ReleaseInstance {
        object_id: &'a str,
        count: u64,
    },
    Shutdown,
}

/// A decoded frame plus the cursor over its trailing raw segments.
#[derive(Debug)]
pub struct Inbound<'a> {
    pub header: CallHeader,
    pub frame: Frame<'a>,
    pub segments: Decoder<'a>,
}

impl<'a> Inbound<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let header = CallHeader::decode(&mut dec)?;
        let frame = match header.kind {
            FunctionKind::MethodCall => decode_method_call(&mut dec)?,
            FunctionKind::CreateInstance => decode_create(&mut dec)?,
            FunctionKind::Reply => decode_reply(&mut dec)?,
            FunctionKind::ReleaseInstance => decode_release(&mut dec)?,
            FunctionKind::Shutdown => {
                dec.unit()?;
                Frame::Shutdown
            }
        };
        Ok(Self { header, frame, segments: dec })
    }
}

fn decode_method_call<'a>(dec: &mut Decoder<'a>) -> Result<Frame<'a>> {
    let mut map = dec.map()?;
    let mut target = None;
    let mut method = None;
    let mut argc = None;
    let mut args = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "target" => target = Some(val.str()?),
            "method" => method = Some(val.str()?),
            "argc" => argc = Some(val.u32()?),
            "args" => args = Some(val),
            _ => val.skip()?,
        }
    }
    let argc = argc.ok_or(Error::Protocol("call missing argc".into()))?;
    Ok(Frame::MethodCall {
        target: target.ok_or(Error::Protocol("call missing target".into()))?,
        method: method.ok_or(Error::Protocol("call missing method".into()))?,
        args: decode_args(args.ok_or(Error::Protocol("call missing args".into()))?, argc)?,
    })
}

fn decode_create<'a>(dec: &mut Decoder<'a>) -> Result<Frame<'a>> {
    let mut map = dec.map()?;
    let mut type_name = None;
    let mut argc = None;
    let mut args = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "type" => type_name = Some(val.str()?),
            "argc" => argc = Some(val.u32()?),
            "args" => args = Some(val),
            _ => val.skip()?,
        }
    }
    let argc = argc.ok_or(Error::Protocol("create missing argc".into()))?;
    Ok(Frame::CreateInstance {
        type_name: type_name.ok_or(Error::Protocol("create missing type".into()))?,
        args: decode_args(args.ok_or(Error::Protocol("create missing args".into()))?, argc)?,
    })
}

fn decode_reply<'a>(dec: &mut Decoder<'a>) -> Result<Frame<'a>> {
    match dec.result()? {
        Ok(body) => {
            let mut args = decode_args(body, 1)?;
            let result = args.pop().ok_or(Error::Protocol("reply without result".into()))?;
            Ok(Frame::Reply(Ok(result)))
        }
        Err(mut body) => {
            let mut map = body.map()?;
            let mut kind = None;
            let mut type_name = None;
            let mut message = None;
            while let Some((key, mut val)) = map.next()? {
                match key {
                    "kind" => kind = Some(FaultKind::from_tag(val.str()?)?),
                    "type" => type_name = Some(val.str()?),
                    "message" => message = Some(val.str()?),
                    _ => val.skip()?,
                }
            }
            Ok(Frame::Reply(Err(Fault::new(
                kind.ok_or(Error::Protocol("fault missing kind".into()))?,
                type_name.unwrap_or_default(),
                message.unwrap_or_default(),
            ))))
        }
    }
}

fn decode_release<'a>(dec: &mut Decoder<'a>) -> Result<Frame<'a>> {
    let mut map = dec.map()?;
    let mut object_id = None;
    let mut count = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "id" => object_id = Some(val.str()?),
            "count" => count = Some(val.u64()?),
            _ => val.skip()?,
        }
    }
    Ok(Frame::ReleaseInstance {
        object_id: object_id.ok_or(Error::Protocol("release missing id".into()))?,
        count: count.ok_or(Error::Protocol("release missing count".into()))?,
    })
}
