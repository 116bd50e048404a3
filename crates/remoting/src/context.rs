//! # Serialization Context
//!
//! Carries manual-binary payloads between the two passes of one frame.
//!
//! Writing: the structured pass calls `enqueue` for each manual value, which
//! returns the placeholder to embed. After all tagged items are written,
//! `drain_into` appends the payloads as raw segments in enqueue order.
//!
//! Reading: placeholders are collected in document order, then `load` reads
//! one raw segment per placeholder. A length that does not match, a missing
//! segment or trailing bytes are all `Serialization` errors.

use std::any::Any;
use std::sync::Arc;

use wirepack::Decoder;
use wirepack::Encoder;

use crate::descriptor::ManualPlaceholder;
use crate::error::Error;
use crate::error::Result;
use crate::surrogate::Surrogate;

struct QueuedPayload<'a> {
    surrogate: &'a Surrogate,
    object: Arc<dyn Any + Send + Sync>,
    declared_len: usize,
}

/// Per-frame queue of manual-binary payloads awaiting the raw pass.
#[derive(Default)]
pub struct SerializationContext<'a> {
    queued: Vec<QueuedPayload<'a>>,
}

impl<'a> SerializationContext<'a> {
    pub fn new() -> Self {
        Self { queued: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Queues a payload and returns the placeholder that marks its position.
    pub(crate) fn enqueue(
        &mut self,
        surrogate: &'a Surrogate,
        object: &Arc<dyn Any + Send + Sync>,
    ) -> Result<ManualPlaceholder> {
        let declared_len = surrogate.manual_len(object.as_ref())?;
        let slot = u32::try_from(self.queued.len())
            .map_err(|_| Error::Serialization("too many manual payloads".into()))?;
        self.queued.push(QueuedPayload { surrogate, object: object.clone(), declared_len });
        Ok(ManualPlaceholder {
            manual_binary: surrogate.name().to_string(),
            length: declared_len as u64,
            slot,
        })
    }

    /// Writes every queued payload as a raw segment, in enqueue order.
    pub fn drain_into(&mut self, enc: &mut Encoder) -> Result<()> {
        let mut scratch = Vec::new();
        for payload in self.queued.drain(..) {
            scratch.clear();
            payload.surrogate.manual_write(payload.object.as_ref(), &mut scratch)?;
            if scratch.len() != payload.declared_len {
                return Err(Error::Serialization(format!(
                    "{} declared {} bytes but wrote {}",
                    payload.surrogate.name(),
                    payload.declared_len,
                    scratch.len()
                )));
            }
            enc.raw(&scratch)?;
        }
        Ok(())
    }
}

/// Raw segments of one inbound frame, indexed by placeholder slot.
#[derive(Debug, Default)]
pub struct ReadContext<'a> {
    segments: Vec<(String, &'a [u8])>,
}

impl<'a> ReadContext<'a> {
    /// Reads one segment per placeholder, in order, and requires the frame to end there.
    pub fn load(placeholders: &[ManualPlaceholder], dec: &mut Decoder<'a>) -> Result<Self> {
        let mut segments = Vec::with_capacity(placeholders.len());
        for (index, placeholder) in placeholders.iter().enumerate() {
            if placeholder.slot as usize != index {
                return Err(Error::Serialization(format!(
                    "manual payload {} found at position {}",
                    placeholder.slot, index
                )));
            }
            let len = usize::try_from(placeholder.length)
                .map_err(|_| Error::Serialization("manual payload length overflow".into()))?;
            let bytes = dec.raw(len).map_err(|_| {
                Error::Serialization(format!(
                    "{} declared {} bytes but the frame is shorter",
                    placeholder.manual_binary, len
                ))
            })?;
            segments.push((placeholder.manual_binary.clone(), bytes));
        }
        if dec.remaining() != 0 {
            return Err(Error::Serialization(format!(
                "{} unclaimed bytes after manual payloads",
                dec.remaining()
            )));
        }
        Ok(Self { segments })
    }

    pub fn segment(&self, placeholder: &ManualPlaceholder) -> Result<&'a [u8]> {
        match self.segments.get(placeholder.slot as usize) {
            Some((name, bytes)) if *name == placeholder.manual_binary => Ok(*bytes),
            _ => Err(Error::Serialization(format!(
                "no payload for {} at slot {}",
                placeholder.manual_binary, placeholder.slot
            ))),
        }
    }
}
