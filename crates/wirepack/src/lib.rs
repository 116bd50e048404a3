//! # Wirepack
//!
//! The byte layout every remoting frame is written in.
//!
//! A frame is a run of tagged items followed by zero or more raw segments.
//! Tagged items describe the message (call headers, descriptors, inline
//! arguments); raw segments carry manual-binary payloads whose sizes were
//! announced by a tagged item earlier in the same frame.
//!
//! The encoder keeps a stack of open containers and fills in each length
//! when its container closes, so bytes can only be taken once every
//! container is closed. Every tagged item that is not a fixed-width scalar
//! carries its length, which lets a reader step over fields it does not know.
//!
//! ## Layout
//!
//! | item            | bytes                              |
//! |-----------------|------------------------------------|
//! | fixed scalar    | tag, then 0, 1, 4 or 8 data bytes  |
//! | string / bytes  | tag, `u32` length, data            |
//! | container       | tag, `u32` body length, body       |
//! | raw segment     | data only                          |
//!
//! Numbers and lengths are little-endian.

#[cfg(test)]
mod tests;

/// Failures while writing or reading a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No tag has this byte value.
    InvalidTag(u8),
    /// The next item is not of the type the caller asked for.
    UnexpectedTag { expected: Tag, found: Tag },
    /// A string item holds bytes that are not UTF-8.
    InvalidUtf8,
    /// The innermost open container is of another kind.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Nothing is open to close.
    ScopeUnderflow,
    /// Bytes were requested while a container was still open.
    ScopeStillOpen,
    /// The input ends in the middle of an item.
    UnexpectedEnd,
    /// A length does not fit the 4-byte prefix.
    TooLarge(usize),
    /// A single-item container got a second item.
    TooManyItems(Scope),
    /// A single-item container was closed empty.
    EmptyAdt(Scope),
    /// Maps hold named entries only.
    InvalidMapEntry,
    /// Raw segments may only be written at the root.
    RawOutsideRoot,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, found } => {
                write!(f, "expected tag {:?}, found {:?}", expected, found)
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::TooManyItems(s) => write!(f, "too many items in scope {:?}; expected exactly 1", s),
            Error::EmptyAdt(s) => write!(f, "empty scope {:?}; expected exactly 1 item", s),
            Error::TooLarge(n) => write!(f, "length {} exceeds u32::MAX", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// First byte of every tagged item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U8 = 0x03,
    U32 = 0x05,
    U64 = 0x06,
    S64 = 0x0A,
    F64 = 0x0C,

    Unit = 0x0E,
    OptionNone = 0x0F,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,

    // ADTs (Tag + u32 Len + Body)
    OptionSome = 0x30,
    ResultOk = 0x31,
    ResultErr = 0x32,
    Variant = 0x33,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Tag::BoolTrue,
            0x02 => Tag::BoolFalse,
            0x03 => Tag::U8,
            0x05 => Tag::U32,
            0x06 => Tag::U64,
            0x0A => Tag::S64,
            0x0C => Tag::F64,
            0x0E => Tag::Unit,
            0x0F => Tag::OptionNone,
            0x10 => Tag::String,
            0x11 => Tag::Bytes,
            0x20 => Tag::List,
            0x21 => Tag::Map,
            0x30 => Tag::OptionSome,
            0x31 => Tag::ResultOk,
            0x32 => Tag::ResultErr,
            0x33 => Tag::Variant,
            _ => return None,
        })
    }

    /// Data bytes after a fixed-width tag. `None` means a length prefix follows.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Unit | Tag::OptionNone => Some(0),
            Tag::U8 => Some(1),
            Tag::U32 => Some(4),
            Tag::U64 | Tag::S64 | Tag::F64 => Some(8),
            _ => None,
        }
    }
}

/// Kinds of container the encoder can have open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Top level of the frame. Any item, and raw segments.
    Root,
    /// Any number of items, in order.
    List,
    /// Named entries, written with `variant_begin`.
    Map,
    Option,
    Result,
    /// A name followed by one payload item.
    Variant,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// Writes one frame into a buffer, refusing malformed nesting as it goes.
///
/// Option, Result and Variant containers take exactly one item; maps take
/// only named entries. Raw segments go at the top level, after the tagged
/// items that announce them.
pub struct Encoder {
    buf: Vec<u8>,
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_buffer(Vec::with_capacity(256))
    }

    /// Reuses `buf`, discarding whatever it held.
    pub fn with_buffer(mut buf: Vec<u8>) -> Self {
        buf.clear();
        let mut stack = Vec::with_capacity(8);
        stack.push(Frame { start: 0, scope: Scope::Root, count: 0 });
        Self { buf, stack }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The finished frame. Fails with `ScopeStillOpen` while any container is open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn current(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Option | Scope::Result | Scope::Variant if frame.count >= 1 => {
                Err(Error::TooManyItems(frame.scope))
            }
            Scope::Option | Scope::Result | Scope::Variant => Ok(()),
        }
    }

    fn item_written(&mut self) {
        self.current().count += 1;
    }

    fn scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.item_written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::TooLarge(data.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.item_written();
        Ok(())
    }

    fn begin(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let frame = self.current();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if matches!(frame.scope, Scope::Option | Scope::Result | Scope::Variant) && frame.count == 0 {
            return Err(Error::EmptyAdt(frame.scope));
        }

        let start = frame.start;
        self.stack.pop();
        let body_len = self.buf.len() - start;
        let len = u32::try_from(body_len).map_err(|_| Error::TooLarge(body_len))?;
        self.buf[start - 4..start].copy_from_slice(&len.to_le_bytes());
        self.item_written();
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    pub fn u8(&mut self, v: u8) -> Result<()> { self.scalar(Tag::U8, &[v]) }
    pub fn u32(&mut self, v: u32) -> Result<()> { self.scalar(Tag::U32, &v.to_le_bytes()) }
    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Tag::U64, &v.to_le_bytes()) }
    pub fn s64(&mut self, v: i64) -> Result<()> { self.scalar(Tag::S64, &v.to_le_bytes()) }
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Tag::F64, &v.to_le_bytes()) }
    pub fn unit(&mut self) -> Result<()> { self.scalar(Tag::Unit, &[]) }
    pub fn option_none(&mut self) -> Result<()> { self.scalar(Tag::OptionNone, &[]) }

    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    /// Appends bytes with no tag or length. The reader learns `data.len()`
    /// from a tagged item written earlier.
    pub fn raw(&mut self, data: &[u8]) -> Result<()> {
        if self.stack.len() > 1 {
            return Err(Error::RawOutsideRoot);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn list_begin(&mut self) -> Result<()> { self.begin(Tag::List, Scope::List) }
    pub fn list_end(&mut self) -> Result<()> { self.end(Scope::List) }

    /// Opens a map. Its entries are written with `variant_begin` or the `entry_*` helpers.
    pub fn map_begin(&mut self) -> Result<()> { self.begin(Tag::Map, Scope::Map) }
    pub fn map_end(&mut self) -> Result<()> { self.end(Scope::Map) }

    pub fn option_some_begin(&mut self) -> Result<()> { self.begin(Tag::OptionSome, Scope::Option) }
    pub fn option_some_end(&mut self) -> Result<()> { self.end(Scope::Option) }

    /// Opens the success side of a reply. One item must follow.
    pub fn result_ok_begin(&mut self) -> Result<()> { self.begin(Tag::ResultOk, Scope::Result) }
    pub fn result_ok_end(&mut self) -> Result<()> { self.end(Scope::Result) }

    /// Opens the failure side of a reply. One item must follow.
    pub fn result_err_begin(&mut self) -> Result<()> { self.begin(Tag::ResultErr, Scope::Result) }
    pub fn result_err_end(&mut self) -> Result<()> { self.end(Scope::Result) }

    /// Opens an item tagged with `name`; the next item written is its payload.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // the name is metadata, not the payload
        self.current().count = 0;
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<()> { self.end(Scope::Variant) }

    /// Shorthand for a map entry holding a `u64`.
    pub fn entry_u64(&mut self, key: &str, v: u64) -> Result<()> {
        self.variant_begin(key)?;
        self.u64(v)?;
        self.variant_end()
    }

    pub fn entry_str(&mut self, key: &str, v: &str) -> Result<()> {
        self.variant_begin(key)?;
        self.str(v)?;
        self.variant_end()
    }
}

/// Reads items from a received frame without copying them.
///
/// Entering a container yields a decoder that sees only that container's
/// body, so a bad length inside one argument cannot read into the next.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// The type of the next item. Consumes nothing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?) as usize)
    }

    fn expect(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.take(1)?;
        Ok(())
    }

    /// Steps over the next item, whatever it holds.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        let len = match tag.fixed_width() {
            Some(width) => width,
            None => self.read_len()?,
        };
        self.take(len)?;
        Ok(())
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.take(1)?; Ok(true) }
            Tag::BoolFalse => { self.take(1)?; Ok(false) }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    pub fn u8(&mut self) -> Result<u8> { self.expect(Tag::U8)?; Ok(self.take_array::<1>()?[0]) }
    pub fn u32(&mut self) -> Result<u32> { self.expect(Tag::U32)?; Ok(u32::from_le_bytes(self.take_array()?)) }
    pub fn u64(&mut self) -> Result<u64> { self.expect(Tag::U64)?; Ok(u64::from_le_bytes(self.take_array()?)) }
    pub fn s64(&mut self) -> Result<i64> { self.expect(Tag::S64)?; Ok(i64::from_le_bytes(self.take_array()?)) }
    pub fn f64(&mut self) -> Result<f64> { self.expect(Tag::F64)?; Ok(f64::from_le_bytes(self.take_array()?)) }
    pub fn unit(&mut self) -> Result<()> { self.expect(Tag::Unit) }

    /// Borrows the string from the frame.
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect(Tag::String)?;
        let len = self.read_len()?;
        std::str::from_utf8(self.take(len)?).map_err(|_| Error::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect(Tag::Bytes)?;
        let len = self.read_len()?;
        self.take(len)
    }

    /// Takes the next `len` bytes as a raw segment.
    pub fn raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    fn enter(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.expect(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.take(len)?))
    }

    /// Enters a list. Each step of the iterator yields one item's bytes.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    /// Enters a map of named entries.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter(Tag::Map)? })
    }

    /// `None` for an empty option, otherwise a decoder over the payload.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => { self.take(1)?; Ok(None) }
            Tag::OptionSome => Ok(Some(self.enter(Tag::OptionSome)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::OptionSome, found }),
        }
    }

    /// Splits a reply into its success or failure payload.
    pub fn result(&mut self) -> Result<std::result::Result<Decoder<'a>, Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::ResultOk => Ok(Ok(self.enter(Tag::ResultOk)?)),
            Tag::ResultErr => Ok(Err(self.enter(Tag::ResultErr)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::ResultOk, found }),
        }
    }

    /// The tag name and a decoder over the payload.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Walks the items of a list, one decoder per item.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// `Ok(None)` once the list body is used up.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut ahead = self.dec.clone();
        ahead.skip()?;
        let len = self.dec.remaining() - ahead.remaining();
        Ok(Some(Decoder::new(self.dec.take(len)?)))
    }
}

/// Walks the named entries of a map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let found = self.dec.peek_tag()?;
        if found != Tag::Variant {
            return Err(Error::UnexpectedTag { expected: Tag::Variant, found });
        }
        self.dec.variant().map(Some)
    }
}
