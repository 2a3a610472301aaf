//! Raw building blocks shared by every record in this module: undecoded
//! strings and byte blobs, and the little-endian writes that serialize
//! records back out.

use pretty_hex::PrettyHex;
use std::fmt;
use winnow::{stream::ToUsize, token::take, PResult, Parser, Partial};

/// Extends byte buffers with little-endian integer writes: the write-side
/// counterpart of the `le_u16`/`le_u32`/`le_u64` parsers everything in this
/// module is read with. Record serializers are built out of these.
pub(crate) trait PutLe {
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    fn put_u64(&mut self, value: u64);
}

impl PutLe for Vec<u8> {
    #[inline]
    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, value: u64) {
        self.extend_from_slice(&value.to_le_bytes());
    }
}

/// A string of bytes from a zip archive, in no particular encoding.
///
/// Names and comments stay raw like this until the archive's encoding is
/// known; on the way out they are written back exactly as they came, so
/// unicode extra fields keep matching their CRC.
#[derive(Clone, PartialEq, Eq)]
pub struct ZipString(pub Vec<u8>);

impl ZipString {
    pub(crate) fn parser<C>(count: C) -> impl FnMut(&mut Partial<&'_ [u8]>) -> PResult<Self>
    where
        C: ToUsize,
    {
        let count = count.to_usize();
        move |i| {
            let slice: &[u8] = take(count).parse_next(i)?;
            Ok(Self(slice.to_vec()))
        }
    }

    /// Length in bytes, the way record length fields store it.
    pub fn byte_len(&self) -> u16 {
        self.0.len() as u16
    }

    /// Append the raw bytes to a record being serialized.
    pub(crate) fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    /// Some if the string is non-empty
    pub fn into_option(self) -> Option<Self> {
        (!self.0.is_empty()).then_some(self)
    }
}

impl fmt::Debug for ZipString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(&self.0) {
            fmt::Debug::fmt(s, f)
        } else {
            write!(f, "[non-utf8 string: {}]", self.0.hex_dump())
        }
    }
}

/// An opaque byte region from a zip archive, kept owned so it can be parsed
/// later (extra fields) or written back verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct ZipBytes(pub Vec<u8>);

impl ZipBytes {
    pub(crate) fn parser<C>(count: C) -> impl FnMut(&mut Partial<&'_ [u8]>) -> PResult<Self>
    where
        C: ToUsize,
    {
        let count = count.to_usize();
        move |i| {
            let slice: &[u8] = take(count).parse_next(i)?;
            Ok(Self(slice.to_vec()))
        }
    }

    /// Length in bytes, the way record length fields store it.
    pub fn byte_len(&self) -> u16 {
        self.0.len() as u16
    }

    /// Append the raw bytes to a record being serialized.
    pub(crate) fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl fmt::Debug for ZipBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const MAX_SHOWN_SIZE: usize = 10;
        if self.0.len() <= MAX_SHOWN_SIZE {
            write!(f, "{}", self.0.hex_dump())
        } else {
            write!(
                f,
                "{} (+ {} bytes)",
                self.0[..MAX_SHOWN_SIZE].hex_dump(),
                self.0.len() - MAX_SHOWN_SIZE
            )
        }
    }
}
