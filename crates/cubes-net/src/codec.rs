//! Payload encoding for packet bodies.
//!
//! Scalars are big-endian and strings carry a `u16` byte-length prefix, so a
//! payload written here reads the same as one produced by a `DataOutputStream`
//! peer. Structured fields that have no hand-written layout can go through
//! [`PacketWriter::write_serde`], which embeds a length-prefixed [`postcard`]
//! blob.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Largest string (in UTF-8 bytes) a `u16` length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Errors produced while encoding or decoding a packet payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before the field was complete.
    #[error("unexpected end of payload: needed {needed} more bytes")]
    UnexpectedEnd {
        /// Bytes still required by the field being read.
        needed: usize,
    },

    /// A string does not fit the `u16` length prefix.
    #[error("string of {0} bytes exceeds the {MAX_STRING_LEN} byte limit")]
    StringTooLong(usize),

    /// A string field held bytes that are not UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// An embedded postcard blob failed to (de)serialize.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),

    /// A decoded value is outside its legal range.
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Growable buffer a packet encodes its fields into.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a `u16`-length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<(), CodecError> {
        let len = value.len();
        if len > MAX_STRING_LEN {
            return Err(CodecError::StringTooLong(len));
        }
        self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write a `u32`-length-prefixed byte blob.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(value.len())
            .map_err(|_| CodecError::Invalid(format!("blob of {} bytes", value.len())))?;
        self.write_u32(len);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Serialize `value` with postcard and write it as a byte blob.
    pub fn write_serde<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let body = postcard::to_allocvec(value)?;
        self.write_bytes(&body)
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer and return the encoded payload.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether every byte of the payload has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Invalid(format!("boolean byte {other}"))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let len = u16::from_be_bytes(self.take_array()?) as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    /// Read a `u32`-length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a byte blob and deserialize it with postcard.
    pub fn read_serde<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let body = self.read_bytes()?;
        Ok(postcard::from_bytes(&body)?)
    }
}
