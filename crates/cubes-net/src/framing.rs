//! Steady-state frames and the primitive stream helpers the handshake uses.
//!
//! Every packet on an established connection is one frame:
//!
//! ```text
//! +------+---------------------------+-------------------+-----------+
//! | kind | header                    | length (4 bytes)  | payload   |
//! | u8   | 0: u16 len + UTF-8 name   | u32 big-endian    | (length)  |
//! |      | 1: i32 big-endian tag     |                   |           |
//! +------+---------------------------+-------------------+-----------+
//! ```
//!
//! A type name is sent the first time a type crosses a connection, the compact
//! tag afterwards. All integers are big-endian.

use std::io::{self, ErrorKind, Read, Write};

use crate::codec::MAX_STRING_LEN;

const HEADER_NAME: u8 = 0;
const HEADER_TAG: u8 = 1;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u64, max: u32 },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The first byte of a frame is neither a name nor a tag marker.
    #[error("unknown frame header {0}")]
    UnknownHeader(u8),

    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl FrameError {
    /// Whether this is a read that gave up because of a socket timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == ErrorKind::UnexpectedEof {
            FrameError::ConnectionClosed
        } else {
            FrameError::Io(e)
        }
    }
}

/// How a frame identifies its packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameHeader {
    /// Fully-qualified type name, used on first occurrence.
    Name(String),
    /// Negotiated compact tag.
    Tag(i32),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Read a single frame. Blocks until the whole frame has arrived.
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let header = match read_u8(reader)? {
        HEADER_NAME => FrameHeader::Name(read_string(reader)?),
        HEADER_TAG => FrameHeader::Tag(read_i32(reader)?),
        other => return Err(FrameError::UnknownHeader(other)),
    };

    let len = read_u32(reader)?;
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: u64::from(len),
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Frame { header, payload })
}

/// Write a single frame. Does not flush.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    header: &FrameHeader,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = payload.len() as u64;
    if len > u64::from(config.max_payload_size) {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    match header {
        FrameHeader::Name(name) => {
            write_u8(writer, HEADER_NAME)?;
            write_string(writer, name)?;
        }
        FrameHeader::Tag(tag) => {
            write_u8(writer, HEADER_TAG)?;
            write_i32(writer, *tag)?;
        }
    }
    write_u32(writer, len as u32)?;
    writer.write_all(payload)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Primitive stream helpers
// ---------------------------------------------------------------------------

pub fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, FrameError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32, FrameError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, FrameError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a `u16`-length-prefixed UTF-8 string.
pub fn read_string<R: Read + ?Sized>(reader: &mut R) -> Result<String, FrameError> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u16::from_be_bytes(len) as usize];
    reader.read_exact(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn write_u8<W: Write + ?Sized>(writer: &mut W, value: u8) -> Result<(), FrameError> {
    writer.write_all(&[value])?;
    Ok(())
}

pub fn write_i32<W: Write + ?Sized>(writer: &mut W, value: i32) -> Result<(), FrameError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<(), FrameError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

/// Write a `u16`-length-prefixed UTF-8 string.
pub fn write_string<W: Write + ?Sized>(writer: &mut W, value: &str) -> Result<(), FrameError> {
    let len = value.len();
    if len > MAX_STRING_LEN {
        return Err(FrameError::StringTooLong(len));
    }
    writer.write_all(&(len as u16).to_be_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}
