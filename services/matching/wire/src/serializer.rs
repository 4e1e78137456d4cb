//! Endian-aware binary serializer.
//!
//! Every primitive is stored in network (big-endian) order. The serializer
//! produces host-order bytes first and reverses them when the host is
//! little-endian, so the buffer holds the same bytes on every architecture.
//! Fixed-length byte arrays and text are stored as-is, zero-padded or
//! truncated to the declared length.
//!
//! Reads and writes share a single cursor that only moves forward.

use crate::error::CodecError;
use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;

/// Largest primitive handled by the serializer (u64/i64/f64)
const MAX_PRIMITIVE_SIZE: usize = 8;

/// Byte order of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    /// Most significant byte first (network order)
    BigEndian,
    /// Least significant byte first
    LittleEndian,
}

static HOST_ENDIANNESS: Lazy<Endianness> = Lazy::new(|| {
    if 1u32.to_ne_bytes()[0] == 1 {
        Endianness::LittleEndian
    } else {
        Endianness::BigEndian
    }
});

impl Endianness {
    /// Byte order of the running host, detected once per process
    pub fn host() -> Self {
        *HOST_ENDIANNESS
    }
}

/// Fixed-size value the serializer can write and read
pub trait Primitive: Copy {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the value in the byte order of `host`
    fn to_host_bytes(self, host: Endianness, out: &mut [u8]);

    /// Read a value laid out in the byte order of `host`
    fn from_host_bytes(host: Endianness, bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn to_host_bytes(self, host: Endianness, out: &mut [u8]) {
                    let bytes = match host {
                        Endianness::BigEndian => self.to_be_bytes(),
                        Endianness::LittleEndian => self.to_le_bytes(),
                    };
                    out.copy_from_slice(&bytes);
                }

                fn from_host_bytes(host: Endianness, bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    match host {
                        Endianness::BigEndian => <$ty>::from_be_bytes(raw),
                        Endianness::LittleEndian => <$ty>::from_le_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Primitive for bool {
    const SIZE: usize = 1;

    fn to_host_bytes(self, _host: Endianness, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn from_host_bytes(_host: Endianness, bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Growable encode/decode buffer with a forward-only cursor
#[derive(Debug, Clone)]
pub struct Serializer {
    buffer: BytesMut,
    offset: usize,
    endianness: Endianness,
}

impl Serializer {
    /// Create an empty serializer for the running host
    pub fn new() -> Self {
        Self::with_endianness(Endianness::host())
    }

    /// Create an empty serializer that treats the host as `endianness`
    pub fn with_endianness(endianness: Endianness) -> Self {
        Self {
            buffer: BytesMut::new(),
            offset: 0,
            endianness,
        }
    }

    /// Create a serializer holding `data` ready for decoding
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut serializer = Self::new();
        serializer.set_deserialized_data(data);
        serializer
    }

    /// Host byte order this serializer converts from
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Encoded bytes
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the serializer, returning the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Total number of bytes held
    pub fn data_size(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes left between the cursor and the end of the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    /// Zero the previous contents and reset the cursor
    pub fn clear(&mut self) {
        self.buffer.fill(0);
        self.buffer.clear();
        self.offset = 0;
    }

    /// Replace the contents with `data` and rewind the cursor to its start
    pub fn set_deserialized_data(&mut self, data: &[u8]) {
        self.clear();
        self.buffer.extend_from_slice(data);
    }

    /// Append a primitive in network order
    pub fn encode<T: Primitive>(&mut self, value: T) {
        let mut raw = [0u8; MAX_PRIMITIVE_SIZE];
        let raw = &mut raw[..T::SIZE];
        value.to_host_bytes(self.endianness, raw);
        if self.endianness == Endianness::LittleEndian {
            raw.reverse();
        }
        self.write_block(raw);
    }

    /// Read a primitive stored in network order
    pub fn decode<T: Primitive>(&mut self) -> Result<T, CodecError> {
        let mut raw = [0u8; MAX_PRIMITIVE_SIZE];
        let raw = &mut raw[..T::SIZE];
        self.read_block(raw)?;
        if self.endianness == Endianness::LittleEndian {
            raw.reverse();
        }
        Ok(T::from_host_bytes(self.endianness, raw))
    }

    /// Append exactly `length` bytes of `data`, zero-padded or truncated
    pub fn encode_bytes(&mut self, data: &[u8], length: usize) {
        let copy = data.len().min(length);
        self.write_block(&data[..copy]);
        self.write_zeros(length - copy);
    }

    /// Read a fixed-length byte array
    pub fn decode_bytes(&mut self, length: usize) -> Result<Vec<u8>, CodecError> {
        let mut data = vec![0u8; length];
        self.read_block(&mut data)?;
        Ok(data)
    }

    /// Append UTF-8 text as a fixed `length`-byte field
    ///
    /// Text longer than the field is cut at the last character boundary that
    /// fits; shorter text is padded with NUL bytes.
    pub fn encode_str(&mut self, text: &str, length: usize) {
        let mut end = text.len().min(length);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.encode_bytes(&text.as_bytes()[..end], length);
    }

    /// Read a fixed `length`-byte text field, dropping trailing NUL padding
    pub fn decode_str(&mut self, length: usize) -> Result<String, CodecError> {
        let data = self.decode_bytes(length)?;
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8(data[..end].to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn write_block(&mut self, block: &[u8]) {
        let end = self.offset + block.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.offset..end].copy_from_slice(block);
        self.offset = end;
    }

    fn write_zeros(&mut self, count: usize) {
        let end = self.offset + count;
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.offset..end].fill(0);
        self.offset = end;
    }

    fn read_block(&mut self, out: &mut [u8]) -> Result<(), CodecError> {
        if self.buffer.is_empty() {
            return Err(CodecError::Empty);
        }

        let remaining = self.remaining();
        if remaining < out.len() {
            return Err(CodecError::Short {
                needed: out.len(),
                remaining,
            });
        }

        out.copy_from_slice(&self.buffer[self.offset..self.offset + out.len()]);
        self.offset += out.len();
        Ok(())
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}
