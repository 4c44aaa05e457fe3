//! Binary encoding used by the volume and journal wire formats.
//!
//! All integers are big-endian (see spec §6). This mirrors the donor
//! `Encodeable`/`Decodeable` traits in shape, but reads are fallible —
//! a journal tail can be truncated by a crash, and recovery must be able
//! to detect that instead of panicking mid-replay.

use std::convert::TryInto;

use crate::error::{EngineError, EngineResult};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self>;
}

/// An in-memory append buffer, used to build page images and journal
/// records before they're handed to the volume file or journal writer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(&obj.encode());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Pad (or truncate-check) to a fixed size, panicking if the buffer
    /// already overflowed the slot — an overflow here is an authoring bug,
    /// not a runtime condition a caller can recover from.
    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();
        assert!(
            buf.len() <= size,
            "encoded buffer {} larger than slot {}",
            buf.len(),
            size
        );
        buf.resize(size, 0);
        buf
    }
}

/// A cursor over a borrowed byte slice. Every read is bounds-checked and
/// returns `EngineError::CorruptJournal`/`CorruptVolume` instead of
/// panicking, since the caller (recovery replay, page verify) needs to
/// treat a truncated buffer as data, not as a programmer error.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn seek(&mut self, pos: usize) {
        self.cursor = pos;
    }

    pub fn read_exact(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(EngineError::CorruptJournal(format!(
                "truncated read: wanted {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn read<T: Decodeable>(&mut self) -> EngineResult<T> {
        T::decode_from(self)
    }
}

macro_rules! impl_int_codec {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
                    let bytes = reader.read_exact(std::mem::size_of::<Self>())?;
                    Ok(Self::from_be_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_int_codec!(for u8, u16, u32, u64, i8, i16, i32, i64);

impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

/// # Format
/// - 4 bytes: length
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.len());
        buf.extend_from_slice(&(self.len() as u32).to_be_bytes());
        buf.extend_from_slice(self);
        buf
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let len = u32::decode_from(reader)? as usize;
        Ok(reader.read_exact(len)?.to_vec())
    }
}

/// # Format
/// - 2 bytes: length
/// - n bytes: utf8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.len());
        buf.extend_from_slice(&(self.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf
    }
}

impl Decodeable for String {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let len = u16::decode_from(reader)? as usize;
        let bytes = reader.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::CorruptJournal(format!("invalid utf8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ints() {
        let mut w = ByteWriter::new();
        w.write(&0x0102_0304_0506_0708u64);
        w.write(&42u32);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut r = ByteReader::new(&bytes);
        let a: u64 = r.read().unwrap();
        let b: u32 = r.read().unwrap();
        assert_eq!(a, 0x0102_0304_0506_0708);
        assert_eq!(b, 42);
    }

    #[test]
    fn truncated_read_is_an_error_not_a_panic() {
        let bytes = vec![0u8; 3];
        let mut r = ByteReader::new(&bytes);
        let result: EngineResult<u64> = r.read();
        assert!(result.is_err());
    }

    #[test]
    fn vec_u8_round_trip() {
        let mut w = ByteWriter::new();
        let payload = vec![9u8, 8, 7, 6, 5];
        w.write(&payload);
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        let decoded: Vec<u8> = r.read().unwrap();
        assert_eq!(decoded, payload);
    }
}
