//! Garbage chain page layout (spec §4.B): a singly linked list of pages
//! holding lists of freed page numbers, head pointer kept in the volume
//! header. Freshly freed pages are prepended.

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::EngineResult;

/// `next(8) | count(4) | freePageIds(8 each)`.
const GARBAGE_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarbagePage {
    pub next: u64,
    pub free_pages: Vec<u64>,
}

impl GarbagePage {
    pub fn empty() -> Self {
        Self {
            next: 0,
            free_pages: Vec::new(),
        }
    }

    pub fn capacity(page_size: usize) -> usize {
        (page_size - GARBAGE_HEADER_LEN) / 8
    }

    pub fn is_full(&self, page_size: usize) -> bool {
        self.free_pages.len() >= Self::capacity(page_size)
    }

    pub fn encode_padded(&self, page_size: usize) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(page_size);
        writer.write(&self.next);
        writer.write(&(self.free_pages.len() as u32));
        for id in &self.free_pages {
            writer.write(id);
        }
        writer.to_padded_bytes(page_size)
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let next: u64 = reader.read()?;
        let count: u32 = reader.read()?;
        let mut free_pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            free_pages.push(reader.read()?);
        }
        Ok(GarbagePage { next, free_pages })
    }
}

impl Encodeable for GarbagePage {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(GARBAGE_HEADER_LEN + self.free_pages.len() * 8);
        writer.write(&self.next);
        writer.write(&(self.free_pages.len() as u32));
        for id in &self.free_pages {
            writer.write(id);
        }
        writer.into_bytes()
    }
}

impl Decodeable for GarbagePage {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let next: u64 = reader.read()?;
        let count: u32 = reader.read()?;
        let mut free_pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            free_pages.push(reader.read()?);
        }
        Ok(GarbagePage { next, free_pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_padded() {
        let page = GarbagePage {
            next: 42,
            free_pages: vec![1, 2, 3],
        };
        let bytes = page.encode_padded(1024);
        assert_eq!(bytes.len(), 1024);
        let decoded = GarbagePage::decode(&bytes).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn capacity_reflects_page_size() {
        assert_eq!(GarbagePage::capacity(1024), (1024 - 12) / 8);
    }
}
