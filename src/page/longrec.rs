//! Long records (spec §4.D): values too large for a single page are
//! chained across dedicated pages; the leaf's tail block holds only a
//! marker byte plus a handle to the chain head.

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};
use crate::volume::{PageId, Volume};

/// First byte of a leaf tail block that is a long-record marker rather
/// than an inline value. Chosen outside the MVV type-tag space (0xFE) and
/// the tombstone-adjacent range so the two encodings can never collide.
pub const LONG_RECORD_MARKER: u8 = 0xFD;

const CHAIN_HEADER_SIZE: usize = 12; // next: u64, payload_len: u32

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongRecordHandle {
    pub head_page: PageId,
    pub total_len: u32,
}

impl Encodeable for LongRecordHandle {
    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(13);
        w.write(&LONG_RECORD_MARKER);
        w.write(&self.head_page);
        w.write(&self.total_len);
        w.into_bytes()
    }
}

impl Decodeable for LongRecordHandle {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let marker: u8 = reader.read()?;
        if marker != LONG_RECORD_MARKER {
            return Err(EngineError::CorruptValue(format!(
                "expected long-record marker {:#x}, found {:#x}",
                LONG_RECORD_MARKER, marker
            )));
        }
        Ok(Self {
            head_page: reader.read()?,
            total_len: reader.read()?,
        })
    }
}

/// Write `data` across a freshly allocated chain of pages and return a
/// handle to store in the owning leaf's tail block.
pub fn write_chain(volume: &Volume, data: &[u8]) -> EngineResult<LongRecordHandle> {
    let page_size = volume.page_size();
    let payload_capacity = page_size - CHAIN_HEADER_SIZE;
    let total_len = data.len() as u32;

    let mut page_ids = Vec::new();
    let mut offset = 0;
    while offset < data.len() || page_ids.is_empty() {
        page_ids.push(volume.alloc_new_page()?);
        offset += payload_capacity.min(data.len() - offset);
        if offset >= data.len() {
            break;
        }
    }

    let mut offset = 0;
    for (i, &page_id) in page_ids.iter().enumerate() {
        let chunk_len = payload_capacity.min(data.len() - offset);
        let next = page_ids.get(i + 1).copied().unwrap_or(0);

        let mut w = ByteWriter::with_capacity(page_size);
        w.write(&next);
        w.write(&(chunk_len as u32));
        w.write_bytes(&data[offset..offset + chunk_len]);
        volume.write_page(page_id, &w.to_padded_bytes(page_size))?;

        offset += chunk_len;
    }

    Ok(LongRecordHandle {
        head_page: page_ids[0],
        total_len,
    })
}

pub fn read_chain(volume: &Volume, handle: &LongRecordHandle) -> EngineResult<Vec<u8>> {
    let page_size = volume.page_size();
    let mut out = Vec::with_capacity(handle.total_len as usize);
    let mut page_id = handle.head_page;
    let mut buf = vec![0u8; page_size];

    loop {
        volume.read_page(page_id, &mut buf)?;
        let mut reader = ByteReader::new(&buf);
        let next: PageId = reader.read()?;
        let chunk_len: u32 = reader.read()?;
        out.extend_from_slice(reader.read_exact(chunk_len as usize)?);
        if next == 0 {
            break;
        }
        page_id = next;
    }

    if out.len() != handle.total_len as usize {
        return Err(EngineError::CorruptValue(format!(
            "long record chain at page {} yielded {} bytes, expected {}",
            handle.head_page,
            out.len(),
            handle.total_len
        )));
    }
    Ok(out)
}

pub fn free_chain(volume: &Volume, handle: &LongRecordHandle) -> EngineResult<()> {
    let page_size = volume.page_size();
    let mut page_id = handle.head_page;
    let mut buf = vec![0u8; page_size];
    loop {
        volume.read_page(page_id, &mut buf)?;
        let mut reader = ByteReader::new(&buf);
        let next: PageId = reader.read()?;
        volume.deallocate_page(page_id)?;
        if next == 0 {
            break;
        }
        page_id = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VolumeOpenMode, VolumeSpec};

    fn test_volume(dir: &std::path::Path) -> Volume {
        let spec = VolumeSpec {
            name: "v".to_string(),
            path: dir.join("v.vol"),
            create: VolumeOpenMode::Create,
            page_size: 256,
            initial_pages: 2,
            extension_pages: 2,
            maximum_pages: 1000,
        };
        Volume::open(&spec).unwrap()
    }

    #[test]
    fn round_trips_a_value_spanning_several_pages() {
        let dir = tempfile::tempdir().unwrap();
        let volume = test_volume(dir.path());
        let data: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();

        let handle = write_chain(&volume, &data).unwrap();
        let read_back = read_chain(&volume, &handle).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn handle_round_trips_through_bytes() {
        let handle = LongRecordHandle {
            head_page: 7,
            total_len: 900,
        };
        let mut reader = ByteReader::new(&handle.encode());
        let decoded = LongRecordHandle::decode_from(&mut reader).unwrap();
        assert_eq!(decoded, handle);
    }

    #[test]
    fn free_chain_returns_every_page_to_the_garbage_list() {
        let dir = tempfile::tempdir().unwrap();
        let volume = test_volume(dir.path());
        let data = vec![9u8; 1000];
        let handle = write_chain(&volume, &data).unwrap();

        let mut chain_pages = Vec::new();
        let mut page_id = handle.head_page;
        let mut buf = vec![0u8; volume.page_size()];
        loop {
            volume.read_page(page_id, &mut buf).unwrap();
            let mut reader = ByteReader::new(&buf);
            let next: PageId = reader.read().unwrap();
            chain_pages.push(page_id);
            if next == 0 {
                break;
            }
            page_id = next;
        }

        free_chain(&volume, &handle).unwrap();

        let reused = volume.alloc_new_page().unwrap();
        assert!(chain_pages.contains(&reused));
    }
}
