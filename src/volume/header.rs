//! Volume page 0 (the superblock), spec §6 "Volume file format".

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};

/// Distinguishes this engine's volume files from anything else that might
/// share a `.vol` extension on disk.
pub const MAGIC: [u8; 10] = *b"KAPPASTOR\0";
pub const HEADER_VERSION: u16 = 1;

/// Page 0 of every volume file: magic, page size, allocation cursor,
/// directory-tree root, garbage-chain head, and the volume's journal
/// handle (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub page_size: u32,
    pub pages_allocated: u64,
    pub next_available_page: u64,
    pub directory_root: u64,
    pub garbage_head: u64,
    pub handle: u32,
}

impl VolumeHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            pages_allocated: 1, // page 0 itself
            next_available_page: 1,
            directory_root: 0,
            garbage_head: 0,
            handle: 0,
        }
    }
}

impl Encodeable for VolumeHeader {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.page_size as usize);
        writer.write_bytes(&MAGIC);
        writer.write(&HEADER_VERSION);
        writer.write(&self.page_size);
        writer.write(&self.pages_allocated);
        writer.write(&self.next_available_page);
        writer.write(&self.directory_root);
        writer.write(&self.garbage_head);
        writer.write(&self.handle);
        writer.to_padded_bytes(self.page_size as usize)
    }
}

impl Decodeable for VolumeHeader {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let magic = reader.read_exact(MAGIC.len())?;
        if magic != MAGIC {
            return Err(EngineError::CorruptVolume(
                "volume header magic mismatch".to_string(),
            ));
        }
        let version: u16 = reader.read()?;
        if version != HEADER_VERSION {
            return Err(EngineError::CorruptVolume(format!(
                "unsupported volume header version {}",
                version
            )));
        }
        let page_size: u32 = reader.read()?;
        let pages_allocated: u64 = reader.read()?;
        let next_available_page: u64 = reader.read()?;
        let directory_root: u64 = reader.read()?;
        let garbage_head: u64 = reader.read()?;
        let handle: u32 = reader.read()?;
        Ok(VolumeHeader {
            page_size,
            pages_allocated,
            next_available_page,
            directory_root,
            garbage_head,
            handle,
        })
    }
}
