//! 4.B Volume / Storage: a file-backed paged store with a page allocator
//! and garbage chain.
//!
//! Grounded on the donor's `utils/io.rs` `SmallFile` (a `Mutex<File>`
//! wrapper giving every reader/writer a consistent seek+read/write unit)
//! generalized from SimpleDB's fixed-size-tuple pages to this engine's
//! opaque, caller-sized page images.

pub mod garbage;
pub mod header;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::codec::{ByteReader, Decodeable, Encodeable};
use crate::config::{VolumeOpenMode, VolumeSpec};
use crate::error::{EngineError, EngineResult};
use garbage::GarbagePage;
use header::VolumeHeader;

pub type PageId = u64;

/// A single paged file. All I/O is mediated through one `Mutex<File>` so
/// concurrent callers (buffer-pool eviction, recovery replay, the page
/// writer) never interleave partial reads/writes of the same page.
pub struct Volume {
    pub name: String,
    path: PathBuf,
    page_size: usize,
    maximum_pages: u64,
    extension_pages: u64,
    file: Mutex<File>,
    header: Mutex<VolumeHeader>,
}

impl Volume {
    pub fn open(spec: &VolumeSpec) -> EngineResult<Self> {
        let create_only = matches!(spec.create, VolumeOpenMode::CreateOnly);
        let should_create = matches!(spec.create, VolumeOpenMode::Create | VolumeOpenMode::CreateOnly);

        let exists = spec.path.exists();
        if create_only && exists {
            return Err(EngineError::Config(format!(
                "volume {:?} already exists but createOnly was requested",
                spec.path
            )));
        }
        if !exists && !should_create {
            return Err(EngineError::VolumeNotFound(spec.path.display().to_string()));
        }

        let mut open_opts = OpenOptions::new();
        open_opts
            .read(true)
            .write(!matches!(spec.create, VolumeOpenMode::ReadOnly));
        if should_create {
            open_opts.create(true);
        }
        let mut file = open_opts
            .open(&spec.path)
            .map_err(|e| EngineError::io("volume open", e))?;

        let header = if exists {
            read_header(&mut file, spec.page_size as usize)?
        } else {
            let header = VolumeHeader::new(spec.page_size);
            write_header(&mut file, &header)?;
            extend_file(&mut file, spec.page_size as usize, spec.initial_pages.max(1) as u64)?;
            header
        };

        Ok(Self {
            name: spec.name.clone(),
            path: spec.path.clone(),
            page_size: header.page_size as usize,
            maximum_pages: spec.maximum_pages as u64,
            extension_pages: spec.extension_pages.max(1) as u64,
            file: Mutex::new(file),
            header: Mutex::new(header),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn directory_root(&self) -> PageId {
        self.header.lock().unwrap().directory_root
    }

    /// The next page id `alloc_new_page` would hand out if the garbage
    /// chain were empty. Used to check that allocate/deallocate cycles
    /// net back to zero (spec §8 invariant 7).
    pub fn next_available_page(&self) -> PageId {
        self.header.lock().unwrap().next_available_page
    }

    pub fn set_directory_root(&self, root: PageId) -> EngineResult<()> {
        let mut header = self.header.lock().unwrap();
        header.directory_root = root;
        self.persist_header(&header)
    }

    fn persist_header(&self, header: &VolumeHeader) -> EngineResult<()> {
        let mut file = self.file.lock().unwrap();
        write_header(&mut file, header)
    }

    /// Read a page image into `buf`, which must be exactly `page_size`
    /// bytes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> EngineResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_id * self.page_size as u64))
            .map_err(|e| EngineError::io("volume seek", e))?;
        file.read_exact(buf).map_err(|e| EngineError::io("volume read", e))
    }

    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> EngineResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_id * self.page_size as u64))
            .map_err(|e| EngineError::io("volume seek", e))?;
        file.write_all(buf).map_err(|e| EngineError::io("volume write", e))
    }

    /// Append `n_pages` zero-filled pages to the file.
    pub fn extend(&self, n_pages: u64) -> EngineResult<()> {
        let mut file = self.file.lock().unwrap();
        extend_file(&mut file, self.page_size, n_pages)
    }

    pub fn truncate(&self) -> EngineResult<()> {
        let file = self.file.lock().unwrap();
        file.set_len(self.page_size as u64)
            .map_err(|e| EngineError::io("volume truncate", e))
    }

    /// Allocate a page: pop from the garbage chain if one exists,
    /// otherwise extend the file (bounded by `maximum_pages`).
    pub fn alloc_new_page(&self) -> EngineResult<PageId> {
        let mut header = self.header.lock().unwrap();

        if header.garbage_head != 0 {
            let garbage_page_id = header.garbage_head;
            let mut buf = vec![0u8; self.page_size];
            {
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(garbage_page_id * self.page_size as u64))
                    .map_err(|e| EngineError::io("garbage seek", e))?;
                file.read_exact(&mut buf).map_err(|e| EngineError::io("garbage read", e))?;
            }
            let mut garbage = GarbagePage::decode(&buf)?;

            if let Some(page_id) = garbage.free_pages.pop() {
                if garbage.free_pages.is_empty() && garbage.next != 0 {
                    // This garbage page is now empty; fold its chain
                    // pointer up and hand the page itself out too would
                    // double-allocate it, so we keep it as an (empty)
                    // head until the next push recycles it.
                }
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(garbage_page_id * self.page_size as u64))
                    .map_err(|e| EngineError::io("garbage seek", e))?;
                file.write_all(&garbage.encode_padded(self.page_size))
                    .map_err(|e| EngineError::io("garbage write", e))?;
                drop(file);
                self.persist_header(&header)?;
                return Ok(page_id);
            } else {
                // Head garbage page is itself empty and has no free
                // pages recorded: reclaim it as the allocated page and
                // advance the chain.
                header.garbage_head = garbage.next;
                self.persist_header(&header)?;
                return Ok(garbage_page_id);
            }
        }

        if header.next_available_page >= self.maximum_pages && self.maximum_pages > 0 {
            warn!("volume {} exhausted maximum_pages={}", self.name, self.maximum_pages);
            return Err(EngineError::CorruptVolume(format!(
                "volume {} exhausted maximum_pages={}",
                self.name, self.maximum_pages
            )));
        }

        let page_id = header.next_available_page;
        if page_id >= header.pages_allocated {
            let mut file = self.file.lock().unwrap();
            extend_file(&mut file, self.page_size, self.extension_pages)?;
            header.pages_allocated += self.extension_pages;
            debug!("volume {} extended by {} pages (now {} allocated)", self.name, self.extension_pages, header.pages_allocated);
        }
        header.next_available_page += 1;
        self.persist_header(&header)?;
        Ok(page_id)
    }

    /// Prepend `page_id` to the garbage chain.
    pub fn deallocate_page(&self, page_id: PageId) -> EngineResult<()> {
        let mut header = self.header.lock().unwrap();

        let mut head = if header.garbage_head != 0 {
            let mut buf = vec![0u8; self.page_size];
            {
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(header.garbage_head * self.page_size as u64))
                    .map_err(|e| EngineError::io("garbage seek", e))?;
                file.read_exact(&mut buf).map_err(|e| EngineError::io("garbage read", e))?;
            }
            GarbagePage::decode(&buf)?
        } else {
            GarbagePage::empty()
        };

        if head.is_full(self.page_size) || header.garbage_head == 0 {
            // Recycle the page being freed as the new chain head.
            let new_head = GarbagePage {
                next: header.garbage_head,
                free_pages: Vec::new(),
            };
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(page_id * self.page_size as u64))
                .map_err(|e| EngineError::io("garbage seek", e))?;
            file.write_all(&new_head.encode_padded(self.page_size))
                .map_err(|e| EngineError::io("garbage write", e))?;
            drop(file);
            header.garbage_head = page_id;
        } else {
            head.free_pages.push(page_id);
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(header.garbage_head * self.page_size as u64))
                .map_err(|e| EngineError::io("garbage seek", e))?;
            file.write_all(&head.encode_padded(self.page_size))
                .map_err(|e| EngineError::io("garbage write", e))?;
        }

        self.persist_header(&header)
    }
}

fn extend_file(file: &mut File, page_size: usize, n_pages: u64) -> EngineResult<()> {
    let current_len = file.metadata().map_err(|e| EngineError::io("volume stat", e))?.len();
    let new_len = current_len + page_size as u64 * n_pages;
    file.set_len(new_len).map_err(|e| EngineError::io("volume extend", e))
}

fn read_header(file: &mut File, page_size: usize) -> EngineResult<VolumeHeader> {
    let mut buf = vec![0u8; page_size];
    file.seek(SeekFrom::Start(0)).map_err(|e| EngineError::io("header seek", e))?;
    file.read_exact(&mut buf).map_err(|e| EngineError::io("header read", e))?;
    let mut reader = ByteReader::new(&buf);
    VolumeHeader::decode_from(&mut reader)
}

fn write_header(file: &mut File, header: &VolumeHeader) -> EngineResult<()> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0)).map_err(|e| EngineError::io("header seek", e))?;
    file.write_all(&buf).map_err(|e| EngineError::io("header write", e))
}
