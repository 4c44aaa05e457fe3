//! The directory tree (spec §4.F): a Tree in its own right, bootstrapped
//! from the volume header's `directory_root` rather than from another
//! directory entry, whose leaf values are `TreeMeta` records keyed by
//! tree name. Entries are written directly through `Tree::raw_put`/
//! `raw_get` rather than through `store`/`fetch` — a tree's existence is
//! volume structure, not user data, so it isn't versioned under the
//! Transaction Index (§4.G).

use std::sync::Arc;

use crate::accumulator::AccumulatorState;
use crate::buffer::BufferPool;
use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};
use crate::page::{Page, PageType};
use crate::txn::timestamp::Timestamp;
use crate::volume::{PageId, Volume};

use super::Tree;

/// A reserved key sorting before any tree name a caller could register
/// (tree names are expected to be ordinary identifiers, never starting
/// with a NUL byte), holding the next tree id to hand out.
const NEXT_TREE_ID_KEY: &[u8] = b"\0__next_tree_id__";

/// Key prefix for a tree's persisted accumulator state (spec §6
/// "Accumulator state record... stored in the directory tree under the
/// Tree's metadata"). `\0` sorts before any ordinary tree name, and the
/// accumulator's own `index` distinguishes multiple accumulators on the
/// same tree.
fn accumulator_key(tree_name: &str, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + tree_name.len());
    key.extend_from_slice(b"\0acc\0");
    key.extend_from_slice(tree_name.as_bytes());
    key.push(0);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    pub name: String,
    pub root: PageId,
    pub tree_id: u32,
    pub generation: u64,
    pub deleted: bool,
}

impl Encodeable for TreeMeta {
    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(23 + self.name.len());
        w.write(&self.name);
        w.write(&self.root);
        w.write(&self.tree_id);
        w.write(&self.generation);
        w.write(&self.deleted);
        w.into_bytes()
    }
}

impl Decodeable for TreeMeta {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        Ok(Self {
            name: reader.read()?,
            root: reader.read()?,
            tree_id: reader.read()?,
            generation: reader.read()?,
            deleted: reader.read()?,
        })
    }
}

pub struct Directory {
    tree: Tree,
}

impl Directory {
    /// Reuse the volume's existing directory root if it already has one,
    /// otherwise allocate a fresh empty leaf and record it in the volume
    /// header.
    pub fn bootstrap(volume: Arc<Volume>, pool: Arc<BufferPool>, volume_id: u32) -> EngineResult<Self> {
        let existing = volume.directory_root();
        let root = if existing != 0 {
            existing
        } else {
            let page = Page::new(volume.page_size(), PageType::Leaf, 0);
            let page_id = volume.alloc_new_page()?;
            volume.write_page(page_id, page.bytes())?;
            volume.set_directory_root(page_id)?;
            page_id
        };
        let tree = Tree::from_root("_directory".to_string(), 0, volume_id, volume, pool, root);
        Ok(Self { tree })
    }

    pub fn lookup(&self, name: &str) -> EngineResult<Option<TreeMeta>> {
        match self.tree.raw_get(name.as_bytes())? {
            Some(bytes) => {
                let mut reader = ByteReader::new(&bytes);
                Ok(Some(TreeMeta::decode_from(&mut reader)?))
            }
            None => Ok(None),
        }
    }

    fn next_tree_id(&self, at: Timestamp) -> EngineResult<u32> {
        let current = match self.tree.raw_get(NEXT_TREE_ID_KEY)? {
            Some(bytes) => u32::from_be_bytes(bytes[..4].try_into().map_err(|_| {
                EngineError::CorruptVolume("directory tree id counter malformed".to_string())
            })?),
            None => 1,
        };
        self.tree.raw_put(NEXT_TREE_ID_KEY, &(current + 1).to_be_bytes(), at)?;
        Ok(current)
    }

    /// Create a new tree named `name`. Recreating a name that was
    /// previously removed is allowed and always hands out a fresh
    /// `tree_id` and root page — the old tree's accumulator state (keyed
    /// on `tree_id`, spec §4.I) is never inherited.
    pub fn create(&self, name: &str, volume_id: u32, at: Timestamp) -> EngineResult<Tree> {
        if let Some(existing) = self.lookup(name)? {
            if !existing.deleted {
                return Err(EngineError::Config(format!("tree '{}' already exists", name)));
            }
        }

        let tree_id = self.next_tree_id(at)?;
        let page = Page::new(self.tree.volume().page_size(), PageType::Leaf, 0);
        let root = self.tree.volume().alloc_new_page()?;
        self.tree.volume().write_page(root, page.bytes())?;

        let meta = TreeMeta {
            name: name.to_string(),
            root,
            tree_id,
            generation: 0,
            deleted: false,
        };
        self.tree.raw_put(name.as_bytes(), &meta.encode(), at)?;

        Ok(Tree::from_root(
            meta.name,
            meta.tree_id,
            volume_id,
            Arc::clone(self.tree.volume()),
            Arc::clone(self.tree.pool()),
            meta.root,
        ))
    }

    /// Open an existing, non-removed tree.
    pub fn open(&self, name: &str, volume_id: u32) -> EngineResult<Option<Tree>> {
        match self.lookup(name)? {
            Some(meta) if !meta.deleted => Ok(Some(Tree::from_root(
                meta.name,
                meta.tree_id,
                volume_id,
                Arc::clone(self.tree.volume()),
                Arc::clone(self.tree.pool()),
                meta.root,
            ))),
            _ => Ok(None),
        }
    }

    /// Mark `name` deleted. Its pages are not reclaimed here — they are
    /// freed by the cleanup manager at the next checkpoint, which
    /// consumes `pending_deletions`.
    pub fn remove(&self, name: &str, at: Timestamp) -> EngineResult<()> {
        let mut meta = self.lookup(name)?.ok_or_else(|| EngineError::TreeNotFound(name.to_string()))?;
        meta.deleted = true;
        self.tree.raw_put(name.as_bytes(), &meta.encode(), at)?;
        Ok(())
    }

    /// Flush an open tree's in-memory root pointer and generation back
    /// into its directory entry. A tree's root changes on every split
    /// without touching the directory (splits are far more frequent than
    /// checkpoints); the checkpoint manager calls this for every tree it
    /// holds open so a crash can never resume from a directory entry that
    /// predates a split the journal already considers durable.
    pub fn checkpoint_root(&self, open_tree: &Tree, at: Timestamp) -> EngineResult<()> {
        let mut meta = self
            .lookup(open_tree.name())?
            .ok_or_else(|| EngineError::TreeNotFound(open_tree.name().to_string()))?;
        meta.root = open_tree.root();
        meta.generation = open_tree.generation();
        self.tree.raw_put(open_tree.name().as_bytes(), &meta.encode(), at)?;
        Ok(())
    }

    /// Every tree currently marked deleted but not yet physically
    /// reclaimed, by a full left-to-right scan of the directory leaves.
    pub fn pending_deletions(&self) -> EngineResult<Vec<TreeMeta>> {
        let mut out = Vec::new();
        let mut page_id = self.tree.root();
        loop {
            let page = self.tree.read_page(page_id)?;
            if page.is_leaf() {
                break;
            }
            page_id = page.child_page_id(0);
        }

        let mut current = page_id;
        loop {
            let page = self.tree.read_page(current)?;
            for i in 0..page.key_block_count() {
                if page.reconstruct_key(i) == NEXT_TREE_ID_KEY {
                    continue;
                }
                let mut reader = ByteReader::new(page.value_bytes(i));
                let meta = TreeMeta::decode_from(&mut reader)?;
                if meta.deleted {
                    out.push(meta);
                }
            }
            let sib = page.right_sibling();
            if sib == 0 {
                break;
            }
            current = sib;
        }
        Ok(out)
    }

    /// Persist (creating or overwriting) one accumulator's checkpointed
    /// state.
    pub fn save_accumulator_state(&self, state: &AccumulatorState, at: Timestamp) -> EngineResult<()> {
        let key = accumulator_key(&state.tree_name, state.index);
        self.tree.raw_put(&key, &state.encode(), at)
    }

    /// Every accumulator state persisted for `tree_name`, in index
    /// order. Used when a tree is opened to reconstruct its live
    /// `Accumulator`s from their last checkpoint.
    pub fn load_accumulator_states(&self, tree_name: &str) -> EngineResult<Vec<AccumulatorState>> {
        let prefix = {
            let mut p = Vec::with_capacity(6 + tree_name.len());
            p.extend_from_slice(b"\0acc\0");
            p.extend_from_slice(tree_name.as_bytes());
            p.push(0);
            p
        };

        let mut out = Vec::new();
        let mut page_id = self.tree.root();
        loop {
            let page = self.tree.read_page(page_id)?;
            if page.is_leaf() {
                break;
            }
            page_id = page.child_page_id(0);
        }

        let mut current = page_id;
        loop {
            let page = self.tree.read_page(current)?;
            for i in 0..page.key_block_count() {
                let key = page.reconstruct_key(i);
                if key.starts_with(&prefix) {
                    let mut reader = ByteReader::new(page.value_bytes(i));
                    out.push(AccumulatorState::decode_from(&mut reader)?);
                }
            }
            let sib = page.right_sibling();
            if sib == 0 {
                break;
            }
            current = sib;
        }
        out.sort_by_key(|s| s.index);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VolumeOpenMode, VolumeSpec};

    fn test_env(dir: &std::path::Path) -> Directory {
        let spec = VolumeSpec {
            name: "v".to_string(),
            path: dir.join("v.vol"),
            create: VolumeOpenMode::Create,
            page_size: 1024,
            initial_pages: 4,
            extension_pages: 8,
            maximum_pages: 10_000,
        };
        let volume = Arc::new(Volume::open(&spec).unwrap());
        let pool = Arc::new(BufferPool::new(1024, 64));
        pool.register_volume(1, Arc::clone(&volume));
        Directory::bootstrap(volume, pool, 1).unwrap()
    }

    #[test]
    fn create_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());

        let created = directory.create("orders", 1, 1).unwrap();
        assert_eq!(created.tree_id(), 1);

        let opened = directory.open("orders", 1).unwrap().unwrap();
        assert_eq!(opened.root(), created.root());
    }

    #[test]
    fn create_rejects_a_duplicate_live_name() {
        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());
        directory.create("orders", 1, 1).unwrap();
        assert!(directory.create("orders", 1, 2).is_err());
    }

    #[test]
    fn remove_then_recreate_gets_a_fresh_tree_id_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());

        let first = directory.create("orders", 1, 1).unwrap();
        directory.remove("orders", 2).unwrap();
        assert!(directory.open("orders", 1).unwrap().is_none());

        let second = directory.create("orders", 1, 3).unwrap();
        assert_ne!(second.tree_id(), first.tree_id());
        assert_ne!(second.root(), first.root());
    }

    #[test]
    fn checkpoint_root_persists_a_split_root_change() {
        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());
        let created = directory.create("orders", 1, 1).unwrap();

        // Simulate a structural change that replaced the root in memory.
        created.force_root_for_test(9999, 1);
        directory.checkpoint_root(&created, 4).unwrap();

        let reopened = directory.open("orders", 1).unwrap().unwrap();
        assert_eq!(reopened.root(), 9999);
        assert_eq!(reopened.generation(), 1);
    }

    #[test]
    fn removed_tree_surfaces_in_pending_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());
        directory.create("orders", 1, 1).unwrap();
        directory.remove("orders", 2).unwrap();

        let pending = directory.pending_deletions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "orders");
    }

    #[test]
    fn accumulator_state_round_trips_and_is_scoped_per_tree() {
        use crate::accumulator::AccumulatorKind;

        let dir = tempfile::tempdir().unwrap();
        let directory = test_env(dir.path());

        let a = AccumulatorState { kind: AccumulatorKind::Sum, index: 0, base: 42, tree_name: "orders".to_string() };
        let b = AccumulatorState { kind: AccumulatorKind::Seq, index: 1, base: 7, tree_name: "orders".to_string() };
        let other = AccumulatorState { kind: AccumulatorKind::Max, index: 0, base: 100, tree_name: "invoices".to_string() };
        directory.save_accumulator_state(&a, 1).unwrap();
        directory.save_accumulator_state(&b, 2).unwrap();
        directory.save_accumulator_state(&other, 3).unwrap();

        let loaded = directory.load_accumulator_states("orders").unwrap();
        assert_eq!(loaded, vec![a, b]);
    }
}
