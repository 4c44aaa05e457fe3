//! 4.H MVV (multi-version value) codec.
//!
//! A leaf value slot is never a single byte string once more than one
//! transaction has written it: it is a type tag, an optional primordial
//! (pre-MVV) value, and a chain of `(VersionHandle, bytes)` tuples,
//! newest first, so that a snapshot read can walk forward from the
//! newest version back to the one its reader may see. Grounded on
//! `src/codec.rs`'s `ByteWriter`/`ByteReader` pair (the donor's `io.rs`
//! `Encodeable`/`Decodeable` idiom, kept big-endian per this engine's
//! wire format) for the framing, since the donor itself has no
//! multi-version value type to generalize from.

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};
use crate::txn::index::TransactionIndex;
use crate::txn::status::{Step, VersionHandle, ABORTED, UNCOMMITTED};
use crate::txn::timestamp::Timestamp;

/// Tag byte identifying an MVV-encoded value, as opposed to a bare
/// (non-versioned) leaf value — spec §4.H.
const TYPE_MVV: u8 = 0xFE;

/// Length sentinel marking a version as a tombstone (the key was removed
/// by the transaction that authored this version) rather than storing an
/// empty `Vec<u8>`, which would be indistinguishable from a real
/// zero-length value. This caps a single version's real length at 0xFFFE
/// bytes; anything larger goes through the long-record chain (§4.D) and
/// never reaches the MVV codec.
const TOMBSTONE_LEN: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionValue {
    Value(Vec<u8>),
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub handle: VersionHandle,
    pub value: VersionValue,
}

/// What `visible_for` resolved to: a tracked version, or the fallback
/// primordial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibleValue<'a> {
    Version(&'a Version),
    Primordial(&'a [u8]),
}

impl<'a> VisibleValue<'a> {
    pub fn bytes(&self) -> Option<&'a [u8]> {
        match self {
            VisibleValue::Version(v) => match &v.value {
                VersionValue::Value(b) => Some(b),
                VersionValue::Tombstone => None,
            },
            VisibleValue::Primordial(b) => Some(b),
        }
    }
}

/// An MVV cell: every version ever written for one key, newest-authored
/// first, plus an optional *primordial* value — the single plain value
/// that occupied this slot before it was ever converted to MVV. A
/// primordial value predates the Transaction Index entirely, so it is
/// always visible to a reader that no tracked version satisfies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MvvCell {
    pub primordial: Option<Vec<u8>>,
    pub versions: Vec<Version>,
}

impl MvvCell {
    pub fn new() -> Self {
        Self {
            primordial: None,
            versions: Vec::new(),
        }
    }

    /// Wrap a pre-existing non-MVV value as the primordial entry of a new
    /// cell (spec §4.H `storeVersion`: "If target is a primordial value,
    /// wrap it into an MVV and append the new version").
    pub fn wrapping(primordial: Vec<u8>) -> Self {
        Self {
            primordial: Some(primordial),
            versions: Vec::new(),
        }
    }

    pub fn single(handle: VersionHandle, value: VersionValue) -> Self {
        Self {
            versions: vec![Version { handle, value }],
        }
    }

    /// Insert a newly authored version at the front (newest-first order).
    pub fn push_front(&mut self, handle: VersionHandle, value: VersionValue) {
        self.versions.insert(0, Version { handle, value });
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.primordial.is_none()
    }

    /// Resolve the version visible to a reader at `(reader_ts,
    /// reader_step)`, per spec §4.G/§4.H: walk newest-first, skip aborted
    /// and not-yet-committed-before-the-reader versions, skip same-
    /// transaction versions authored at a later step than the reader's.
    /// Falls back to the primordial value (always visible) if no tracked
    /// version qualifies.
    pub fn visible_for(
        &self,
        index: &TransactionIndex,
        reader_ts: Timestamp,
        reader_step: Step,
    ) -> Option<VisibleValue<'_>> {
        for version in &self.versions {
            let author_ts = version.handle.ts();
            let author_step = version.handle.step();

            if author_ts == reader_ts {
                if author_step <= reader_step {
                    return Some(VisibleValue::Version(version));
                }
                continue;
            }

            let status = match index.status_of(author_ts) {
                Some(s) => s,
                // Pruned: necessarily committed long before any live
                // reader's snapshot, so it is visible.
                None => return Some(VisibleValue::Version(version)),
            };

            let tc = status.tc();
            if tc == ABORTED || tc == UNCOMMITTED {
                continue;
            }
            if (tc as u64) <= reader_ts {
                return Some(VisibleValue::Version(version));
            }
        }
        self.primordial.as_deref().map(VisibleValue::Primordial)
    }

    /// Drop every version authored by a transaction known to be aborted,
    /// or committed-but-no-longer-reachable by any live reader because a
    /// newer committed version shadows it. Returns the number of versions
    /// removed, for the cleanup manager's bookkeeping (spec §4.L).
    pub fn prune(&mut self, index: &TransactionIndex, snapshot_floor: Timestamp) -> usize {
        let before = self.versions.len();

        self.versions.retain(|v| {
            let status = match index.status_of(v.handle.ts()) {
                Some(s) => s,
                None => return true, // already pruned elsewhere; nothing to do here
            };
            status.tc() != ABORTED
        });

        // Among versions committed strictly before the snapshot floor,
        // only the newest is reachable by any possible reader; older ones
        // behind it can never be the answer to `visible_for` again.
        let mut kept_one_old = false;
        self.versions.retain(|v| {
            let author_ts = v.handle.ts();
            let committed_before_floor = match index.status_of(author_ts) {
                Some(status) => {
                    let tc = status.tc();
                    tc > 0 && (tc as u64) < snapshot_floor
                }
                None => true,
            };
            if !committed_before_floor {
                return true;
            }
            if kept_one_old {
                false
            } else {
                kept_one_old = true;
                true
            }
        });

        before - self.versions.len()
    }
}

/// Wire format (spec §4.H): `typeTag(1) | reserved(8) | primordialLen(2)
/// | primordialBytes | (versionHandle(8) | length(2) | bytes)*`. The
/// version stream has no explicit count: it runs to the end of the
/// buffer, since an MVV cell only ever exists as a complete leaf value
/// with a known total length.
impl Encodeable for MvvCell {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(16 * self.versions.len() + 16);
        writer.write(&TYPE_MVV);
        writer.write(&0u64); // reserved
        match &self.primordial {
            Some(bytes) => {
                writer.write(&(bytes.len() as u16));
                writer.write_bytes(bytes);
            }
            None => writer.write(&0u16),
        }
        for version in &self.versions {
            writer.write(&version.handle.0);
            match &version.value {
                VersionValue::Tombstone => {
                    writer.write(&TOMBSTONE_LEN);
                }
                VersionValue::Value(bytes) => {
                    writer.write(&(bytes.len() as u16));
                    writer.write_bytes(bytes);
                }
            }
        }
        writer.into_bytes()
    }
}

impl Decodeable for MvvCell {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let tag: u8 = reader.read()?;
        if tag != TYPE_MVV {
            return Err(EngineError::CorruptValue(format!(
                "expected mvv type tag {:#x}, found {:#x}",
                TYPE_MVV, tag
            )));
        }
        let _reserved: u64 = reader.read()?;
        let primordial_len: u16 = reader.read()?;
        let primordial = if primordial_len == 0 {
            None
        } else {
            Some(reader.read_exact(primordial_len as usize)?.to_vec())
        };

        let mut versions = Vec::new();
        while reader.remaining() > 0 {
            let raw_handle: u64 = reader.read()?;
            let len: u16 = reader.read()?;
            let value = if len == TOMBSTONE_LEN {
                VersionValue::Tombstone
            } else {
                VersionValue::Value(reader.read_exact(len as usize)?.to_vec())
            };
            versions.push(Version {
                handle: VersionHandle(raw_handle),
                value,
            });
        }
        Ok(MvvCell {
            primordial,
            versions,
        })
    }
}

pub fn encode_cell(cell: &MvvCell) -> Vec<u8> {
    cell.encode()
}

pub fn decode_cell(bytes: &[u8]) -> EngineResult<MvvCell> {
    let mut reader = ByteReader::new(bytes);
    MvvCell::decode_from(&mut reader).map_err(|e| match e {
        EngineError::CorruptValue(_) => e,
        other => EngineError::CorruptValue(format!("malformed mvv cell: {:?}", other)),
    })
}
