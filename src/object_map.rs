//! Per-object presence map.
//!
//! One small state cell per backing object, used to short-circuit reads
//! of objects that cannot exist and to guard writes. The map is persisted
//! as a single store object and every state transition is written through
//! before the in-memory copy changes, so a reloaded map never claims more
//! than the store confirmed.
//!
//! # Format
//!
//! ```text
//! +---------------+-------+-------+-----+---------+---------------+
//! | Count (u64)   | cell0 | cell1 | ... | cell_n-1 | CRC32 (u32)  |
//! +---------------+-------+-------+-----+---------+---------------+
//! ```
//!
//! The CRC covers the count and every cell. A blob that fails the check
//! (or disagrees with the expected cell count) is rejected as corrupt
//! rather than repaired: the map guards writes, so guessing is worse than
//! failing.

use crate::store::{self, ObjectStore, SnapshotContext, WriteOperation};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

/// State of one backing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// The object definitely does not exist.
    Nonexistent = 0,
    /// The object exists (and may have unflushed updates).
    Exists = 1,
    /// An update that may remove the object is in flight.
    Pending = 2,
    /// The object exists and is clean since the last snapshot.
    ExistsClean = 3,
}

impl TryFrom<u8> for ObjectState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(ObjectState::Nonexistent),
            1 => Ok(ObjectState::Exists),
            2 => Ok(ObjectState::Pending),
            3 => Ok(ObjectState::ExistsClean),
            other => Err(other),
        }
    }
}

/// Errors that can occur when interacting with the object map.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("object map corrupt")]
    Corrupt,
    #[error("invalid cell state: {0}")]
    InvalidCell(u8),
}

/// Persistent per-object state vector.
///
/// Callers serialise access externally (the image holds the map behind
/// its object-map lock); methods taking `&mut self` write through to the
/// store before mutating memory.
#[derive(Debug)]
pub struct ObjectMap<S: ObjectStore> {
    store: S,
    oid: String,
    enabled: bool,
    cells: Vec<u8>,
}

impl<S: ObjectStore> ObjectMap<S> {
    /// Load the map blob, or start empty (all [ObjectState::Nonexistent])
    /// if it has never been written.
    pub async fn load(
        store: S,
        oid: String,
        object_count: u64,
        enabled: bool,
    ) -> Result<Self, Error> {
        let expected = 8 + object_count + 4;
        let cells = match store
            .read(&oid, 0, expected, store::SnapId::Head, 0)
            .await
        {
            Ok(blob) => {
                if blob.len() as u64 != expected {
                    return Err(Error::Corrupt);
                }
                let count = u64::from_be_bytes(blob[..8].try_into().unwrap());
                if count != object_count {
                    return Err(Error::Corrupt);
                }
                let body = &blob[..blob.len() - 4];
                let checksum = u32::from_be_bytes(blob[blob.len() - 4..].try_into().unwrap());
                if crc32fast::hash(body) != checksum {
                    return Err(Error::Corrupt);
                }
                let cells = blob[8..blob.len() - 4].to_vec();
                for &cell in &cells {
                    ObjectState::try_from(cell).map_err(Error::InvalidCell)?;
                }
                cells
            }
            Err(store::Error::NotFound) => vec![ObjectState::Nonexistent as u8; object_count as usize],
            Err(err) => return Err(err.into()),
        };
        debug!(oid = %oid, objects = object_count, enabled, "loaded object map");
        Ok(Self {
            store,
            oid,
            enabled,
            cells,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Current state of one cell.
    ///
    /// # Panics
    ///
    /// Panics if `object_no` is out of range (a caller bug).
    pub fn get(&self, object_no: u64) -> ObjectState {
        let cell = self.cells[object_no as usize];
        ObjectState::try_from(cell).expect("validated on load")
    }

    /// Whether the object may exist. A disabled map cannot rule anything
    /// out.
    pub fn object_may_exist(&self, object_no: u64) -> bool {
        !self.enabled || self.get(object_no) != ObjectState::Nonexistent
    }

    /// Conditionally transition one cell, writing the map through to the
    /// store first.
    ///
    /// Returns `Ok(false)` without issuing I/O when the map is disabled,
    /// when `expected` does not match the current cell (another actor got
    /// there first), or when the cell already holds `new`.
    pub async fn update(
        &mut self,
        object_no: u64,
        new: ObjectState,
        expected: Option<ObjectState>,
    ) -> Result<bool, Error> {
        if !self.enabled {
            return Ok(false);
        }
        let current = self.get(object_no);
        if let Some(expected) = expected {
            if current != expected {
                return Ok(false);
            }
        }
        if current == new {
            return Ok(false);
        }

        let mut cells = self.cells.clone();
        cells[object_no as usize] = new as u8;
        let mut op = WriteOperation::new();
        op.write(0, Self::serialize(&cells));
        self.store
            .operate(&self.oid, op, &SnapshotContext::default())
            .await
            .map_err(Error::Store)?;
        self.cells = cells;
        debug!(
            oid = %self.oid,
            object = object_no,
            from = ?current,
            to = ?new,
            "object map updated"
        );
        Ok(true)
    }

    fn serialize(cells: &[u8]) -> Bytes {
        let mut blob = BytesMut::with_capacity(8 + cells.len() + 4);
        blob.put_u64(cells.len() as u64);
        blob.put_slice(cells);
        let checksum = crc32fast::hash(&blob);
        blob.put_u32(checksum);
        blob.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Memory;
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    const OID: &str = "image.object_map";

    #[test_traced]
    fn test_fresh_map() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let map = ObjectMap::load(Memory::new(), OID.into(), 4, true)
                .await
                .unwrap();
            assert!(map.enabled());
            for object_no in 0..4 {
                assert_eq!(map.get(object_no), ObjectState::Nonexistent);
                assert!(!map.object_may_exist(object_no));
            }
        });
    }

    #[test_traced]
    fn test_update_persists() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let store = Memory::new();
            let mut map = ObjectMap::load(store.clone(), OID.into(), 4, true)
                .await
                .unwrap();
            assert!(map
                .update(2, ObjectState::Exists, None)
                .await
                .unwrap());
            assert_eq!(map.get(2), ObjectState::Exists);
            assert!(map.object_may_exist(2));

            // Reload sees the persisted transition.
            let map = ObjectMap::load(store, OID.into(), 4, true).await.unwrap();
            assert_eq!(map.get(2), ObjectState::Exists);
            assert_eq!(map.get(1), ObjectState::Nonexistent);
        });
    }

    #[test_traced]
    fn test_conditional_update() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let store = Memory::new();
            let mut map = ObjectMap::load(store.clone(), OID.into(), 2, true)
                .await
                .unwrap();

            // Expected state does not match: rejected, no I/O.
            assert!(!map
                .update(0, ObjectState::Nonexistent, Some(ObjectState::Pending))
                .await
                .unwrap());
            assert!(store.contents(OID).is_none());

            // No-op transition: rejected without I/O.
            assert!(!map
                .update(0, ObjectState::Nonexistent, None)
                .await
                .unwrap());

            assert!(map.update(0, ObjectState::Pending, None).await.unwrap());
            assert!(map
                .update(0, ObjectState::Nonexistent, Some(ObjectState::Pending))
                .await
                .unwrap());
            assert_eq!(map.get(0), ObjectState::Nonexistent);
        });
    }

    #[test_traced]
    fn test_disabled_map() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let store = Memory::new();
            let mut map = ObjectMap::load(store.clone(), OID.into(), 2, false)
                .await
                .unwrap();
            // A disabled map cannot rule objects out and rejects updates
            // synchronously.
            assert!(map.object_may_exist(0));
            assert!(!map.update(0, ObjectState::Exists, None).await.unwrap());
            assert!(store.contents(OID).is_none());
        });
    }

    #[test_traced]
    fn test_corrupt_blob() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let store = Memory::new();
            let mut map = ObjectMap::load(store.clone(), OID.into(), 2, true)
                .await
                .unwrap();
            assert!(map.update(1, ObjectState::Exists, None).await.unwrap());

            // Flip a cell byte without fixing the checksum.
            let mut blob = store.contents(OID).unwrap().to_vec();
            blob[8] ^= 0xff;
            let mut op = WriteOperation::new();
            op.write(0, Bytes::from(blob));
            store
                .operate(OID, op, &SnapshotContext::default())
                .await
                .unwrap();

            let err = ObjectMap::load(store, OID.into(), 2, true)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Corrupt));
        });
    }
}
