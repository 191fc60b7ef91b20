//! Per-object read request.
//!
//! A read is *guarded* when the object still has parent overlap at
//! construction: a `NotFound` from the store then falls back to reading
//! the covered range from the parent instead of surfacing. When
//! copy-on-read is enabled and the parent returned data, a detached
//! copy-up is queued after the read completes; materialisation stays off
//! the latency path.

use super::{copyup, Error, ObjectIo};
use crate::{
    image::{self, Image},
    store::{ObjectStore, SnapId},
};
use bytes::Bytes;
use commonware_runtime::{Metrics, Spawner};
use tracing::{debug, trace};

/// Outcome of a read: how many bytes were backed by data, the (zero
/// padded) data itself, and for sparse reads the ranges backed by data.
#[derive(Clone, Debug)]
pub struct ReadResult {
    pub bytes: u64,
    pub data: Bytes,
    pub extents: Option<Vec<crate::layout::Extent>>,
}

/// A read of one extent of one backing object.
pub struct ReadRequest<E: Spawner + Metrics, S: ObjectStore> {
    io: ObjectIo<E, S>,
    sparse: bool,
    op_flags: u32,
    /// Fall back to the parent on `NotFound`; set at construction iff the
    /// object has parent overlap.
    guard: bool,
}

impl<E: Spawner + Metrics, S: ObjectStore> ReadRequest<E, S> {
    pub async fn new(
        image: &Image<E, S>,
        object_no: u64,
        offset: u64,
        length: u64,
        snap: SnapId,
        sparse: bool,
        op_flags: u32,
    ) -> Self {
        let io = ObjectIo::new(image, object_no, offset, length, snap, false).await;
        let guard = io.has_parent();
        if guard {
            trace!(object = object_no, "guarding read");
        }
        Self {
            io,
            sparse,
            op_flags,
            guard,
        }
    }

    /// Execute the read. Resolves exactly once; `NotFound` means the
    /// object does not exist and no parent covers the requested range
    /// (the caller zero-fills).
    pub async fn send(self) -> Result<ReadResult, Error> {
        trace!(
            oid = %self.io.oid,
            offset = self.io.offset,
            length = self.io.length,
            "read"
        );

        // The object map can rule the object out without a store round
        // trip; the guard below still serves the range from the parent.
        let flat = if !self.io.image.object_may_exist(self.io.object_no).await {
            Err(Error::Store(crate::store::Error::NotFound))
        } else if self.sparse {
            self.io
                .image
                .data()
                .sparse_read(
                    &self.io.oid,
                    self.io.offset,
                    self.io.length,
                    self.io.snap,
                    self.op_flags,
                )
                .await
                .map(|(extents, data)| ReadResult {
                    bytes: data.len() as u64,
                    data,
                    extents: Some(extents),
                })
                .map_err(Error::from)
        } else {
            self.io
                .image
                .data()
                .read(
                    &self.io.oid,
                    self.io.offset,
                    self.io.length,
                    self.io.snap,
                    self.op_flags,
                )
                .await
                .map(|data| ReadResult {
                    bytes: data.len() as u64,
                    data,
                    extents: None,
                })
                .map_err(Error::from)
        };

        match flat {
            Err(err) if err.is_not_found() && self.guard => self.read_from_guard().await,
            other => other,
        }
    }

    /// Continuation after a guarded read observed `NotFound`: re-verify
    /// the parent still covers the requested sub-extent and serve it from
    /// there.
    async fn read_from_guard(mut self) -> Result<ReadResult, Error> {
        let extents = {
            let inner = self.io.image.inner();
            let snaps = inner.snap_lock.read().await;
            let parent = inner.parent_lock.read().await;
            if parent.is_none() {
                debug!(object = self.io.object_no, "parent is gone");
                return Err(Error::Store(crate::store::Error::NotFound));
            }

            // The overlap may have shrunk since construction; map the
            // actual requested sub-extent, not the full object.
            let mut extents = self
                .io
                .image
                .layout()
                .object_to_image(self.io.object_no, self.io.offset, self.io.length);
            let overlap =
                image::parent_overlap(&snaps, &parent, self.io.snap).unwrap_or(0);
            if image::prune_parent_extents(&mut extents, overlap) == 0 {
                return Err(Error::Store(crate::store::Error::NotFound));
            }
            extents
        };

        let copy_on_read = self.io.image.is_copy_on_read(self.io.snap);
        let (bytes, data) = self.io.read_from_parent(&extents).await?;

        // The read is already served; materialisation is detached and
        // deduplicated through the copyup list.
        if copy_on_read && bytes > 0 {
            copyup::copy_up_for_read(&mut self.io).await;
        }

        Ok(ReadResult {
            bytes,
            data,
            extents: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::Extent,
        request::fixtures::*,
        store::{audited::Operation, memory::Memory, Error as StoreError},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, reschedule, Runner};

    #[test_traced]
    fn test_read_object_present() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, false, false).await;
            seed(&pair.store, &pair.child.object_id(0), pattern(b'x')).await;

            let result = ReadRequest::new(&pair.child, 0, 0, 4096, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap();
            assert_eq!(result.bytes, 4096);
            assert!(result.data.iter().all(|&byte| byte == b'x'));
            assert_eq!(parent_reads(&pair.store), 0);
        });
    }

    #[test_traced]
    fn test_read_absent_no_overlap() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, false, false).await;
            // Shrink the overlap so object 2 is no longer covered.
            pair.child
                .attach_parent(pair.parent.clone(), SnapId::Snap(1), 2 * OBJECT_SIZE)
                .await;

            let err = ReadRequest::new(&pair.child, 2, 0, 4096, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap_err();
            assert!(err.is_not_found());
            // No overlap, no parent read.
            assert_eq!(parent_reads(&pair.store), 0);
        });
    }

    #[test_traced]
    fn test_read_copy_on_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, true, false).await;
            let oid = pair.child.object_id(1);

            let result = ReadRequest::new(&pair.child, 1, 0, 4096, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap();
            assert_eq!(result.bytes, 4096);
            assert!(result.data.iter().all(|&byte| byte == b'b'));

            // The detached copy-up materialises the whole object.
            while pair.store.copyups(&oid) == 0 || pair.child.inner().copyups.contains(1).await {
                reschedule().await;
            }
            assert_eq!(pair.store.copyups(&oid), 1);
            let contents = pair.store.inner().contents(&oid).unwrap();
            assert_eq!(contents.len(), 4096);
            assert!(contents.iter().all(|&byte| byte == b'b'));
        });
    }

    #[test_traced]
    fn test_read_no_copyup_without_copy_on_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, false, false).await;

            let result = ReadRequest::new(&pair.child, 0, 0, 512, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap();
            assert_eq!(result.bytes, 512);
            assert!(!pair.child.inner().copyups.contains(0).await);
            assert_eq!(pair.store.copyups(&pair.child.object_id(0)), 0);
        });
    }

    #[test_traced]
    fn test_read_at_snapshot_skips_copy_on_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, true, false).await;
            pair.child.snap_create(5).await;

            let result =
                ReadRequest::new(&pair.child, 0, 0, 4096, SnapId::Snap(5), false, 0)
                    .await
                    .send()
                    .await
                    .unwrap();
            assert_eq!(result.bytes, 4096);
            assert!(result.data.iter().all(|&byte| byte == b'a'));

            // Served from the parent, but never materialised.
            assert_eq!(parent_reads(&pair.store), 1);
            assert!(!pair.child.inner().copyups.contains(0).await);
            assert_eq!(pair.store.copyups(&pair.child.object_id(0)), 0);
        });
    }

    #[test_traced]
    fn test_read_guard_parent_detached() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, true, false).await;

            // Guard decided at construction; the parent disappears before
            // the read is sent.
            let read = ReadRequest::new(&pair.child, 0, 0, 4096, SnapId::Head, false, 0).await;
            pair.child.detach_parent().await;

            let err = read.send().await.unwrap_err();
            assert!(err.is_not_found());
            assert_eq!(parent_reads(&pair.store), 0);
        });
    }

    #[test_traced]
    fn test_read_deleted_snapshot() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, true, false).await;

            // Reading at a snapshot that no longer exists behaves as if
            // the object had no parent.
            let err = ReadRequest::new(&pair.child, 0, 0, 4096, SnapId::Snap(9), false, 0)
                .await
                .send()
                .await
                .unwrap_err();
            assert!(err.is_not_found());
            assert_eq!(parent_reads(&pair.store), 0);
        });
    }

    #[test_traced]
    fn test_read_hole_in_parent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, true, false).await;

            // Object 2 is covered by the overlap but the parent never
            // wrote it: the read comes back zero-filled with no bytes
            // backed, and nothing is worth materialising.
            let result = ReadRequest::new(&pair.child, 2, 0, 4096, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap();
            assert_eq!(result.bytes, 0);
            assert_eq!(result.data.len(), 4096);
            assert!(result.data.iter().all(|&byte| byte == 0));
            assert!(!pair.child.inner().copyups.contains(2).await);
        });
    }

    #[test_traced]
    fn test_object_map_short_circuit() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = crate::store::audited::Audited::new(Memory::new());
            let solo = image(context, "solo", store.clone(), true, false, false).await;

            // The map rules the object out without a store round trip.
            let err = ReadRequest::new(&solo, 0, 0, 4096, SnapId::Head, false, 0)
                .await
                .send()
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Store(StoreError::NotFound)));
            let oid = solo.object_id(0);
            assert!(!store
                .operations()
                .iter()
                .any(|operation| matches!(operation, Operation::Read { oid: o, .. } if *o == oid)));
        });
    }

    #[test_traced]
    fn test_sparse_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let pair = clone_pair(context, false, false).await;
            let oid = pair.child.object_id(0);
            seed(&pair.store, &oid, bytes::Bytes::from(vec![b'x'; 100])).await;

            let result = ReadRequest::new(&pair.child, 0, 0, 4096, SnapId::Head, true, 0)
                .await
                .send()
                .await
                .unwrap();
            assert_eq!(result.bytes, 100);
            assert_eq!(result.extents, Some(vec![Extent::new(0, 100)]));
        });
    }
}
