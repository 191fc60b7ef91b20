//! Per-object write request.
//!
//! Every mutating request follows the same skeleton: a conditional
//! object-map pre-update, the payload issued as one compound store
//! operation (guarded by `assert_exists` when the object still has parent
//! overlap), recovery from a guard miss by materialising the object from
//! the parent, and a symmetric object-map post-update for payloads that
//! remove the object.
//!
//! A guard miss under copy-on-read joins the image's copyup list so that
//! concurrent writers to the same absent object produce a single combined
//! copy-up operation; without copy-on-read the writer reads the parent
//! and issues its own copy-up carrying the payload.

use super::{copyup, Error, ObjectIo};
use crate::{
    image::Image,
    layout::Layout,
    object_map::ObjectState,
    store::{ObjectStore, SnapId, SnapshotContext, Step, WriteOperation},
};
use bytes::Bytes;
use commonware_runtime::{Metrics, Spawner};
use tracing::{debug, trace};

/// What a write does to the object.
enum Payload {
    Write { data: Bytes, op_flags: u32 },
    Zero { length: u64 },
    Remove,
    CompareAndWrite { compare: Bytes, data: Bytes },
}

impl Payload {
    fn label(&self) -> &'static str {
        match self {
            Payload::Write { .. } => "write",
            Payload::Zero { .. } => "zero",
            Payload::Remove => "remove",
            Payload::CompareAndWrite { .. } => "compare_and_write",
        }
    }

    /// Store steps realising the payload.
    fn steps(&self, offset: u64, layout: &Layout) -> Vec<Step> {
        match self {
            Payload::Write { data, .. } => vec![
                Step::SetAllocHint {
                    expected_size: layout.object_size(),
                    expected_write_size: layout.object_size(),
                },
                Step::Write {
                    offset,
                    data: data.clone(),
                },
            ],
            Payload::Zero { length } => vec![Step::Zero {
                offset,
                length: *length,
            }],
            Payload::Remove => vec![Step::Remove],
            Payload::CompareAndWrite { compare, data } => vec![
                Step::CompareExtent {
                    offset,
                    data: compare.clone(),
                },
                Step::Write {
                    offset,
                    data: data.clone(),
                },
            ],
        }
    }

    fn op_flags(&self) -> u32 {
        match self {
            Payload::Write { op_flags, .. } => *op_flags,
            _ => 0,
        }
    }

    /// Object-map state the cell must carry before the store operation.
    fn pre_state(&self) -> ObjectState {
        match self {
            Payload::Remove => ObjectState::Pending,
            _ => ObjectState::Exists,
        }
    }

    /// Object-map transition after the store operation, for payloads that
    /// remove the object.
    fn post_state(&self) -> Option<ObjectState> {
        match self {
            Payload::Remove => Some(ObjectState::Nonexistent),
            _ => None,
        }
    }
}

/// A mutating request against one backing object.
pub struct WriteRequest<E: Spawner + Metrics, S: ObjectStore> {
    io: ObjectIo<E, S>,
    payload: Payload,
    snapc: SnapshotContext,
}

impl<E: Spawner + Metrics, S: ObjectStore> WriteRequest<E, S> {
    async fn new(
        image: &Image<E, S>,
        object_no: u64,
        offset: u64,
        length: u64,
        payload: Payload,
        hide_enoent: bool,
    ) -> Self {
        let io = ObjectIo::new(image, object_no, offset, length, SnapId::Head, hide_enoent).await;
        let snapc = image.snapshot_context().await;
        Self { io, payload, snapc }
    }

    /// Write `data` at `offset`.
    pub async fn write(
        image: &Image<E, S>,
        object_no: u64,
        offset: u64,
        data: Bytes,
        op_flags: u32,
    ) -> Self {
        let length = data.len() as u64;
        Self::new(
            image,
            object_no,
            offset,
            length,
            Payload::Write { data, op_flags },
            false,
        )
        .await
    }

    /// Zero `length` bytes at `offset`, keeping the object.
    pub async fn zero(image: &Image<E, S>, object_no: u64, offset: u64, length: u64) -> Self {
        Self::new(
            image,
            object_no,
            offset,
            length,
            Payload::Zero { length },
            false,
        )
        .await
    }

    /// Remove the whole object. Removing an already absent object is
    /// reported as success.
    pub async fn remove(image: &Image<E, S>, object_no: u64) -> Self {
        let length = image.layout().object_size();
        Self::new(image, object_no, 0, length, Payload::Remove, true).await
    }

    /// Write `data` at `offset` iff the existing bytes equal `compare`.
    ///
    /// # Panics
    ///
    /// Panics if `compare` and `data` differ in length.
    pub async fn compare_and_write(
        image: &Image<E, S>,
        object_no: u64,
        offset: u64,
        compare: Bytes,
        data: Bytes,
    ) -> Self {
        assert_eq!(compare.len(), data.len(), "compare/write length mismatch");
        let length = data.len() as u64;
        Self::new(
            image,
            object_no,
            offset,
            length,
            Payload::CompareAndWrite { compare, data },
            false,
        )
        .await
    }

    /// Execute the write. Resolves exactly once with the final result.
    pub async fn send(mut self) -> Result<(), Error> {
        trace!(
            oid = %self.io.oid,
            offset = self.io.offset,
            length = self.io.length,
            kind = self.payload.label(),
            "write"
        );
        let hide_enoent = self.io.hide_enoent;
        match self.execute().await {
            Err(err) if hide_enoent && err.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn execute(&mut self) -> Result<(), Error> {
        self.pre_update().await?;
        let guarded = self.io.has_parent();
        match self.issue_write(guarded).await {
            Ok(()) => self.post_update().await,
            Err(err) if err.is_not_found() && guarded => self.guard_fallback().await,
            Err(err) if guarded => {
                debug!(oid = %self.io.oid, ?err, "write failed");
                Err(err)
            }
            Err(err) => {
                // Unguarded failures still run the post transition; a
                // discard must not leave the cell pending.
                debug!(oid = %self.io.oid, ?err, "write failed");
                self.post_update().await?;
                Err(err)
            }
        }
    }

    /// Conditionally transition the object-map cell ahead of the store
    /// operation.
    async fn pre_update(&mut self) -> Result<(), Error> {
        let inner = self.io.image.inner();
        let _owner = inner.owner_lock.read().await;
        let _snaps = inner.snap_lock.read().await;
        let mut map = inner.object_map.write().await;
        if !map.enabled() {
            return Ok(());
        }
        // Updates require the exclusive lock; losing it mid-write is a
        // caller bug.
        debug_assert!(self.io.image.is_lock_owner());

        let new_state = self.payload.pre_state();
        if map.get(self.io.object_no) == new_state {
            return Ok(());
        }
        trace!(object = self.io.object_no, state = ?new_state, "pre object map update");
        let updated = map.update(self.io.object_no, new_state, None).await?;
        debug_assert!(updated);
        if updated {
            inner.counters.map_updates.inc();
        }
        Ok(())
    }

    /// Issue the payload as one compound operation against the data pool,
    /// guarded by `assert_exists` when parent overlap remains.
    async fn issue_write(&mut self, guarded: bool) -> Result<(), Error> {
        let mut op = WriteOperation::new();
        if guarded {
            trace!(object = self.io.object_no, "guarding write");
            op.assert_exists();
        }
        op.extend(self.payload.steps(self.io.offset, self.io.image.layout()));
        op.set_op_flags(self.payload.op_flags());
        debug_assert!(!op.is_empty());
        self.io
            .image
            .data()
            .operate(&self.io.oid, op, &self.snapc)
            .await
            .map_err(Error::from)
    }

    /// The guarded write observed `NotFound`: materialise the object from
    /// the parent (or discover that someone else already did).
    async fn guard_fallback(&mut self) -> Result<(), Error> {
        if self.io.compute_parent_extents().await {
            if self.io.image.is_copy_on_read(SnapId::Head) {
                self.join_copyup().await?;
            } else {
                let extents = self.io.parent_extents.clone();
                let (_, data) = self.io.read_from_parent(&extents).await?;
                self.send_copyup(data).await?;
            }
        } else {
            // Parent overlap now 0: some other writer materialised the
            // object while we weren't looking. Re-issue the payload via a
            // copy-up carrying no data, which the store treats as the
            // payload alone.
            debug!(object = self.io.object_no, "parent overlap now 0");
            self.send_copyup(Bytes::new()).await?;
        }
        self.post_update().await
    }

    /// Coordinate with concurrent writers through the copyup list: the
    /// first writer spawns the combined copy-up, the rest attach their
    /// payloads and await its result.
    async fn join_copyup(&mut self) -> Result<(), Error> {
        let image = self.io.image.clone();
        let steps = self.payload.steps(self.io.offset, image.layout());
        let rx = match image.inner().copyups.join(self.io.object_no, steps).await {
            copyup::Join::Created(rx) => {
                copyup::CopyupRequest::spawn(
                    image.clone(),
                    self.io.object_no,
                    self.io.oid.clone(),
                    self.io.parent_extents.clone(),
                );
                rx
            }
            copyup::Join::Appended(rx) => {
                image.inner().counters.copyup_waiters.inc();
                rx
            }
            copyup::Join::Busy => {
                // The combined operation is already being written; late
                // joiners take the slow path. The copy-up collapses to a
                // no-op once the object is materialised.
                let extents = self.io.parent_extents.clone();
                let (_, data) = self.io.read_from_parent(&extents).await?;
                return self.send_copyup(data).await;
            }
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Issue the payload prefixed by the copyup verb (skipped when the
    /// parent data is all zeroes) against the metadata pool.
    async fn send_copyup(&self, data: Bytes) -> Result<(), Error> {
        let mut op = WriteOperation::new();
        if !copyup::is_zero(&data) {
            op.exec("rbd", "copyup", data);
        }
        op.extend(self.payload.steps(self.io.offset, self.io.image.layout()));
        debug_assert!(!op.is_empty());
        debug!(oid = %self.io.oid, steps = op.len(), "copy-up write");
        self.io
            .image
            .md()
            .operate(&self.io.oid, op, &self.snapc)
            .await
            .map_err(Error::from)
    }

    /// Transition the cell out of `Pending` after a removing payload. A
    /// refusal means another actor already moved the cell, which is fine.
    async fn post_update(&mut self) -> Result<(), Error> {
        let Some(new_state) = self.payload.post_state() else {
            return Ok(());
        };
        let inner = self.io.image.inner();
        let _owner = inner.owner_lock.read().await;
        let _snaps = inner.snap_lock.read().await;
        let mut map = inner.object_map.write().await;
        if !map.enabled() {
            return Ok(());
        }
        debug_assert!(self.io.image.is_lock_owner());

        if map.get(self.io.object_no) != ObjectState::Pending {
            return Ok(());
        }
        trace!(object = self.io.object_no, state = ?new_state, "post object map update");
        if map
            .update(self.io.object_no, new_state, Some(ObjectState::Pending))
            .await?
        {
            inner.counters.map_updates.inc();
        }
        Ok(())
    }
}
