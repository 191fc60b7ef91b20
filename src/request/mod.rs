//! Per-object request engine.
//!
//! Every read or write targeting one backing object is driven by a
//! request that coordinates the primary store operation, on-demand reads
//! from the parent image when the object is absent, copy-up
//! materialisation of parent data into the child, and conditional updates
//! to the per-object presence map.
//!
//! A request is constructed against a single object, computes the portion
//! of that object still backed by the parent (pruned against the current
//! parent overlap), and is consumed by `send`, which resolves exactly
//! once with the final result:
//!
//! ```text
//! read:   may-exist check → object read ──absent?──> parent read ──CoR──> copy-up (detached)
//! write:  map pre-update → guarded write ──absent?──> copy-up (joined or solo) → map post-update
//! ```
//!
//! Copy-ups for one object are deduplicated through the image's copyup
//! list: concurrent writers attach their payloads to a single combined
//! operation.

use crate::{
    image::{self, Image},
    layout::Extent,
    object_map,
    store::{self, ObjectStore, SnapId},
};
use bytes::Bytes;
use commonware_runtime::{Metrics, Spawner};
use thiserror::Error;
use tracing::{trace, warn};

pub(crate) mod copyup;
mod read;
mod write;

pub use read::{ReadRequest, ReadResult};
pub use write::WriteRequest;

/// Errors a request can resolve with.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("object map error: {0}")]
    ObjectMap(#[from] object_map::Error),
    #[error("snapshot {0} is gone")]
    SnapshotGone(u64),
    #[error("copy-up canceled")]
    Canceled,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(store::Error::NotFound))
    }
}

/// State common to every per-object request.
pub(crate) struct ObjectIo<E: Spawner + Metrics, S: ObjectStore> {
    pub(crate) image: Image<E, S>,
    pub(crate) oid: String,
    pub(crate) object_no: u64,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) snap: SnapId,
    /// Image-space extents of this object still backed by the parent,
    /// pruned against the parent overlap. Empty when there is no parent.
    pub(crate) parent_extents: Vec<Extent>,
    /// Report a terminal `NotFound` as success.
    pub(crate) hide_enoent: bool,
}

impl<E: Spawner + Metrics, S: ObjectStore> ObjectIo<E, S> {
    pub(crate) async fn new(
        image: &Image<E, S>,
        object_no: u64,
        offset: u64,
        length: u64,
        snap: SnapId,
        hide_enoent: bool,
    ) -> Self {
        let mut io = Self {
            image: image.clone(),
            oid: image.object_id(object_no),
            object_no,
            offset,
            length,
            snap,
            parent_extents: Vec::new(),
            hide_enoent,
        };
        io.compute_parent_extents().await;
        io
    }

    pub(crate) fn has_parent(&self) -> bool {
        !self.parent_extents.is_empty()
    }

    /// Recompute the full-object parent extents against the current
    /// parent overlap. Returns whether any byte is still backed by the
    /// parent; a snapshot deleted mid-request reads as no overlap.
    pub(crate) async fn compute_parent_extents(&mut self) -> bool {
        let inner = self.image.inner();
        let snaps = inner.snap_lock.read().await;
        let parent = inner.parent_lock.read().await;

        let layout = self.image.layout();
        let mut extents = layout.object_to_image(self.object_no, 0, layout.object_size());
        let overlap = match image::parent_overlap(&snaps, &parent, self.snap) {
            Ok(overlap) => overlap,
            Err(err) => {
                warn!(
                    object = self.object_no,
                    ?err,
                    "failed to retrieve parent overlap"
                );
                self.parent_extents.clear();
                return false;
            }
        };
        let object_overlap = image::prune_parent_extents(&mut extents, overlap);
        if object_overlap > 0 {
            trace!(
                object = self.object_no,
                overlap,
                extents = extents.len(),
                "computed parent extents"
            );
            self.parent_extents = extents;
            true
        } else {
            self.parent_extents.clear();
            false
        }
    }

    /// Read the given image-space extents from the parent. The parent
    /// handle is cloned under the parent lock, pinning the parent image
    /// while the read is in flight; a detached parent reads as empty.
    pub(crate) async fn read_from_parent(
        &self,
        extents: &[Extent],
    ) -> Result<(u64, Bytes), Error> {
        let (parent, snap) = {
            let guard = self.image.inner().parent_lock.read().await;
            match guard.as_ref() {
                Some(parent) => (parent.image.clone(), parent.snap),
                None => return Ok((0, Bytes::new())),
            }
        };
        self.image.inner().counters.parent_reads.inc();
        trace!(
            object = self.object_no,
            extents = extents.len(),
            "reading from parent"
        );
        parent.read_extents(extents, snap).await
    }
}
