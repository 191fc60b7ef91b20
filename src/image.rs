//! Image handle: striping layout, snapshot and parent metadata, policy
//! flags, and the lock set serialising the per-object engine against
//! image-level maintenance.
//!
//! An [Image] is a cheap-to-clone handle; all clones observe the same
//! state. A clone's unmaterialised regions are served from an attached
//! [Parent]: the parent image handle, the snapshot it was cloned at, and
//! the byte overlap still backed by it. Cloning the parent handle pins
//! the parent image for the duration of a parent read.
//!
//! # Locks
//!
//! Acquired in this order to prevent deadlock: owner lock → snapshot
//! lock → parent lock → object-map lock. The copyup list mutex is a leaf
//! acquired independently and never held across I/O.

use crate::{
    layout::{Extent, Layout},
    object_map::{self, ObjectMap},
    request::{self, copyup::CopyupList, ReadRequest},
    store::{ObjectStore, SnapId, SnapshotContext},
};
use bytes::BytesMut;
use commonware_runtime::{Metrics, RwLock, Spawner};
use futures::future::BoxFuture;
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when opening an image.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("object map error: {0}")]
    ObjectMap(#[from] object_map::Error),
}

/// Configuration for opening an [Image].
#[derive(Clone)]
pub struct Config {
    /// Image name; prefixes every backing object id.
    pub name: String,

    /// Image size in bytes.
    pub size: u64,

    /// Striping layout.
    pub layout: Layout,

    /// Whether the per-object presence map is maintained.
    pub object_map: bool,

    /// Copy parent data up into the child as a side effect of reads that
    /// fell back to the parent.
    pub clone_copy_on_read: bool,

    /// Refuse mutating requests.
    pub read_only: bool,
}

/// An attached parent image: the clone source at a snapshot.
pub struct Parent<E: Spawner + Metrics, S: ObjectStore> {
    pub image: Image<E, S>,
    pub snap: SnapId,
    /// Bytes of the child's address space still backed by the parent at
    /// head.
    pub overlap: u64,
}

pub(crate) struct SnapInfo {
    pub(crate) parent_overlap: Option<u64>,
}

/// Snapshot metadata: the context mutating ops must carry plus per-snap
/// parent overlap.
pub(crate) struct SnapState {
    pub(crate) snapc: SnapshotContext,
    pub(crate) snaps: BTreeMap<u64, SnapInfo>,
}

/// Parent overlap for a snapshot, given the snapshot and parent guards.
///
/// A missing snapshot (deleted mid-request) is reported so the caller can
/// treat the request as having no parent.
pub(crate) fn parent_overlap<E: Spawner + Metrics, S: ObjectStore>(
    snaps: &SnapState,
    parent: &Option<Parent<E, S>>,
    snap: SnapId,
) -> Result<u64, request::Error> {
    let Some(parent) = parent else {
        return Ok(0);
    };
    match snap {
        SnapId::Head => Ok(parent.overlap),
        SnapId::Snap(id) => snaps
            .snaps
            .get(&id)
            .ok_or(request::Error::SnapshotGone(id))
            .map(|info| info.parent_overlap.unwrap_or(0)),
    }
}

/// Clip image-space extents to the first `overlap` bytes of the image,
/// dropping emptied extents. Returns the bytes remaining.
pub fn prune_parent_extents(extents: &mut Vec<Extent>, overlap: u64) -> u64 {
    extents.retain_mut(|extent| {
        if extent.offset >= overlap {
            return false;
        }
        extent.length = extent.length.min(overlap - extent.offset);
        true
    });
    extents.iter().map(|extent| extent.length).sum()
}

pub(crate) struct Counters {
    pub(crate) parent_reads: Counter,
    pub(crate) copyups: Counter,
    pub(crate) copyup_waiters: Counter,
    pub(crate) map_updates: Counter,
}

pub(crate) struct Inner<E: Spawner + Metrics, S: ObjectStore> {
    pub(crate) context: E,
    data: S,
    md: S,
    name: String,
    size: u64,
    layout: Layout,
    read_only: bool,
    clone_copy_on_read: bool,
    lock_owner: AtomicBool,
    pub(crate) owner_lock: RwLock<()>,
    pub(crate) snap_lock: RwLock<SnapState>,
    pub(crate) parent_lock: RwLock<Option<Parent<E, S>>>,
    pub(crate) object_map: RwLock<ObjectMap<S>>,
    pub(crate) copyups: CopyupList,
    pub(crate) counters: Counters,
}

/// Handle to an open image.
pub struct Image<E: Spawner + Metrics, S: ObjectStore> {
    inner: Arc<Inner<E, S>>,
}

impl<E: Spawner + Metrics, S: ObjectStore> Clone for Image<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Spawner + Metrics, S: ObjectStore> Image<E, S> {
    /// Open an image over a data-pool and a metadata-pool store handle.
    ///
    /// The object map (if enabled) is loaded from the metadata pool.
    pub async fn init(context: E, data: S, md: S, cfg: Config) -> Result<Self, Error> {
        let object_count = cfg.layout.object_count(cfg.size);
        let map_oid = format!("{}.object_map", cfg.name);
        let object_map =
            ObjectMap::load(md.clone(), map_oid, object_count, cfg.object_map).await?;

        let counters = Counters {
            parent_reads: Counter::default(),
            copyups: Counter::default(),
            copyup_waiters: Counter::default(),
            map_updates: Counter::default(),
        };
        context.register(
            "parent_reads",
            "Number of reads served from the parent image",
            counters.parent_reads.clone(),
        );
        context.register(
            "copyups",
            "Number of copy-up requests started",
            counters.copyups.clone(),
        );
        context.register(
            "copyup_waiters",
            "Number of writes appended to an in-flight copy-up",
            counters.copyup_waiters.clone(),
        );
        context.register(
            "map_updates",
            "Number of object map transitions written",
            counters.map_updates.clone(),
        );

        debug!(name = %cfg.name, size = cfg.size, objects = object_count, "opened image");
        Ok(Self {
            inner: Arc::new(Inner {
                context,
                data,
                md,
                name: cfg.name,
                size: cfg.size,
                layout: cfg.layout,
                read_only: cfg.read_only,
                clone_copy_on_read: cfg.clone_copy_on_read,
                lock_owner: AtomicBool::new(true),
                owner_lock: RwLock::new(()),
                snap_lock: RwLock::new(SnapState {
                    snapc: SnapshotContext::default(),
                    snaps: BTreeMap::new(),
                }),
                parent_lock: RwLock::new(None),
                object_map: RwLock::new(object_map),
                copyups: CopyupList::new(),
                counters,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn object_count(&self) -> u64 {
        self.inner.layout.object_count(self.inner.size)
    }

    /// Id of one backing object.
    pub fn object_id(&self, object_no: u64) -> String {
        format!("{}.data.{:016x}", self.inner.name, object_no)
    }

    pub fn read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Whether a read at `snap` that falls back to the parent should
    /// trigger a copy-up.
    pub(crate) fn is_copy_on_read(&self, snap: SnapId) -> bool {
        self.inner.clone_copy_on_read && !self.inner.read_only && snap.is_head()
    }

    /// Whether this client currently holds the exclusive lock. Asserted
    /// (not enforced) around object-map updates.
    pub fn is_lock_owner(&self) -> bool {
        self.inner.lock_owner.load(Ordering::Relaxed)
    }

    pub fn set_lock_owner(&self, owner: bool) {
        self.inner.lock_owner.store(owner, Ordering::Relaxed);
    }

    /// Attach a parent image at a snapshot with the given byte overlap.
    pub async fn attach_parent(&self, image: Image<E, S>, snap: SnapId, overlap: u64) {
        let mut parent = self.inner.parent_lock.write().await;
        debug!(name = %self.inner.name, parent = %image.name(), overlap, "attached parent");
        *parent = Some(Parent {
            image,
            snap,
            overlap,
        });
    }

    /// Detach the parent, if any.
    pub async fn detach_parent(&self) {
        let mut parent = self.inner.parent_lock.write().await;
        if parent.take().is_some() {
            debug!(name = %self.inner.name, "detached parent");
        }
    }

    pub async fn parent_attached(&self) -> bool {
        self.inner.parent_lock.read().await.is_some()
    }

    /// Record a snapshot of the image's current state.
    pub async fn snap_create(&self, id: u64) {
        let mut snaps = self.inner.snap_lock.write().await;
        let parent = self.inner.parent_lock.read().await;
        let parent_overlap = parent.as_ref().map(|p| p.overlap);
        snaps.snaps.insert(id, SnapInfo { parent_overlap });
        snaps.snapc.seq = snaps.snapc.seq.max(id);
        snaps.snapc.snaps.insert(0, id);
        debug!(name = %self.inner.name, snap = id, "created snapshot");
    }

    /// Forget a snapshot. Requests reading at it will observe it as gone.
    pub async fn snap_remove(&self, id: u64) {
        let mut snaps = self.inner.snap_lock.write().await;
        snaps.snaps.remove(&id);
        snaps.snapc.snaps.retain(|&snap| snap != id);
        debug!(name = %self.inner.name, snap = id, "removed snapshot");
    }

    /// Snapshot context for a mutating operation.
    pub async fn snapshot_context(&self) -> SnapshotContext {
        self.inner.snap_lock.read().await.snapc.clone()
    }

    /// Whether the object map allows the object to exist.
    pub async fn object_may_exist(&self, object_no: u64) -> bool {
        self.inner.object_map.read().await.object_may_exist(object_no)
    }

    pub(crate) fn data(&self) -> &S {
        &self.inner.data
    }

    pub(crate) fn md(&self) -> &S {
        &self.inner.md
    }

    pub(crate) fn inner(&self) -> &Inner<E, S> {
        &self.inner
    }

    /// Read image-space extents, assembling them in order into one
    /// buffer. Missing objects read as zeroes. Returns the bytes actually
    /// backed by data alongside the zero-padded buffer.
    ///
    /// This is the path a child's request uses to read from its parent;
    /// objects absent on this image recurse into its own parent, if any.
    pub(crate) fn read_extents<'a>(
        &'a self,
        extents: &'a [Extent],
        snap: SnapId,
    ) -> BoxFuture<'a, Result<(u64, bytes::Bytes), request::Error>> {
        Box::pin(async move {
            let mut buffer = BytesMut::new();
            let mut backed = 0u64;
            for extent in extents {
                for oe in self.inner.layout.image_to_object(extent.offset, extent.length) {
                    let start = buffer.len();
                    let read =
                        ReadRequest::new(self, oe.object_no, oe.offset, oe.length, snap, false, 0)
                            .await;
                    match read.send().await {
                        Ok(result) => {
                            backed += result.bytes;
                            buffer.extend_from_slice(&result.data);
                        }
                        Err(request::Error::Store(crate::store::Error::NotFound)) => {}
                        Err(err) => return Err(err),
                    }
                    // Zero-fill holes and short reads.
                    buffer.resize(start + oe.length as usize, 0);
                }
            }
            Ok((backed, buffer.freeze()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Memory;
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    fn config(name: &str) -> Config {
        Config {
            name: name.into(),
            size: 3 * 4096,
            layout: Layout::simple(4096),
            object_map: false,
            clone_copy_on_read: false,
            read_only: false,
        }
    }

    #[test_traced]
    fn test_prune_parent_extents() {
        let mut extents = vec![Extent::new(0, 4096), Extent::new(8192, 4096)];
        assert_eq!(prune_parent_extents(&mut extents, 10240), 6144);
        assert_eq!(
            extents,
            vec![Extent::new(0, 4096), Extent::new(8192, 2048)]
        );

        // Overlap boundary inside the first extent.
        let mut extents = vec![Extent::new(1024, 2048)];
        assert_eq!(prune_parent_extents(&mut extents, 2048), 1024);
        assert_eq!(extents, vec![Extent::new(1024, 1024)]);

        // No overlap left.
        let mut extents = vec![Extent::new(4096, 4096)];
        assert_eq!(prune_parent_extents(&mut extents, 4096), 0);
        assert!(extents.is_empty());
    }

    #[test_traced]
    fn test_snapshot_bookkeeping() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new();
            let image = Image::init(context, store.clone(), store, config("img"))
                .await
                .unwrap();
            assert_eq!(image.snapshot_context().await, SnapshotContext::default());

            image.snap_create(3).await;
            image.snap_create(7).await;
            let snapc = image.snapshot_context().await;
            assert_eq!(snapc.seq, 7);
            assert_eq!(snapc.snaps, vec![7, 3]);

            image.snap_remove(3).await;
            let snapc = image.snapshot_context().await;
            assert_eq!(snapc.seq, 7);
            assert_eq!(snapc.snaps, vec![7]);
        });
    }

    #[test_traced]
    fn test_parent_attach_detach() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new();
            let parent = Image::init(
                context.with_label("parent"),
                store.clone(),
                store.clone(),
                config("parent"),
            )
            .await
            .unwrap();
            let child = Image::init(
                context.with_label("child"),
                store.clone(),
                store,
                config("child"),
            )
            .await
            .unwrap();

            assert!(!child.parent_attached().await);
            child.attach_parent(parent, SnapId::Snap(1), 8192).await;
            assert!(child.parent_attached().await);
            child.detach_parent().await;
            assert!(!child.parent_attached().await);
        });
    }

    #[test_traced]
    fn test_read_extents_zero_fill() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new();
            let image = Image::init(context, store.clone(), store.clone(), config("img"))
                .await
                .unwrap();

            // Only object 1 has data, and only 4 bytes of it.
            let mut op = crate::store::WriteOperation::new();
            op.write(0, Bytes::from_static(b"data"));
            store
                .operate(&image.object_id(1), op, &SnapshotContext::default())
                .await
                .unwrap();

            let extents = [Extent::new(4096 - 2, 8)];
            let (backed, data) = image.read_extents(&extents, SnapId::Head).await.unwrap();
            assert_eq!(&data[..], b"\0\0data\0\0");
            assert_eq!(backed, 4);
        });
    }
}
