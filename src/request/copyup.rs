//! Copy-up coordination: materialising parent data into a child object,
//! at most once per object across concurrent requests.
//!
//! The image carries a [CopyupList], a map from object number to the
//! in-flight copy-up for that object. The first writer that needs the
//! object materialised creates the entry and spawns a [CopyupRequest];
//! later writers attach their payloads as waiters. The request reads the
//! parent extents (phase 1), then issues one combined operation (phase
//! 2): the copyup verb followed by every waiter's payload in insertion
//! order. The result is delivered to all waiters.
//!
//! The entry flips to `Writing` under the list mutex before phase 2, so a
//! writer can never attach to an operation that has already been built;
//! such a late joiner is turned away and takes the solo path instead. The
//! mutex is a leaf: it is never held across I/O.

use super::{Error, ObjectIo};
use crate::{
    image::Image,
    layout::Extent,
    store::{ObjectStore, Step, WriteOperation},
};
use bytes::Bytes;
use commonware_runtime::{Metrics, Spawner};
use futures::{channel::oneshot, lock::Mutex};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Whether a buffer carries no data worth materialising.
pub(crate) fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|&byte| byte == 0)
}

struct Waiter {
    steps: Vec<Step>,
    tx: oneshot::Sender<Result<(), Error>>,
}

enum Entry {
    /// Phase 1: waiters may still attach.
    Accepting(Vec<Waiter>),
    /// Phase 2: the combined operation is being written.
    Writing,
}

/// Outcome of [CopyupList::join].
pub(crate) enum Join {
    /// No copy-up was in flight; the caller must spawn one.
    Created(oneshot::Receiver<Result<(), Error>>),
    /// Attached to an in-flight copy-up.
    Appended(oneshot::Receiver<Result<(), Error>>),
    /// The in-flight copy-up is already being written; too late to
    /// attach.
    Busy,
}

/// Per-image map of in-flight copy-ups, keyed by object number.
pub(crate) struct CopyupList {
    entries: Mutex<HashMap<u64, Entry>>,
}

impl CopyupList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a writer's payload to the copy-up for `object_no`,
    /// creating the entry if absent. The creator appends itself first,
    /// so an entry is never observed empty.
    pub(crate) async fn join(&self, object_no: u64, steps: Vec<Step>) -> Join {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { steps, tx };
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&object_no) {
            None => {
                entries.insert(object_no, Entry::Accepting(vec![waiter]));
                Join::Created(rx)
            }
            Some(Entry::Accepting(waiters)) => {
                waiters.push(waiter);
                Join::Appended(rx)
            }
            Some(Entry::Writing) => Join::Busy,
        }
    }

    /// Register a waiter-less copy-up (the copy-on-read path) if none is
    /// in flight. Returns whether the caller should spawn one.
    pub(crate) async fn offer(&self, object_no: u64) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&object_no) {
            false
        } else {
            entries.insert(object_no, Entry::Accepting(Vec::new()));
            true
        }
    }

    /// Stop accepting waiters for `object_no` and take the attached ones.
    async fn begin_write(&self, object_no: u64) -> Vec<Waiter> {
        let mut entries = self.entries.lock().await;
        match entries.insert(object_no, Entry::Writing) {
            Some(Entry::Accepting(waiters)) => waiters,
            _ => panic!("copy-up for object {object_no} not registered"),
        }
    }

    async fn remove(&self, object_no: u64) {
        let mut entries = self.entries.lock().await;
        entries.remove(&object_no);
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, object_no: u64) -> bool {
        self.entries.lock().await.contains_key(&object_no)
    }

    #[cfg(test)]
    pub(crate) async fn waiters(&self, object_no: u64) -> usize {
        match self.entries.lock().await.get(&object_no) {
            Some(Entry::Accepting(waiters)) => waiters.len(),
            _ => 0,
        }
    }
}

/// Queue a detached copy-up after a read was served from the parent.
///
/// The extents are recomputed against the current overlap; a parent that
/// vanished in the meantime simply means nothing to do.
pub(crate) async fn copy_up_for_read<E: Spawner + Metrics, S: ObjectStore>(
    io: &mut ObjectIo<E, S>,
) {
    if !io.compute_parent_extents().await {
        return;
    }
    let image = io.image.clone();
    if image.inner().copyups.offer(io.object_no).await {
        CopyupRequest::spawn(image, io.object_no, io.oid.clone(), io.parent_extents.clone());
    }
}

/// One materialisation of one object: parent read, then a single combined
/// operation carrying the copyup verb and every waiter's payload.
pub(crate) struct CopyupRequest<E: Spawner + Metrics, S: ObjectStore> {
    image: Image<E, S>,
    object_no: u64,
    oid: String,
    parent_extents: Vec<Extent>,
}

impl<E: Spawner + Metrics, S: ObjectStore> CopyupRequest<E, S> {
    /// Schedule asynchronous execution. The copyup list entry for
    /// `object_no` must already exist.
    pub(crate) fn spawn(
        image: Image<E, S>,
        object_no: u64,
        oid: String,
        parent_extents: Vec<Extent>,
    ) {
        image.inner().counters.copyups.inc();
        let context = image.inner().context.clone();
        let request = Self {
            image,
            object_no,
            oid,
            parent_extents,
        };
        context
            .with_label("copyup")
            .spawn(move |_| async move { request.run().await });
    }

    async fn run(self) {
        debug!(object = self.object_no, "copy-up started");

        // Phase 1: fetch the parent data.
        let read = self.read_parent().await;

        // Phase 2: no more waiters may attach from here on.
        let waiters = self.image.inner().copyups.begin_write(self.object_no).await;
        let result = match read {
            Ok((_, data)) => {
                let mut op = WriteOperation::new();
                if !is_zero(&data) {
                    op.exec("rbd", "copyup", data);
                }
                for waiter in &waiters {
                    op.extend(waiter.steps.iter().cloned());
                }
                if op.is_empty() {
                    // All-zero parent data and nobody waiting.
                    Ok(())
                } else {
                    let snapc = self.image.snapshot_context().await;
                    self.image
                        .md()
                        .operate(&self.oid, op, &snapc)
                        .await
                        .map_err(Error::from)
                }
            }
            Err(err) => Err(err),
        };

        self.image.inner().copyups.remove(self.object_no).await;
        match &result {
            Ok(()) => debug!(object = self.object_no, "copy-up finished"),
            Err(err) => warn!(object = self.object_no, ?err, "copy-up failed"),
        }
        for waiter in waiters {
            // A waiter that gave up is its own problem.
            let _ = waiter.tx.send(result.clone());
        }
    }

    async fn read_parent(&self) -> Result<(u64, Bytes), Error> {
        let (parent, snap) = {
            let guard = self.image.inner().parent_lock.read().await;
            match guard.as_ref() {
                Some(parent) => (parent.image.clone(), parent.snap),
                None => return Ok((0, Bytes::new())),
            }
        };
        self.image.inner().counters.parent_reads.inc();
        parent.read_extents(&self.parent_extents, snap).await
    }
}
