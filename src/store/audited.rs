//! Store wrapper that records every operation.
//!
//! Tests wrap a store with [Audited] and assert on the recorded
//! [Operation]s, e.g. that exactly one operation carrying the copyup verb
//! reached a given object.

use super::{Error, ObjectStore, SnapId, SnapshotContext, Step, WriteOperation};
use crate::layout::Extent;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// A recorded store operation.
#[derive(Clone, Debug)]
pub enum Operation {
    Read {
        oid: String,
        offset: u64,
        length: u64,
        snap: SnapId,
    },
    SparseRead {
        oid: String,
        offset: u64,
        length: u64,
        snap: SnapId,
    },
    Operate {
        oid: String,
        steps: Vec<Step>,
        snap_seq: u64,
    },
}

impl Operation {
    /// Whether this is a compound op on `oid` carrying the copyup verb.
    pub fn is_copyup(&self, oid: &str) -> bool {
        match self {
            Operation::Operate {
                oid: target, steps, ..
            } => {
                target == oid
                    && steps.iter().any(|step| {
                        matches!(
                            step,
                            Step::Exec {
                                class: "rbd",
                                method: "copyup",
                                ..
                            }
                        )
                    })
            }
            _ => false,
        }
    }
}

/// Wrapper around an [ObjectStore] recording every operation.
#[derive(Clone)]
pub struct Audited<S: ObjectStore> {
    inner: S,
    log: Arc<Mutex<Vec<Operation>>>,
}

impl<S: ObjectStore> Audited<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Snapshot of the recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.log.lock().unwrap().clone()
    }

    /// Number of compound ops on `oid` carrying the copyup verb.
    pub fn copyups(&self, oid: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|operation| operation.is_copyup(oid))
            .count()
    }
}

impl<S: ObjectStore> ObjectStore for Audited<S> {
    async fn read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        snap: SnapId,
        flags: u32,
    ) -> Result<Bytes, Error> {
        self.log.lock().unwrap().push(Operation::Read {
            oid: oid.to_string(),
            offset,
            length,
            snap,
        });
        self.inner.read(oid, offset, length, snap, flags).await
    }

    async fn sparse_read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        snap: SnapId,
        flags: u32,
    ) -> Result<(Vec<Extent>, Bytes), Error> {
        self.log.lock().unwrap().push(Operation::SparseRead {
            oid: oid.to_string(),
            offset,
            length,
            snap,
        });
        self.inner.sparse_read(oid, offset, length, snap, flags).await
    }

    async fn operate(
        &self,
        oid: &str,
        op: WriteOperation,
        snapc: &SnapshotContext,
    ) -> Result<(), Error> {
        self.log.lock().unwrap().push(Operation::Operate {
            oid: oid.to_string(),
            steps: op.steps().to_vec(),
            snap_seq: snapc.seq,
        });
        self.inner.operate(oid, op, snapc).await
    }
}
