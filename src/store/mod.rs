//! Interface to the object store backing an image.
//!
//! The engine consumes the store through [ObjectStore]: plain and sparse
//! reads at a snapshot, and compound write operations built with
//! [WriteOperation]. A compound operation applies its steps atomically and
//! in order: the first failing step aborts the whole operation with no
//! effects, which is what makes a guarded write (`assert_exists` followed
//! by the payload) and the combined copy-up operation sound.
//!
//! The `copyup` verb is carried as an `exec` step: it writes its data blob
//! into the object iff the object does not yet exist, and is a no-op
//! otherwise. [memory] provides an in-memory implementation, [audited] a
//! wrapper that records every operation for test assertions.

use crate::layout::Extent;
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

pub mod audited;
pub mod memory;

/// Snapshot selector for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnapId {
    /// The writable head of the image.
    Head,
    /// A read-only snapshot.
    Snap(u64),
}

impl SnapId {
    pub fn is_head(&self) -> bool {
        matches!(self, SnapId::Head)
    }
}

/// Snapshot context attached to every mutating operation: the most recent
/// snapshot sequence number plus the ids of the snapshots the write must
/// preserve, in descending order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotContext {
    pub seq: u64,
    pub snaps: Vec<u64>,
}

/// Errors that can occur when interacting with the object store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("object not found")]
    NotFound,
    #[error("comparison mismatch at offset {0}")]
    CompareMismatch(u64),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A single step of a compound write operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Fail the operation with [Error::NotFound] unless the object exists.
    AssertExists,
    Write {
        offset: u64,
        data: Bytes,
    },
    Zero {
        offset: u64,
        length: u64,
    },
    WriteSame {
        offset: u64,
        length: u64,
        data: Bytes,
    },
    /// Compare existing bytes at `offset` against `data`; fail with
    /// [Error::CompareMismatch] at the first differing byte.
    CompareExtent {
        offset: u64,
        data: Bytes,
    },
    /// Invoke a store-side method of an object class.
    Exec {
        class: &'static str,
        method: &'static str,
        data: Bytes,
    },
    Truncate {
        size: u64,
    },
    Remove,
    /// Advisory expected object size / write size.
    SetAllocHint {
        expected_size: u64,
        expected_write_size: u64,
    },
}

/// Builder for a compound write operation.
///
/// Steps apply atomically, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct WriteOperation {
    steps: Vec<Step>,
    flags: u32,
}

impl WriteOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_exists(&mut self) -> &mut Self {
        self.steps.push(Step::AssertExists);
        self
    }

    pub fn write(&mut self, offset: u64, data: Bytes) -> &mut Self {
        self.steps.push(Step::Write { offset, data });
        self
    }

    pub fn zero(&mut self, offset: u64, length: u64) -> &mut Self {
        self.steps.push(Step::Zero { offset, length });
        self
    }

    pub fn write_same(&mut self, offset: u64, length: u64, data: Bytes) -> &mut Self {
        self.steps.push(Step::WriteSame {
            offset,
            length,
            data,
        });
        self
    }

    pub fn cmpext(&mut self, offset: u64, data: Bytes) -> &mut Self {
        self.steps.push(Step::CompareExtent { offset, data });
        self
    }

    pub fn exec(&mut self, class: &'static str, method: &'static str, data: Bytes) -> &mut Self {
        self.steps.push(Step::Exec {
            class,
            method,
            data,
        });
        self
    }

    pub fn truncate(&mut self, size: u64) -> &mut Self {
        self.steps.push(Step::Truncate { size });
        self
    }

    pub fn remove(&mut self) -> &mut Self {
        self.steps.push(Step::Remove);
        self
    }

    pub fn set_alloc_hint(&mut self, expected_size: u64, expected_write_size: u64) -> &mut Self {
        self.steps.push(Step::SetAllocHint {
            expected_size,
            expected_write_size,
        });
        self
    }

    pub fn set_op_flags(&mut self, flags: u32) -> &mut Self {
        self.flags |= flags;
        self
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) -> &mut Self {
        self.steps.extend(steps);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

/// Asynchronous object store.
///
/// Implementations are cheap-to-clone handles (all clones observe the
/// same objects), mirroring how runtime storage handles are shared.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// Read up to `length` bytes at `offset`. Short reads past the end of
    /// the object are not an error; reading a missing object is.
    fn read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        snap: SnapId,
        flags: u32,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Like [ObjectStore::read], but also report which parts of the range
    /// are backed by data.
    fn sparse_read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        snap: SnapId,
        flags: u32,
    ) -> impl Future<Output = Result<(Vec<Extent>, Bytes), Error>> + Send;

    /// Apply a compound write operation atomically.
    fn operate(
        &self,
        oid: &str,
        op: WriteOperation,
        snapc: &SnapshotContext,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
