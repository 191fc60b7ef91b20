//! A simple in-memory object store.
//!
//! Useful for simulating storage in tests and examples. All clones of a
//! [Memory] observe the same objects. Compound operations are applied
//! against a scratch copy and committed only if every step succeeds, so
//! a failing `assert_exists` or `cmpext` leaves the object untouched.
//!
//! Reads accept a snapshot selector but always serve the head data: the
//! store records snapshot contexts without materialising per-snapshot
//! clones, which is sufficient for engines whose parent images are
//! immutable for the duration of a test.
//!
//! # Stalling
//!
//! [Memory::stall] blocks every read of and operation on one object until
//! the returned [Stall] is released (or dropped). Tests use this to force
//! deterministic interleavings, e.g. holding a parent read open so that a
//! second writer joins an in-flight copy-up.

use super::{Error, ObjectStore, SnapId, SnapshotContext, Step, WriteOperation};
use crate::layout::Extent;
use bytes::Bytes;
use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

type Gate = Shared<oneshot::Receiver<()>>;

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    stalls: HashMap<String, Gate>,
}

/// In-memory object store implementation.
#[derive(Clone, Debug, Default)]
pub struct Memory {
    state: Arc<Mutex<State>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of an object, if it exists.
    pub fn contents(&self, oid: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state.objects.get(oid).map(|data| Bytes::from(data.clone()))
    }

    /// Block reads of and operations on `oid` until the returned handle
    /// is released.
    pub fn stall(&self, oid: &str) -> Stall {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.stalls.insert(oid.to_string(), rx.shared());
        Stall {
            state: self.state.clone(),
            oid: oid.to_string(),
            tx: Some(tx),
        }
    }

    async fn wait(&self, oid: &str) {
        let gate = {
            let state = self.state.lock().unwrap();
            state.stalls.get(oid).cloned()
        };
        if let Some(gate) = gate {
            // A dropped sender releases waiters too.
            let _ = gate.await;
        }
    }

    fn apply(mut current: Option<Vec<u8>>, op: &WriteOperation) -> Result<Option<Vec<u8>>, Error> {
        for step in op.steps() {
            match step {
                Step::AssertExists => {
                    if current.is_none() {
                        return Err(Error::NotFound);
                    }
                }
                Step::Write { offset, data } => {
                    let object = current.get_or_insert_with(Vec::new);
                    write_at(object, *offset, data);
                }
                Step::Zero { offset, length } => {
                    let object = current.get_or_insert_with(Vec::new);
                    let size = object.len() as u64;
                    if *offset < size {
                        let end = (*offset + *length).min(size);
                        object[*offset as usize..end as usize].fill(0);
                    }
                }
                Step::WriteSame {
                    offset,
                    length,
                    data,
                } => {
                    if data.is_empty() || *length % data.len() as u64 != 0 {
                        return Err(Error::Unsupported(
                            "write_same length must be a multiple of the pattern".into(),
                        ));
                    }
                    let object = current.get_or_insert_with(Vec::new);
                    let mut pos = *offset;
                    let end = *offset + *length;
                    while pos < end {
                        write_at(object, pos, data);
                        pos += data.len() as u64;
                    }
                }
                Step::CompareExtent { offset, data } => {
                    let object = current.as_ref().ok_or(Error::NotFound)?;
                    for (i, expected) in data.iter().enumerate() {
                        let actual = object.get(*offset as usize + i).unwrap_or(&0);
                        if actual != expected {
                            return Err(Error::CompareMismatch(*offset + i as u64));
                        }
                    }
                }
                Step::Exec {
                    class: "rbd",
                    method: "copyup",
                    data,
                } => {
                    // Materialise iff absent; no-op on an existing object.
                    if current.is_none() {
                        current = Some(data.to_vec());
                    }
                }
                Step::Exec { class, method, .. } => {
                    return Err(Error::Unsupported(format!("{class}.{method}")));
                }
                Step::Truncate { size } => {
                    let object = current.get_or_insert_with(Vec::new);
                    object.resize(*size as usize, 0);
                }
                Step::Remove => {
                    if current.is_none() {
                        return Err(Error::NotFound);
                    }
                    current = None;
                }
                Step::SetAllocHint { .. } => {}
            }
        }
        Ok(current)
    }
}

/// Handle holding one object's I/O stalled; see [Memory::stall].
pub struct Stall {
    state: Arc<Mutex<State>>,
    oid: String,
    tx: Option<oneshot::Sender<()>>,
}

impl Stall {
    /// Release all waiters and stop stalling the object.
    pub fn release(mut self) {
        self.open();
    }

    fn open(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.stalls.remove(&self.oid);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Stall {
    fn drop(&mut self) {
        self.open();
    }
}

impl ObjectStore for Memory {
    async fn read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        _snap: SnapId,
        _flags: u32,
    ) -> Result<Bytes, Error> {
        self.wait(oid).await;
        let state = self.state.lock().unwrap();
        let object = state.objects.get(oid).ok_or(Error::NotFound)?;
        let size = object.len() as u64;
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = (offset + length).min(size);
        Ok(Bytes::copy_from_slice(
            &object[offset as usize..end as usize],
        ))
    }

    async fn sparse_read(
        &self,
        oid: &str,
        offset: u64,
        length: u64,
        snap: SnapId,
        flags: u32,
    ) -> Result<(Vec<Extent>, Bytes), Error> {
        let data = self.read(oid, offset, length, snap, flags).await?;
        let extents = if data.is_empty() {
            Vec::new()
        } else {
            vec![Extent::new(offset, data.len() as u64)]
        };
        Ok((extents, data))
    }

    async fn operate(
        &self,
        oid: &str,
        op: WriteOperation,
        _snapc: &SnapshotContext,
    ) -> Result<(), Error> {
        self.wait(oid).await;
        let mut state = self.state.lock().unwrap();
        let current = state.objects.get(oid).cloned();
        match Memory::apply(current, &op)? {
            Some(object) => {
                state.objects.insert(oid.to_string(), object);
            }
            None => {
                state.objects.remove(oid);
            }
        }
        Ok(())
    }
}

fn write_at(object: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if object.len() < end {
        object.resize(end, 0);
    }
    object[offset as usize..end].copy_from_slice(data);
}
