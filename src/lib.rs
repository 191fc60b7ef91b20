//! Per-object asynchronous I/O for cloned block images striped over an
//! object store.
//!
//! An image is a virtual block device whose logical address space is
//! striped across fixed-size backing objects. An image may be a *clone*
//! of a parent image at a snapshot: regions of the child that have not
//! been materialised are served from the parent, and copy-on-read /
//! copy-on-write policy decides when the parent data is copied up into
//! the child object.
//!
//! The heart of the crate is [request]: for each read or write targeting
//! one backing object, a small engine coordinates the primary store
//! operation, on-demand reads from the parent when the object is absent,
//! deduplicated copy-up materialisation, and conditional updates to the
//! per-object presence map that guards writes.
//!
//! All async components are generic over the `commonware-runtime`
//! execution traits, so production code runs on the tokio runtime while
//! tests run (and interleave deterministically) on the deterministic
//! runtime.

pub mod image;
pub mod layout;
pub mod object_map;
pub mod request;
pub mod store;
