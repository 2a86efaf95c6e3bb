//! Sentinel Checkpoint: durable, tamper-evident engagement snapshots.
//!
//! A checkpoint captures an engagement's agents, findings, and audit trail
//! into a single signed container file. The signature is a BLAKE3 digest of
//! every byte before it, so any modification is detectable, and each file is
//! bound to the digest of the scope artifact it was captured against.

pub mod error;
pub mod hash;
pub mod schema;
pub mod scope;
pub mod store;

pub use error::{CheckpointError, Result};
pub use hash::Digest;
pub use scope::{ScopeBinding, ScopeDrift};
pub use store::{CheckpointData, CheckpointMetadata, CheckpointStore, LoadOptions, CHECKPOINT_FILE};
