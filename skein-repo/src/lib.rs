//! Per-account repository engine: signed Merkle Search Tree repositories
//! backed by content-addressed block storage.
//!
//! The [`RepoManager`] facade owns the record-level API (create / put /
//! delete / get / list / describe / export). Each repository is a DAG of
//! DAG-CBOR blocks rooted at a signed commit; mutations produce a new
//! commit plus a diff archive containing only the blocks new to it.

pub mod blockstore;
pub mod commit;
pub mod mst;
pub mod records;
pub mod repo;
pub mod signing;
pub mod storage;
pub mod tid;

mod error;

pub use crate::blockstore::{MemBlockstore, TrackingBlockstore};
pub use crate::commit::{Commit, REPO_VERSION};
pub use crate::error::RepoError;
pub use crate::repo::{
    CommitHook, CommitResult, OpAction, RecordEntry, RepoManager, RepoOp,
};
pub use crate::storage::{MemRepoStorage, PgRepoStorage, RepoRoot, RepoStorage, StorageError};
