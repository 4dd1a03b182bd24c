//! The record-level repository API.
//!
//! [`RepoManager`] is a stateless facade: every operation receives the
//! storage backend for the owner's tenant plus the owner DID, and writes
//! additionally receive the owner's signing key. Mutations on one DID are
//! serialised by a keyed mutex held for the whole write; different DIDs
//! proceed in parallel.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use dashmap::DashMap;
use k256::ecdsa::SigningKey;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, warn};

use crate::blockstore::{BlockStore, MemBlockstore, TrackingBlockstore};
use crate::commit::Commit;
use crate::error::RepoError;
use crate::mst::Tree;
use crate::storage::{RepoRoot, RepoStorage, StorageError};
use crate::{records, signing, tid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

/// A single record mutation within a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    pub action: OpAction,
    /// `collection/rkey`
    pub path: String,
    /// New record CID; `None` for deletes.
    pub cid: Option<Cid>,
    /// Replaced record CID; `None` for creates.
    pub prev: Option<Cid>,
}

/// Everything downstream consumers (the firehose) need from a commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub commit_cid: Cid,
    pub rev: String,
    pub prev_rev: Option<String>,
    pub prev_data: Option<Cid>,
    pub ops: Vec<RepoOp>,
    /// CAR v1 archive holding only the blocks new to this commit.
    pub diff_car: Bytes,
}

/// One record in a list response.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub uri: String,
    pub cid: Cid,
    pub value: Value,
}

/// Invoked inside the per-DID critical section after a commit is durable.
/// The event manager implements this to sequence and broadcast the commit.
#[async_trait]
pub trait CommitHook: Send + Sync {
    async fn on_commit(&self, did: &str, result: &CommitResult) -> anyhow::Result<()>;
}

/// Keyed mutex table: one lock per DID with a live writer.
#[derive(Debug, Default)]
struct DidLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DidLocks {
    async fn acquire(&self, did: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self.locks.entry(did.to_string()).or_default();
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    /// Drops lock entries no writer currently holds. A stale entry is
    /// harmless, so callers can prune on whatever cadence suits them.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Orchestrates repository reads and writes over a [`RepoStorage`].
#[derive(Default)]
pub struct RepoManager {
    locks: DidLocks,
    hook: Option<Arc<dyn CommitHook>>,
}

struct OpenRepo {
    store: TrackingBlockstore,
    tree: Tree,
    root: RepoRoot,
    prev_data: Cid,
}

impl RepoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager that runs `hook` inside the per-DID critical
    /// section after every successful commit.
    pub fn with_hook(hook: Arc<dyn CommitHook>) -> Self {
        Self {
            locks: DidLocks::default(),
            hook: Some(hook),
        }
    }

    /// Drops per-DID lock entries without an active writer.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    /// Creates an empty repository for a new account. Idempotent: returns
    /// success without mutation if the repo already exists.
    pub async fn init_repo<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        signing_key: &str,
    ) -> Result<(), RepoError> {
        let key = signing::parse_key(signing_key)?;

        let _guard = self.locks.acquire(did).await;
        let existing = storage
            .load_root(did)
            .await
            .map_err(|e| storage_error(did, "init_repo", e))?;
        if existing.is_some() {
            return Ok(());
        }

        let mut store = MemBlockstore::new();
        let data = Tree::empty().write_blocks(&mut store)?;

        let mut commit = Commit::new(did, None, data, tid::next_tid());
        commit.sign(&key)?;
        let (commit_cid, commit_bytes) = commit.encode()?;
        store.put(commit_cid, Bytes::from(commit_bytes));

        let root = RepoRoot {
            commit_cid,
            rev: commit.rev.clone(),
        };
        storage
            .commit(did, &store, &root)
            .await
            .map_err(|e| storage_error(did, "init_repo", e))?;
        Ok(())
    }

    /// Adds a record under a generated rkey and returns its at-URI.
    pub async fn create_record<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        signing_key: &str,
        collection: &str,
        record: &Value,
    ) -> Result<(String, CommitResult), RepoError> {
        let rkey = tid::next_tid();
        self.put_record(storage, did, signing_key, collection, &rkey, record)
            .await
    }

    /// Creates or updates the record at `collection/rkey`.
    pub async fn put_record<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        signing_key: &str,
        collection: &str,
        rkey: &str,
        record: &Value,
    ) -> Result<(String, CommitResult), RepoError> {
        records::ensure_valid_collection(collection)?;
        records::ensure_valid_rkey(rkey)?;
        let key = signing::parse_key(signing_key)?;

        let parsed = records::parse_record(record)?;
        let record_bytes = records::encode(&parsed)?;
        let record_cid = records::cid_for_cbor(&record_bytes);

        let _guard = self.locks.acquire(did).await;
        let mut repo = self.open(storage, did, "put_record").await?;

        repo.store.put(record_cid, Bytes::from(record_bytes));

        let path = format!("{collection}/{rkey}");
        let prev = repo.tree.insert(&path, record_cid);
        let action = if prev.is_some() {
            OpAction::Update
        } else {
            OpAction::Create
        };
        let ops = vec![RepoOp {
            action,
            path: path.clone(),
            cid: Some(record_cid),
            prev,
        }];

        let result = self
            .commit_repo(storage, did, &key, repo, ops, "put_record")
            .await?;
        Ok((format!("at://{did}/{path}"), result))
    }

    /// Removes the record at `collection/rkey`.
    pub async fn delete_record<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        signing_key: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<CommitResult, RepoError> {
        records::ensure_valid_collection(collection)?;
        records::ensure_valid_rkey(rkey)?;
        let key = signing::parse_key(signing_key)?;

        let _guard = self.locks.acquire(did).await;
        let mut repo = self.open(storage, did, "delete_record").await?;

        let path = format!("{collection}/{rkey}");
        let prev = repo
            .tree
            .remove(&path)
            .ok_or_else(|| RepoError::RecordNotFound(path.clone()))?;

        let ops = vec![RepoOp {
            action: OpAction::Delete,
            path,
            cid: None,
            prev: Some(prev),
        }];

        self.commit_repo(storage, did, &key, repo, ops, "delete_record")
            .await
    }

    /// Reads one record. No lock: reads see the latest committed state.
    pub async fn get_record<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<(Cid, Value), RepoError> {
        let repo = self.open(storage, did, "get_record").await?;

        let path = format!("{collection}/{rkey}");
        let record_cid = repo
            .tree
            .get(&path)
            .ok_or_else(|| RepoError::RecordNotFound(path.clone()))?;
        let bytes = repo
            .store
            .get(&record_cid)
            .ok_or(RepoError::MissingBlock(record_cid))?;
        let value = records::to_json(&records::decode(bytes)?)?;
        Ok((record_cid, value))
    }

    /// Lists records in a collection with cursor pagination.
    ///
    /// `limit` is clamped to 1..=100, defaulting to 50. The cursor is the
    /// rkey of the last record of the previous page; the next page starts
    /// strictly after it.
    pub async fn list_records<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        collection: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
        reverse: bool,
    ) -> Result<(Vec<RecordEntry>, Option<String>), RepoError> {
        let repo = self.open(storage, did, "list_records").await?;

        let prefix = format!("{collection}/");
        let mut entries: Vec<(String, Cid)> = repo
            .tree
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        if reverse {
            entries.reverse();
        }

        let mut start = 0;
        if let Some(cursor) = cursor {
            let cursor_path = format!("{prefix}{cursor}");
            if let Some(pos) = entries.iter().position(|(key, _)| *key == cursor_path) {
                start = pos + 1;
            }
        }

        let limit = match limit {
            Some(limit) if (1..=100).contains(&limit) => limit,
            _ => 50,
        };

        let mut records_out = Vec::new();
        let mut next_cursor = None;
        for (i, (key, record_cid)) in entries.iter().enumerate().skip(start) {
            if records_out.len() == limit {
                break;
            }
            let bytes = repo
                .store
                .get(record_cid)
                .ok_or(RepoError::MissingBlock(*record_cid))?;
            let value = records::to_json(&records::decode(bytes)?)?;
            records_out.push(RecordEntry {
                uri: format!("at://{did}/{key}"),
                cid: *record_cid,
                value,
            });
            if records_out.len() == limit && i + 1 < entries.len() {
                next_cursor = key.strip_prefix(&prefix).map(str::to_string);
            }
        }

        Ok((records_out, next_cursor))
    }

    /// The distinct collections present in a repository, sorted.
    pub async fn describe_repo<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
    ) -> Result<Vec<String>, RepoError> {
        let repo = self.open(storage, did, "describe_repo").await?;

        let mut collections = BTreeSet::new();
        for (key, _) in repo.tree.iter() {
            if let Some((collection, _)) = key.split_once('/') {
                collections.insert(collection.to_string());
            }
        }
        Ok(collections.into_iter().collect())
    }

    /// The current commit CID and rev.
    pub async fn get_root<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
    ) -> Result<(Cid, String), RepoError> {
        let root = storage
            .load_root(did)
            .await
            .map_err(|e| storage_error(did, "get_root", e))?
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        Ok((root.commit_cid, root.rev))
    }

    /// Streams the full repository as a CAR v1 archive.
    pub async fn export_repo<S: RepoStorage, W>(
        &self,
        storage: &S,
        did: &str,
        writer: W,
    ) -> Result<(), RepoError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let root = storage
            .load_root(did)
            .await
            .map_err(|e| storage_error(did, "export_repo", e))?
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        let blocks = storage
            .load_blocks(did)
            .await
            .map_err(|e| storage_error(did, "export_repo", e))?;
        blocks.export_car(root.commit_cid, writer).await
    }

    /// Loads the repo state: root row, block set (tracking-wrapped), the
    /// current commit, and the materialised tree.
    async fn open<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        op: &'static str,
    ) -> Result<OpenRepo, RepoError> {
        let root = storage
            .load_root(did)
            .await
            .map_err(|e| storage_error(did, op, e))?
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        let blocks = storage
            .load_blocks(did)
            .await
            .map_err(|e| storage_error(did, op, e))?;

        let store = TrackingBlockstore::new(blocks);
        let commit = Commit::load(&store, root.commit_cid)?;
        let tree = Tree::load(&store, commit.data)?;
        Ok(OpenRepo {
            store,
            tree,
            root,
            prev_data: commit.data,
        })
    }

    /// Writes dirty tree nodes, signs the new commit, exports the diff
    /// archive, and persists blocks + root atomically. Runs the commit
    /// hook before returning, still inside the caller's critical section.
    async fn commit_repo<S: RepoStorage>(
        &self,
        storage: &S,
        did: &str,
        key: &SigningKey,
        mut repo: OpenRepo,
        ops: Vec<RepoOp>,
        op: &'static str,
    ) -> Result<CommitResult, RepoError> {
        let data = repo.tree.write_blocks(&mut repo.store)?;

        let mut commit = Commit::new(did, Some(repo.root.commit_cid), data, tid::next_tid());
        commit.sign(key)?;
        let (commit_cid, commit_bytes) = commit.encode()?;
        repo.store.put(commit_cid, Bytes::from(commit_bytes));

        let mut diff = Vec::new();
        repo.store.export_diff_car(commit_cid, &mut diff).await?;

        let root = RepoRoot {
            commit_cid,
            rev: commit.rev.clone(),
        };
        storage
            .commit(did, repo.store.inner(), &root)
            .await
            .map_err(|e| storage_error(did, op, e))?;

        let result = CommitResult {
            commit_cid,
            rev: commit.rev,
            prev_rev: Some(repo.root.rev),
            prev_data: Some(repo.prev_data),
            ops,
            diff_car: Bytes::from(diff),
        };

        if let Some(hook) = &self.hook {
            if let Err(err) = hook.on_commit(did, &result).await {
                warn!(%did, "commit event emission failed: {err:#}");
                return Err(RepoError::EventEmission(err.to_string()));
            }
        }

        Ok(result)
    }
}

fn storage_error(did: &str, op: &str, err: StorageError) -> RepoError {
    error!(%did, op, "storage failure: {err}");
    RepoError::Storage(err)
}
