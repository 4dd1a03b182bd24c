//! Repository persistence.
//!
//! [`RepoStorage`] is the seam between the engine and the tenant database:
//! load the root row, bulk-load the block set, and atomically persist a
//! commit (block upserts plus the root update in one transaction).
//! [`PgRepoStorage`] is the Postgres implementation; [`MemRepoStorage`] is
//! a drop-in in-memory replacement used by tests.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use parking_lot::Mutex;
use sqlx::PgPool;

use crate::blockstore::{BlockStore, MemBlockstore};

/// The current commit head of one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRoot {
    pub commit_cid: Cid,
    pub rev: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("invalid cid in storage: {0}")]
    InvalidCid(#[from] cid::Error),
}

#[async_trait]
pub trait RepoStorage: Send + Sync {
    /// Returns the root row for a DID, or `None` if the repo does not exist.
    async fn load_root(&self, did: &str) -> Result<Option<RepoRoot>, StorageError>;

    /// Loads every block belonging to a DID.
    async fn load_blocks(&self, did: &str) -> Result<MemBlockstore, StorageError>;

    /// Persists all blocks (idempotent upserts — blocks are immutable) and
    /// moves the root, atomically. This is the linearisation point of a
    /// write: once it returns the commit is durable.
    async fn commit(
        &self,
        did: &str,
        blocks: &MemBlockstore,
        root: &RepoRoot,
    ) -> Result<(), StorageError>;
}

/// Postgres-backed repository storage over a tenant pool.
#[derive(Debug, Clone)]
pub struct PgRepoStorage {
    pool: PgPool,
}

impl PgRepoStorage {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl RepoStorage for PgRepoStorage {
    async fn load_root(&self, did: &str) -> Result<Option<RepoRoot>, StorageError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT commit_cid, rev FROM repo_roots WHERE did = $1")
                .bind(did)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((commit_cid, rev)) => Ok(Some(RepoRoot {
                commit_cid: Cid::try_from(commit_cid.as_str())?,
                rev,
            })),
            None => Ok(None),
        }
    }

    async fn load_blocks(&self, did: &str) -> Result<MemBlockstore, StorageError> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT cid, data FROM repo_blocks WHERE did = $1")
                .bind(did)
                .fetch_all(&self.pool)
                .await?;

        let mut store = MemBlockstore::new();
        for (cid, data) in rows {
            store.put(Cid::try_from(cid.as_str())?, Bytes::from(data));
        }
        Ok(store)
    }

    async fn commit(
        &self,
        did: &str,
        blocks: &MemBlockstore,
        root: &RepoRoot,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (cid, data) in blocks.iter() {
            sqlx::query(
                "INSERT INTO repo_blocks (did, cid, data) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(did)
            .bind(cid.to_string())
            .bind(data.as_ref())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO repo_roots (did, commit_cid, rev) VALUES ($1, $2, $3) \
             ON CONFLICT (did) DO UPDATE SET commit_cid = $2, rev = $3, updated_at = NOW()",
        )
        .bind(did)
        .bind(root.commit_cid.to_string())
        .bind(&root.rev)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// In-memory repository storage, a drop-in replacement for
/// [`PgRepoStorage`] in tests.
#[derive(Debug, Default, Clone)]
pub struct MemRepoStorage {
    repos: Arc<Mutex<AHashMap<String, MemRepo>>>,
}

#[derive(Debug)]
struct MemRepo {
    blocks: AHashMap<Cid, Bytes>,
    root: RepoRoot,
}

impl MemRepoStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The CIDs currently stored for a DID. Test helper.
    pub fn block_cids(&self, did: &str) -> Vec<Cid> {
        self.repos
            .lock()
            .get(did)
            .map(|repo| repo.blocks.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RepoStorage for MemRepoStorage {
    async fn load_root(&self, did: &str) -> Result<Option<RepoRoot>, StorageError> {
        Ok(self.repos.lock().get(did).map(|repo| repo.root.clone()))
    }

    async fn load_blocks(&self, did: &str) -> Result<MemBlockstore, StorageError> {
        let mut store = MemBlockstore::new();
        if let Some(repo) = self.repos.lock().get(did) {
            for (cid, data) in &repo.blocks {
                store.put(*cid, data.clone());
            }
        }
        Ok(store)
    }

    async fn commit(
        &self,
        did: &str,
        blocks: &MemBlockstore,
        root: &RepoRoot,
    ) -> Result<(), StorageError> {
        let mut repos = self.repos.lock();
        let repo = repos.entry(did.to_string()).or_insert_with(|| MemRepo {
            blocks: AHashMap::new(),
            root: root.clone(),
        });
        for (cid, data) in blocks.iter() {
            repo.blocks.entry(*cid).or_insert_with(|| data.clone());
        }
        repo.root = root.clone();
        Ok(())
    }
}
