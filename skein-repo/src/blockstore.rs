//! In-memory content-addressed block storage.
//!
//! A repository's blocks are bulk-loaded from the tenant database into a
//! [`MemBlockstore`], mutated in memory, and persisted back after a
//! successful commit. The [`TrackingBlockstore`] wrapper snapshots the key
//! set at construction so the blocks added during a mutation — and only
//! those — can be exported as the firehose diff archive.

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use cid::Cid;
use tokio::io::AsyncWrite;

use iroh_car::{CarHeader, CarWriter};

use crate::error::RepoError;

/// Read/write access to a set of content-addressed blocks.
///
/// Blocks are immutable: putting the same CID twice is a no-op.
pub trait BlockStore {
    fn get(&self, cid: &Cid) -> Option<&Bytes>;
    fn put(&mut self, cid: Cid, data: Bytes);
    fn has(&self, cid: &Cid) -> bool;
}

/// An in-memory CID → bytes map holding one repository's blocks.
#[derive(Debug, Default, Clone)]
pub struct MemBlockstore {
    blocks: AHashMap<Cid, Bytes>,
}

impl MemBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Bytes)> {
        self.blocks.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Cid> {
        self.blocks.keys()
    }

    /// Writes all blocks as a CAR v1 archive, root block first.
    pub async fn export_car<W>(&self, root: Cid, writer: W) -> Result<(), RepoError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let root_block = self.blocks.get(&root).ok_or(RepoError::MissingRoot(root))?;

        let mut car = CarWriter::new(CarHeader::new_v1(vec![root]), writer);
        car.write(root, root_block).await?;
        for (cid, data) in &self.blocks {
            if *cid == root {
                continue;
            }
            car.write(*cid, data).await?;
        }
        car.finish().await?;
        Ok(())
    }
}

impl BlockStore for MemBlockstore {
    fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.blocks.get(cid)
    }

    fn put(&mut self, cid: Cid, data: Bytes) {
        self.blocks.entry(cid).or_insert(data);
    }

    fn has(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }
}

/// Wraps a [`MemBlockstore`], remembering which CIDs were present at
/// construction. Blocks added afterwards form the diff of the next commit.
#[derive(Debug)]
pub struct TrackingBlockstore {
    inner: MemBlockstore,
    preloaded: AHashSet<Cid>,
}

impl TrackingBlockstore {
    pub fn new(inner: MemBlockstore) -> Self {
        let preloaded = inner.blocks.keys().copied().collect();
        Self { inner, preloaded }
    }

    pub fn inner(&self) -> &MemBlockstore {
        &self.inner
    }

    pub fn into_inner(self) -> MemBlockstore {
        self.inner
    }

    /// CIDs of blocks added since the tracking snapshot.
    pub fn new_blocks(&self) -> impl Iterator<Item = (&Cid, &Bytes)> {
        self.inner
            .blocks
            .iter()
            .filter(|(cid, _)| !self.preloaded.contains(cid))
    }

    /// Writes only the blocks added since the snapshot as a CAR v1
    /// archive, root block first. This is the firehose payload: the new
    /// commit, the new tree nodes, and the new record blocks.
    pub async fn export_diff_car<W>(&self, root: Cid, writer: W) -> Result<(), RepoError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let root_block = self
            .inner
            .blocks
            .get(&root)
            .ok_or(RepoError::MissingRoot(root))?;

        let mut car = CarWriter::new(CarHeader::new_v1(vec![root]), writer);
        car.write(root, root_block).await?;
        for (cid, data) in self.new_blocks() {
            if *cid == root {
                continue;
            }
            car.write(*cid, data).await?;
        }
        car.finish().await?;
        Ok(())
    }
}

impl BlockStore for TrackingBlockstore {
    fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.inner.get(cid)
    }

    fn put(&mut self, cid: Cid, data: Bytes) {
        self.inner.put(cid, data);
    }

    fn has(&self, cid: &Cid) -> bool {
        self.inner.has(cid)
    }
}
