//! Merkle Search Tree: the ordered key → CID map at the heart of every
//! repository.
//!
//! The tree shape is a pure function of its contents. A key's layer is the
//! number of leading zero bits in `sha256(key)`, counted in two-bit steps;
//! a node carries the keys of the highest layer in its span in order, with
//! subtree pointers in the gaps linking directly to the next populated
//! node below — skipped layers are not padded, and no node other than the
//! empty tree's root is ever entry-less. Serialising the same key set
//! therefore always produces the same root CID, no matter the insertion
//! order.
//!
//! Node wire layout (DAG-CBOR): `{"l": link|null, "e": [entry...]}` where
//! entry is `{"p": int, "k": bytes, "v": link, "t": link|null}` — `p` is
//! the byte length shared with the previous key in the same node and `k`
//! the remaining suffix.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::Cid;
use libipld::Ipld;
use sha2::{Digest, Sha256};

use crate::blockstore::BlockStore;
use crate::error::RepoError;
use crate::records;

/// An ordered, persistent key → CID map.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    leaves: BTreeMap<String, Cid>,
}

impl Tree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Materialises a tree from its root node, reading blocks from `store`.
    pub fn load<B: BlockStore>(store: &B, root: Cid) -> Result<Self, RepoError> {
        let mut leaves = BTreeMap::new();
        read_node(store, root, &mut leaves)?;
        Ok(Self { leaves })
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Cid> {
        self.leaves.get(key).copied()
    }

    /// Inserts or replaces a key, returning the previous value if any.
    pub fn insert(&mut self, key: &str, value: Cid) -> Option<Cid> {
        self.leaves.insert(key.to_string(), value)
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Cid> {
        self.leaves.remove(key)
    }

    /// Iterates `(key, value)` pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Cid)> {
        self.leaves.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Serialises the node DAG into `store` and returns the root CID.
    ///
    /// Nodes the store already holds keep their CID and are not re-put, so
    /// a tracking store observes exactly the nodes new to this tree.
    pub fn write_blocks<B: BlockStore>(&self, store: &mut B) -> Result<Cid, RepoError> {
        let leaves: Vec<Leaf<'_>> = self
            .leaves
            .iter()
            .map(|(key, value)| Leaf {
                key,
                value: *value,
                layer: key_layer(key),
            })
            .collect();
        write_node(store, &leaves)
    }
}

struct Leaf<'a> {
    key: &'a str,
    value: Cid,
    layer: u32,
}

/// A key's layer: leading zero bits of its SHA-256, in two-bit steps.
fn key_layer(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut zeros = 0u32;
    for byte in digest {
        if byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros / 2
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Writes the node for a run of leaves. The node sits at the highest layer
/// present in the run; the runs of lower-layer leaves between its keys
/// become subtrees, each rooted at its own highest populated layer, so a
/// layer gap is bridged by a direct link rather than an empty node.
fn write_node<B: BlockStore>(store: &mut B, leaves: &[Leaf<'_>]) -> Result<Cid, RepoError> {
    let layer = leaves.iter().map(|l| l.layer).max().unwrap_or(0);
    let mut i = 0;

    while i < leaves.len() && leaves[i].layer < layer {
        i += 1;
    }
    let left = if i > 0 {
        Some(write_node(store, &leaves[..i])?)
    } else {
        None
    };

    let mut entries = Vec::new();
    let mut prev_key: &[u8] = &[];
    while i < leaves.len() {
        let leaf = &leaves[i];
        i += 1;

        let start = i;
        while i < leaves.len() && leaves[i].layer < layer {
            i += 1;
        }
        let right = if i > start {
            Some(write_node(store, &leaves[start..i])?)
        } else {
            None
        };

        let key = leaf.key.as_bytes();
        let p = common_prefix_len(prev_key, key);
        let mut entry = BTreeMap::new();
        entry.insert("p".to_string(), Ipld::Integer(p as i128));
        entry.insert("k".to_string(), Ipld::Bytes(key[p..].to_vec()));
        entry.insert("v".to_string(), Ipld::Link(leaf.value));
        entry.insert(
            "t".to_string(),
            match right {
                Some(cid) => Ipld::Link(cid),
                None => Ipld::Null,
            },
        );
        entries.push(Ipld::Map(entry));
        prev_key = key;
    }

    let mut node = BTreeMap::new();
    node.insert("e".to_string(), Ipld::List(entries));
    node.insert(
        "l".to_string(),
        match left {
            Some(cid) => Ipld::Link(cid),
            None => Ipld::Null,
        },
    );

    let bytes = records::encode(&Ipld::Map(node))?;
    let cid = records::cid_for_cbor(&bytes);
    if !store.has(&cid) {
        store.put(cid, Bytes::from(bytes));
    }
    Ok(cid)
}

fn read_node<B: BlockStore>(
    store: &B,
    cid: Cid,
    leaves: &mut BTreeMap<String, Cid>,
) -> Result<(), RepoError> {
    let malformed = |reason: &str| RepoError::MalformedNode {
        cid,
        reason: reason.to_string(),
    };

    let bytes = store.get(&cid).ok_or(RepoError::MissingBlock(cid))?;
    let ipld = records::decode(bytes)?;
    let Ipld::Map(map) = ipld else {
        return Err(malformed("node is not a map"));
    };

    match map.get("l") {
        Some(Ipld::Link(left)) => read_node(store, *left, leaves)?,
        Some(Ipld::Null) | None => {}
        _ => return Err(malformed("bad left pointer")),
    }

    let Some(Ipld::List(entries)) = map.get("e") else {
        return Err(malformed("missing entry list"));
    };

    let mut prev_key: Vec<u8> = Vec::new();
    for entry in entries {
        let Ipld::Map(entry) = entry else {
            return Err(malformed("entry is not a map"));
        };
        let p = match entry.get("p") {
            Some(Ipld::Integer(p)) if *p >= 0 => *p as usize,
            _ => return Err(malformed("bad prefix length")),
        };
        if p > prev_key.len() {
            return Err(malformed("prefix length exceeds previous key"));
        }
        let suffix = match entry.get("k") {
            Some(Ipld::Bytes(k)) => k,
            _ => return Err(malformed("bad key suffix")),
        };
        let value = match entry.get("v") {
            Some(Ipld::Link(v)) => *v,
            _ => return Err(malformed("bad value link")),
        };

        let mut key = prev_key[..p].to_vec();
        key.extend_from_slice(suffix);
        let key_str =
            String::from_utf8(key.clone()).map_err(|_| malformed("key is not utf-8"))?;
        leaves.insert(key_str, value);

        match entry.get("t") {
            Some(Ipld::Link(right)) => read_node(store, *right, leaves)?,
            Some(Ipld::Null) | None => {}
            _ => return Err(malformed("bad right pointer")),
        }

        prev_key = key;
    }

    Ok(())
}
