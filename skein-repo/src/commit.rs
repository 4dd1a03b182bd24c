//! Signed commit blocks.
//!
//! A commit names the repository owner, the MST root at a point in time,
//! and a revision, and carries a signature over the canonical encoding of
//! the other fields.

use std::collections::BTreeMap;

use cid::Cid;
use k256::ecdsa::{SigningKey, VerifyingKey};
use libipld::Ipld;

use crate::blockstore::BlockStore;
use crate::error::RepoError;
use crate::{records, signing};

/// Repository format version carried in every commit.
pub const REPO_VERSION: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub did: String,
    pub version: i64,
    pub prev: Option<Cid>,
    pub data: Cid,
    pub rev: String,
    pub sig: Vec<u8>,
}

impl Commit {
    /// Builds an unsigned commit. Call [`Commit::sign`] before encoding.
    pub fn new(did: &str, prev: Option<Cid>, data: Cid, rev: String) -> Self {
        Self {
            did: did.to_string(),
            version: REPO_VERSION,
            prev,
            data,
            rev,
            sig: Vec::new(),
        }
    }

    fn fields_ipld(&self, with_sig: bool) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("did".to_string(), Ipld::String(self.did.clone()));
        map.insert("version".to_string(), Ipld::Integer(self.version as i128));
        map.insert(
            "prev".to_string(),
            match self.prev {
                Some(cid) => Ipld::Link(cid),
                None => Ipld::Null,
            },
        );
        map.insert("data".to_string(), Ipld::Link(self.data));
        map.insert("rev".to_string(), Ipld::String(self.rev.clone()));
        if with_sig {
            map.insert("sig".to_string(), Ipld::Bytes(self.sig.clone()));
        }
        Ipld::Map(map)
    }

    /// Canonical encoding of everything except the signature — the bytes
    /// the signature covers.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>, RepoError> {
        records::encode(&self.fields_ipld(false))
    }

    /// Signs the commit, replacing any existing signature.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), RepoError> {
        let unsigned = self.unsigned_bytes()?;
        self.sig = signing::sign(key, &unsigned);
        Ok(())
    }

    /// Verifies the signature under the given public key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<bool, RepoError> {
        let unsigned = self.unsigned_bytes()?;
        Ok(signing::verify(key, &unsigned, &self.sig))
    }

    /// Canonical encoding of the signed commit and its CID.
    pub fn encode(&self) -> Result<(Cid, Vec<u8>), RepoError> {
        let bytes = records::encode(&self.fields_ipld(true))?;
        let cid = records::cid_for_cbor(&bytes);
        Ok((cid, bytes))
    }

    /// Loads and decodes the commit block at `cid`.
    pub fn load<B: BlockStore>(store: &B, cid: Cid) -> Result<Self, RepoError> {
        let bytes = store.get(&cid).ok_or(RepoError::MissingBlock(cid))?;
        let ipld = records::decode(bytes)?;
        Self::from_ipld(&ipld).map_err(|reason| RepoError::MalformedCommit { cid, reason })
    }

    fn from_ipld(ipld: &Ipld) -> Result<Self, String> {
        let Ipld::Map(map) = ipld else {
            return Err("commit is not a map".to_string());
        };
        let did = match map.get("did") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err("missing did".to_string()),
        };
        let version = match map.get("version") {
            Some(Ipld::Integer(v)) => *v as i64,
            _ => return Err("missing version".to_string()),
        };
        let prev = match map.get("prev") {
            Some(Ipld::Link(cid)) => Some(*cid),
            Some(Ipld::Null) | None => None,
            _ => return Err("bad prev".to_string()),
        };
        let data = match map.get("data") {
            Some(Ipld::Link(cid)) => *cid,
            _ => return Err("missing data".to_string()),
        };
        let rev = match map.get("rev") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err("missing rev".to_string()),
        };
        let sig = match map.get("sig") {
            Some(Ipld::Bytes(b)) => b.clone(),
            _ => return Err("missing sig".to_string()),
        };
        Ok(Self {
            did,
            version,
            prev,
            data,
            rev,
            sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::blockstore::MemBlockstore;
    use crate::tid;

    use super::*;

    fn test_key() -> SigningKey {
        signing::parse_key(&signing::generate_key()).unwrap()
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let data = records::cid_for_cbor(b"tree root");
        let mut commit = Commit::new("did:plc:abc123", None, data, tid::next_tid());
        commit.sign(&key).unwrap();

        assert!(commit.verify(key.verifying_key()).unwrap());

        let mut tampered = commit.clone();
        tampered.rev = tid::next_tid();
        assert!(!tampered.verify(key.verifying_key()).unwrap());
    }

    #[test]
    fn encode_load_round_trip() {
        let key = test_key();
        let data = records::cid_for_cbor(b"tree root");
        let prev = records::cid_for_cbor(b"previous commit");
        let mut commit = Commit::new("did:plc:abc123", Some(prev), data, tid::next_tid());
        commit.sign(&key).unwrap();

        let (cid, bytes) = commit.encode().unwrap();
        let mut store = MemBlockstore::new();
        store.put(cid, Bytes::from(bytes));

        let loaded = Commit::load(&store, cid).unwrap();
        assert_eq!(loaded, commit);
        assert_eq!(loaded.version, REPO_VERSION);
        assert_eq!(loaded.prev, Some(prev));
    }

    #[test]
    fn load_missing_block_fails() {
        let store = MemBlockstore::new();
        let cid = records::cid_for_cbor(b"nope");
        assert!(matches!(
            Commit::load(&store, cid),
            Err(RepoError::MissingBlock(c)) if c == cid
        ));
    }
}
