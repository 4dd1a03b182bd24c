use cid::Cid;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("no repository for {0}")]
    RepoNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("root block not found: {0}")]
    MissingRoot(Cid),

    #[error("block not found: {0}")]
    MissingBlock(Cid),

    #[error("malformed commit block {cid}: {reason}")]
    MalformedCommit { cid: Cid, reason: String },

    #[error("malformed tree node {cid}: {reason}")]
    MalformedNode { cid: Cid, reason: String },

    #[error(transparent)]
    Signing(#[from] crate::signing::SigningError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Car(#[from] iroh_car::Error),

    #[error("commit event emission failed: {0}")]
    EventEmission(String),

    #[error("cbor: {0}")]
    Cbor(String),
}

impl From<libipld::error::Error> for RepoError {
    fn from(err: libipld::error::Error) -> Self {
        RepoError::Cbor(err.to_string())
    }
}
