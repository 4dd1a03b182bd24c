#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("malformed event payload at seq {seq}: {reason}")]
    MalformedPayload { seq: i64, reason: String },

    #[error("cbor: {0}")]
    Cbor(String),
}

impl From<libipld::error::Error> for EventError {
    fn from(err: libipld::error::Error) -> Self {
        EventError::Cbor(err.to_string())
    }
}
