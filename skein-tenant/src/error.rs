#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("no tenant hosts {0}")]
    TenantNotFound(String),

    #[error("no hosted domain matches handle {0}")]
    HandleNotFound(String),

    #[error("domain already exists: {0}")]
    DomainExists(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl TenantError {
    /// True when the underlying database error is a unique-constraint
    /// violation, the signal for add conflicts.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .is_some_and(|db| db.is_unique_violation())
    }
}
