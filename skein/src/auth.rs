//! The authorisation facade.
//!
//! The HTTP layer resolves bearer tokens before the core is involved;
//! the core only sees a [`CallerIdentity`]. Writes require the caller to
//! be the repository owner or the administrator. Reads are public.

/// The already-authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    Administrator,
    Did(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("caller may not write to {0}")]
    Forbidden(String),
}

/// Permits a write to `target_did` for the administrator or the owner.
pub fn authorize_repo_write(caller: &CallerIdentity, target_did: &str) -> Result<(), AuthError> {
    match caller {
        CallerIdentity::Administrator => Ok(()),
        CallerIdentity::Did(did) if did == target_did => Ok(()),
        CallerIdentity::Did(_) => Err(AuthError::Forbidden(target_did.to_string())),
    }
}

/// Permits a host-management operation (tenant add/remove) for the
/// administrator only.
pub fn authorize_admin(caller: &CallerIdentity) -> Result<(), AuthError> {
    match caller {
        CallerIdentity::Administrator => Ok(()),
        CallerIdentity::Did(did) => Err(AuthError::Forbidden(did.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_admin_may_write() {
        let did = "did:plc:abc";
        assert!(authorize_repo_write(&CallerIdentity::Administrator, did).is_ok());
        assert!(authorize_repo_write(&CallerIdentity::Did(did.to_string()), did).is_ok());
    }

    #[test]
    fn other_callers_are_forbidden() {
        let err = authorize_repo_write(
            &CallerIdentity::Did("did:plc:other".to_string()),
            "did:plc:abc",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));

        assert!(authorize_admin(&CallerIdentity::Did("did:plc:abc".to_string())).is_err());
        assert!(authorize_admin(&CallerIdentity::Administrator).is_ok());
    }
}
