use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum PdsError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Tenant(#[from] skein_tenant::TenantError),

    #[error(transparent)]
    Repo(#[from] skein_repo::RepoError),

    #[error(transparent)]
    Events(#[from] skein_events::EventError),
}
