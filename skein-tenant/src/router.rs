//! Two-level tenant resolution: DID → domain → pool.

use sqlx::PgPool;
use tracing::info;

use crate::domains::{Domain, DomainStore};
use crate::error::TenantError;
use crate::management::ManagementDb;
use crate::pools::{PoolConfig, PoolManager};

/// Routes external identifiers (DIDs, handles) to tenant pools and owns
/// tenant lifecycle.
pub struct TenantRouter {
    management: ManagementDb,
    domains: DomainStore,
    pools: PoolManager,
}

impl TenantRouter {
    pub fn new(management: ManagementDb, conn_base: &str, config: PoolConfig) -> Self {
        let domains = DomainStore::new(management.pool());
        let pools = PoolManager::new(conn_base, config);
        Self {
            management,
            domains,
            pools,
        }
    }

    pub fn management(&self) -> &ManagementDb {
        &self.management
    }

    pub fn domains(&self) -> &DomainStore {
        &self.domains
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    /// The tenant pool hosting a DID. Fails with `TenantNotFound` when the
    /// DID has no routing row or its domain has no open pool.
    pub async fn resolve_did(&self, did: &str) -> Result<PgPool, TenantError> {
        let domain = self
            .management
            .lookup_did_domain(did)
            .await?
            .ok_or_else(|| TenantError::TenantNotFound(did.to_string()))?;
        self.pools
            .get(&domain)
            .ok_or_else(|| TenantError::TenantNotFound(did.to_string()))
    }

    /// The tenant pool hosting a handle, by longest-suffix domain match.
    pub fn resolve_handle(&self, handle: &str) -> Result<(String, PgPool), TenantError> {
        self.pools
            .resolve_handle(handle)
            .ok_or_else(|| TenantError::HandleNotFound(handle.to_string()))
    }

    /// Registers a domain, creates its physical database, applies the
    /// tenant schema, and publishes the pool.
    ///
    /// Concurrent adds for one domain converge on a single live pool. A
    /// domain that is already fully active fails with `DomainExists`; a
    /// row left behind by a crashed partial add is adopted and its
    /// bootstrap resumed.
    pub async fn add_tenant(&self, domain_name: &str) -> Result<Domain, TenantError> {
        let domain = match self.domains.add(domain_name).await {
            Ok(domain) => domain,
            Err(TenantError::DomainExists(_)) => {
                if self.pools.get(domain_name).is_some() {
                    return Err(TenantError::DomainExists(domain_name.to_string()));
                }
                self.domains.get_by_name(domain_name).await?
            }
            Err(err) => return Err(err),
        };

        self.management.create_tenant_db(&domain.db_name).await?;
        self.pools.add(&domain.domain, &domain.db_name).await?;
        info!(domain = %domain.domain, "tenant active");
        Ok(domain)
    }

    /// Removes a domain: closes its pool, drops its database, deletes the
    /// registry row (routing rows cascade).
    pub async fn remove_tenant(&self, domain_name: &str) -> Result<(), TenantError> {
        let db_name = self.domains.remove(domain_name).await?;
        self.pools.remove(domain_name).await;
        self.management.drop_tenant_db(&db_name).await?;
        info!(domain = %domain_name, "tenant removed");
        Ok(())
    }

    /// Opens pools for every active domain. Called at startup.
    pub async fn open_active_pools(&self) -> Result<usize, TenantError> {
        let domains = self.domains.list_active().await?;
        let mut opened = 0;
        for domain in domains {
            self.pools.add(&domain.domain, &domain.db_name).await?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Closes every pool, tenant and management alike.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        self.management.close().await;
    }
}
