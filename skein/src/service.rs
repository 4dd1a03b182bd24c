//! The assembled server core.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncWrite;

use skein_events::{EventManager, PgEventStore, Subscription};
use skein_repo::{CommitResult, PgRepoStorage, RecordEntry, RepoManager};
use skein_tenant::{Domain, ManagementDb, TenantRouter};

use crate::auth::{authorize_admin, authorize_repo_write, CallerIdentity};
use crate::config::Config;
use crate::error::PdsError;

/// The server core: tenant routing, the repository engine, and the
/// firehose, wired so every commit is sequenced and broadcast inside the
/// engine's per-DID critical section.
pub struct Pds {
    router: TenantRouter,
    repos: RepoManager,
    events: Arc<EventManager<PgEventStore>>,
}

impl Pds {
    /// Connects to the management database, bootstraps schemas, opens the
    /// pools of every active tenant, and assembles the pipeline.
    pub async fn open(config: &Config) -> Result<Self, PdsError> {
        let pool_config = config.pool_config();
        let management = ManagementDb::open(&config.management_url, &pool_config).await?;
        let events = Arc::new(EventManager::new(
            PgEventStore::new(management.pool()),
            config.subscriber_queue_capacity,
        ));
        let router = TenantRouter::new(management, &config.tenant_db_connection_base, pool_config);
        router.open_active_pools().await?;

        let repos = RepoManager::with_hook(events.clone());
        Ok(Self {
            router,
            repos,
            events,
        })
    }

    pub fn router(&self) -> &TenantRouter {
        &self.router
    }

    async fn storage_for(&self, did: &str) -> Result<PgRepoStorage, PdsError> {
        let pool = self.router.resolve_did(did).await?;
        Ok(PgRepoStorage::new(&pool))
    }

    // Tenant lifecycle (administrator only).

    pub async fn add_tenant(
        &self,
        caller: &CallerIdentity,
        domain: &str,
    ) -> Result<Domain, PdsError> {
        authorize_admin(caller)?;
        Ok(self.router.add_tenant(domain).await?)
    }

    pub async fn remove_tenant(
        &self,
        caller: &CallerIdentity,
        domain: &str,
    ) -> Result<(), PdsError> {
        authorize_admin(caller)?;
        Ok(self.router.remove_tenant(domain).await?)
    }

    // Repository writes (owner or administrator).

    pub async fn init_repo(
        &self,
        caller: &CallerIdentity,
        did: &str,
        signing_key: &str,
    ) -> Result<(), PdsError> {
        authorize_repo_write(caller, did)?;
        let storage = self.storage_for(did).await?;
        Ok(self.repos.init_repo(&storage, did, signing_key).await?)
    }

    pub async fn create_record(
        &self,
        caller: &CallerIdentity,
        did: &str,
        signing_key: &str,
        collection: &str,
        record: &Value,
    ) -> Result<(String, CommitResult), PdsError> {
        authorize_repo_write(caller, did)?;
        let storage = self.storage_for(did).await?;
        Ok(self
            .repos
            .create_record(&storage, did, signing_key, collection, record)
            .await?)
    }

    pub async fn put_record(
        &self,
        caller: &CallerIdentity,
        did: &str,
        signing_key: &str,
        collection: &str,
        rkey: &str,
        record: &Value,
    ) -> Result<(String, CommitResult), PdsError> {
        authorize_repo_write(caller, did)?;
        let storage = self.storage_for(did).await?;
        Ok(self
            .repos
            .put_record(&storage, did, signing_key, collection, rkey, record)
            .await?)
    }

    pub async fn delete_record(
        &self,
        caller: &CallerIdentity,
        did: &str,
        signing_key: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<CommitResult, PdsError> {
        authorize_repo_write(caller, did)?;
        let storage = self.storage_for(did).await?;
        Ok(self
            .repos
            .delete_record(&storage, did, signing_key, collection, rkey)
            .await?)
    }

    // Repository reads (public).

    pub async fn get_record(
        &self,
        did: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<(cid::Cid, Value), PdsError> {
        let storage = self.storage_for(did).await?;
        Ok(self.repos.get_record(&storage, did, collection, rkey).await?)
    }

    pub async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
        reverse: bool,
    ) -> Result<(Vec<RecordEntry>, Option<String>), PdsError> {
        let storage = self.storage_for(did).await?;
        Ok(self
            .repos
            .list_records(&storage, did, collection, limit, cursor, reverse)
            .await?)
    }

    pub async fn describe_repo(&self, did: &str) -> Result<Vec<String>, PdsError> {
        let storage = self.storage_for(did).await?;
        Ok(self.repos.describe_repo(&storage, did).await?)
    }

    pub async fn get_root(&self, did: &str) -> Result<(cid::Cid, String), PdsError> {
        let storage = self.storage_for(did).await?;
        Ok(self.repos.get_root(&storage, did).await?)
    }

    pub async fn export_repo<W>(&self, did: &str, writer: W) -> Result<(), PdsError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let storage = self.storage_for(did).await?;
        Ok(self.repos.export_repo(&storage, did, writer).await?)
    }

    // Firehose.

    /// Subscribes to the firehose, optionally replaying from a cursor.
    pub fn subscribe(&self, since: Option<i64>) -> Subscription {
        self.events.subscribe(since)
    }

    /// Closes subscribers and pools. Call during graceful shutdown.
    pub async fn shutdown(&self) {
        self.events.close();
        self.router.shutdown().await;
    }
}
