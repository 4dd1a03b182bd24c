//! The management database: tenant DDL and DID routing.

use sqlx::PgPool;
use tracing::debug;

use crate::error::TenantError;
use crate::pools::PoolConfig;
use crate::schema;

/// Postgres error code for `CREATE DATABASE` on an existing database.
const DUPLICATE_DATABASE: &str = "42P04";

/// Wraps the management pool (domain registry, DID routing, firehose log).
pub struct ManagementDb {
    pool: PgPool,
}

impl ManagementDb {
    /// Connects to the management database and bootstraps its schema.
    pub async fn open(url: &str, config: &PoolConfig) -> Result<Self, TenantError> {
        let pool = config.options().connect(url).await?;
        sqlx::raw_sql(schema::MANAGEMENT_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates the physical database for a tenant. Converges when the
    /// database already exists, so concurrent adds and crash-restarted
    /// partial adds succeed.
    ///
    /// `CREATE DATABASE` cannot be parameterised, so the name is embedded
    /// as a quoted identifier after a character-set check.
    pub async fn create_tenant_db(&self, db_name: &str) -> Result<(), TenantError> {
        ensure_db_identifier(db_name)?;
        match sqlx::raw_sql(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_database(&err) => {
                debug!(%db_name, "tenant database already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drops a tenant database. Used at domain removal.
    pub async fn drop_tenant_db(&self, db_name: &str) -> Result<(), TenantError> {
        ensure_db_identifier(db_name)?;
        sqlx::raw_sql(&format!(r#"DROP DATABASE IF EXISTS "{db_name}""#))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a DID → domain routing row. Idempotent.
    pub async fn insert_did_route(&self, did: &str, domain: &str) -> Result<(), TenantError> {
        sqlx::query("INSERT INTO did_routing (did, domain) VALUES ($1, $2) ON CONFLICT (did) DO NOTHING")
            .bind(did)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a DID → domain routing row.
    pub async fn remove_did_route(&self, did: &str) -> Result<(), TenantError> {
        sqlx::query("DELETE FROM did_routing WHERE did = $1")
            .bind(did)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The home domain for a DID, if it has an account on this host.
    pub async fn lookup_did_domain(&self, did: &str) -> Result<Option<String>, TenantError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT domain FROM did_routing WHERE did = $1")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(domain,)| domain))
    }
}

fn is_duplicate_database(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == DUPLICATE_DATABASE)
}

/// Tenant database names are generated internally from domain names, but
/// they end up inside quoted identifiers — reject anything outside the
/// expected character set.
fn ensure_db_identifier(name: &str) -> Result<(), TenantError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(TenantError::InvalidDomain(format!(
            "bad tenant database name: {name:?}"
        )));
    }
    Ok(())
}
