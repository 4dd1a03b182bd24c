//! The hosted-domain registry.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::TenantError;

/// One hosted domain.
#[derive(Debug, Clone)]
pub struct Domain {
    pub id: i32,
    pub domain: String,
    pub db_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type DomainRow = (i32, String, String, String, DateTime<Utc>, DateTime<Utc>);

impl From<DomainRow> for Domain {
    fn from((id, domain, db_name, status, created_at, updated_at): DomainRow) -> Self {
        Self {
            id,
            domain,
            db_name,
            status,
            created_at,
            updated_at,
        }
    }
}

const DOMAIN_COLUMNS: &str = "id, domain, db_name, status, created_at, updated_at";

/// Derives the tenant database name for a domain:
/// `skein_` + the domain with dots replaced by underscores.
pub fn sanitize_db_name(domain: &str) -> String {
    format!("skein_{}", domain.replace('.', "_"))
}

/// Validates a DNS-shaped domain name (lowercase labels of alphanumerics
/// and hyphens, at least two labels).
pub fn validate_domain_name(domain: &str) -> Result<(), TenantError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });
    if !valid {
        return Err(TenantError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

/// Domain CRUD against the management database.
pub struct DomainStore {
    pool: PgPool,
}

impl DomainStore {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    /// Registers a domain with status `active` and a generated db_name.
    /// A duplicate name fails with [`TenantError::DomainExists`].
    pub async fn add(&self, domain_name: &str) -> Result<Domain, TenantError> {
        validate_domain_name(domain_name)?;
        let db_name = sanitize_db_name(domain_name);

        let row: DomainRow = sqlx::query_as(&format!(
            "INSERT INTO domains (domain, db_name) VALUES ($1, $2) RETURNING {DOMAIN_COLUMNS}"
        ))
        .bind(domain_name)
        .bind(&db_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if TenantError::is_unique_violation(&err) {
                TenantError::DomainExists(domain_name.to_string())
            } else {
                err.into()
            }
        })?;
        Ok(row.into())
    }

    pub async fn get_by_name(&self, domain_name: &str) -> Result<Domain, TenantError> {
        let row: Option<DomainRow> = sqlx::query_as(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE domain = $1"
        ))
        .bind(domain_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Domain::from)
            .ok_or_else(|| TenantError::DomainNotFound(domain_name.to_string()))
    }

    /// All domains, ordered by name.
    pub async fn list(&self) -> Result<Vec<Domain>, TenantError> {
        let rows: Vec<DomainRow> = sqlx::query_as(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains ORDER BY domain"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Domain::from).collect())
    }

    /// Domains with status `active`, ordered by name.
    pub async fn list_active(&self) -> Result<Vec<Domain>, TenantError> {
        let rows: Vec<DomainRow> = sqlx::query_as(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE status = 'active' ORDER BY domain"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Domain::from).collect())
    }

    /// Updates a domain's status (`active` or `disabled`).
    pub async fn set_status(&self, domain_name: &str, status: &str) -> Result<Domain, TenantError> {
        let row: Option<DomainRow> = sqlx::query_as(&format!(
            "UPDATE domains SET status = $1, updated_at = NOW() WHERE domain = $2 \
             RETURNING {DOMAIN_COLUMNS}"
        ))
        .bind(status)
        .bind(domain_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Domain::from)
            .ok_or_else(|| TenantError::DomainNotFound(domain_name.to_string()))
    }

    /// Deletes a domain, returning its db_name so the caller can drop the
    /// tenant database. Routing rows cascade away with the domain.
    pub async fn remove(&self, domain_name: &str) -> Result<String, TenantError> {
        let row: Option<(String,)> =
            sqlx::query_as("DELETE FROM domains WHERE domain = $1 RETURNING db_name")
                .bind(domain_name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(db_name,)| db_name)
            .ok_or_else(|| TenantError::DomainNotFound(domain_name.to_string()))
    }
}
