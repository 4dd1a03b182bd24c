//! Server configuration.

use serde::{Deserialize, Serialize};

use skein_tenant::PoolConfig;

/// The signing-key algorithm this server issues and accepts.
pub const PRIVATE_KEY_ALGORITHM: &str = "secp256k1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Connection string of the management database.
    pub management_url: String,
    /// Connection string template for tenant databases, without a
    /// database name (e.g. `postgres://skein:pw@localhost:5432`).
    pub tenant_db_connection_base: String,
    /// Per-subscriber firehose frame buffer.
    pub subscriber_queue_capacity: usize,
    pub pool_max_conns: u32,
    pub pool_min_conns: u32,
    /// Maximum connection lifetime, seconds.
    pub pool_max_lifetime: u64,
    /// Idle connection timeout, seconds.
    pub pool_max_idle: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            management_url: "postgres://skein@localhost:5432/skein".to_string(),
            tenant_db_connection_base: "postgres://skein@localhost:5432".to_string(),
            subscriber_queue_capacity: skein_events::manager::DEFAULT_QUEUE_CAPACITY,
            pool_max_conns: 10,
            pool_min_conns: 1,
            pool_max_lifetime: 30 * 60,
            pool_max_idle: 5 * 60,
        }
    }
}

impl Config {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_conns: self.pool_max_conns,
            min_conns: self.pool_min_conns,
            max_lifetime: std::time::Duration::from_secs(self.pool_max_lifetime),
            idle_timeout: std::time::Duration::from_secs(self.pool_max_idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_sizing() {
        let config = Config::default();
        assert_eq!(config.subscriber_queue_capacity, 256);
        assert_eq!(config.pool_max_conns, 10);
        assert_eq!(config.pool_config().max_lifetime.as_secs(), 1800);
    }

    #[test]
    fn keys_deserialize_in_camel_case() {
        let config: Config = serde_json::from_str(
            r#"{"tenantDbConnectionBase": "postgres://pds@db:5432", "subscriberQueueCapacity": 64}"#,
        )
        .unwrap();
        assert_eq!(config.tenant_db_connection_base, "postgres://pds@db:5432");
        assert_eq!(config.subscriber_queue_capacity, 64);
        assert_eq!(config.pool_max_conns, 10);
    }
}
