//! Server configuration.
//!
//! Values overlay in precedence order: environment variable over process
//! override over configuration file. The file is TOML, selected by the
//! `environment` property: `sqlrelay.toml` or `sqlrelay-<env>.toml`.
//! Environment variables are the upper-cased property path with dots
//! replaced by underscores, prefixed `SQLRELAY_`.

use crate::datasource::DatasourceDefaults;
use crate::segregator::SegregationConfig;
use sqlrelay_impl::{RelayError, RelayResult};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound on concurrently processed requests.
    pub thread_pool_size: usize,
    /// Largest accepted request, in bytes.
    pub max_request_size: u32,
    /// Idle client connections are dropped after this.
    pub connection_idle_timeout_ms: u64,
    /// Back-end execution timeout per statement; 0 disables it.
    pub statement_timeout_ms: u64,
    pub allowed_ips: String,
    pub fetch: FetchSection,
    pub segregation: SegregationSection,
    pub xa: XaSection,
    /// Pool defaults for every datasource.
    pub pool: PoolSection,
    /// Per-datasource pool overrides, keyed by logical name.
    pub datasources: HashMap<String, PoolSection>,
    /// Process-level placeholder values, keyed by full placeholder name.
    pub placeholders: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1528,
            thread_pool_size: 32,
            max_request_size: 16_000_000,
            connection_idle_timeout_ms: 600_000,
            statement_timeout_ms: 0,
            allowed_ips: "*".to_string(),
            fetch: FetchSection::default(),
            segregation: SegregationSection::default(),
            xa: XaSection::default(),
            pool: PoolSection::default(),
            datasources: HashMap::new(),
            placeholders: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSection {
    pub rows_per_block: u32,
    pub lob_block_size: u32,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            rows_per_block: sqlrelay_impl::DEFAULT_ROWS_PER_BLOCK,
            lob_block_size: sqlrelay_impl::DEFAULT_LOB_BLOCK_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegregationSection {
    pub enabled: bool,
    pub slow_slot_percentage: u32,
    pub idle_timeout_ms: u64,
    pub slow_slot_timeout_ms: u64,
    pub fast_slot_timeout_ms: u64,
    pub min_samples: u64,
}

impl Default for SegregationSection {
    fn default() -> Self {
        let d = SegregationConfig::default();
        Self {
            enabled: d.enabled,
            slow_slot_percentage: d.slow_slot_percentage,
            idle_timeout_ms: u64::try_from(d.idle_timeout.as_millis()).unwrap_or(u64::MAX),
            slow_slot_timeout_ms: u64::try_from(d.slow_slot_timeout.as_millis())
                .unwrap_or(u64::MAX),
            fast_slot_timeout_ms: u64::try_from(d.fast_slot_timeout.as_millis())
                .unwrap_or(u64::MAX),
            min_samples: d.min_samples,
        }
    }
}

impl SegregationSection {
    pub fn to_segregation_config(self) -> SegregationConfig {
        SegregationConfig {
            enabled: self.enabled,
            slow_slot_percentage: self.slow_slot_percentage.min(100),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            slow_slot_timeout: Duration::from_millis(self.slow_slot_timeout_ms),
            fast_slot_timeout: Duration::from_millis(self.fast_slot_timeout_ms),
            min_samples: self.min_samples,
            ..SegregationConfig::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XaSection {
    pub max_transactions: u32,
    pub start_timeout_ms: u64,
}

impl Default for XaSection {
    fn default() -> Self {
        Self {
            max_transactions: 16,
            start_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub maximum_pool_size: Option<u32>,
    pub minimum_idle: Option<u32>,
    pub connection_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub max_lifetime_ms: Option<u64>,
    pub default_transaction_isolation: Option<i32>,
}

impl PoolSection {
    fn write_properties(self, properties: &mut HashMap<String, String>) {
        fn put<T: ToString>(
            properties: &mut HashMap<String, String>,
            key: &str,
            value: Option<T>,
        ) {
            if let Some(value) = value {
                properties.insert(key.to_string(), value.to_string());
            }
        }
        put(
            properties,
            "connection.pool.maximumPoolSize",
            self.maximum_pool_size,
        );
        put(properties, "connection.pool.minimumIdle", self.minimum_idle);
        put(
            properties,
            "connection.pool.connectionTimeout",
            self.connection_timeout_ms,
        );
        put(properties, "connection.pool.idleTimeout", self.idle_timeout_ms);
        put(properties, "connection.pool.maxLifetime", self.max_lifetime_ms);
        put(
            properties,
            "connection.pool.defaultTransactionIsolation",
            self.default_transaction_isolation,
        );
    }
}

impl ServerConfig {
    /// Loads the configuration file for the given environment and applies
    /// the environment-variable overlay.
    pub fn load(environment: Option<&str>, directory: &Path) -> RelayResult<Self> {
        let file_name = match environment {
            Some(env) => format!("sqlrelay-{env}.toml"),
            None => "sqlrelay.toml".to_string(),
        };
        let path = directory.join(file_name);
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text)
                .map_err(|e| RelayError::ConfigInvalid(format!("{}: {e}", path.display())))?
        } else {
            debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };
        config.overlay_env();
        Ok(config)
    }

    // environment variables win over file values
    fn overlay_env(&mut self) {
        fn env<T: std::str::FromStr>(key: &str, target: &mut T) {
            if let Ok(value) = std::env::var(key) {
                if let Ok(parsed) = value.parse() {
                    *target = parsed;
                }
            }
        }
        env("SQLRELAY_PORT", &mut self.port);
        env("SQLRELAY_THREAD_POOL_SIZE", &mut self.thread_pool_size);
        env("SQLRELAY_MAX_REQUEST_SIZE", &mut self.max_request_size);
        env(
            "SQLRELAY_CONNECTION_IDLE_TIMEOUT",
            &mut self.connection_idle_timeout_ms,
        );
        env("SQLRELAY_STATEMENT_TIMEOUT", &mut self.statement_timeout_ms);
        env("SQLRELAY_ALLOWED_IPS", &mut self.allowed_ips);
        env(
            "SQLRELAY_FETCH_ROWS_PER_BLOCK",
            &mut self.fetch.rows_per_block,
        );
        env(
            "SQLRELAY_FETCH_LOB_BLOCK_SIZE",
            &mut self.fetch.lob_block_size,
        );
        env("SQLRELAY_SEGREGATION_ENABLED", &mut self.segregation.enabled);
        env(
            "SQLRELAY_SEGREGATION_SLOW_SLOT_PERCENTAGE",
            &mut self.segregation.slow_slot_percentage,
        );
        env(
            "SQLRELAY_SEGREGATION_IDLE_TIMEOUT",
            &mut self.segregation.idle_timeout_ms,
        );
        env(
            "SQLRELAY_SEGREGATION_SLOW_SLOT_TIMEOUT",
            &mut self.segregation.slow_slot_timeout_ms,
        );
        env(
            "SQLRELAY_SEGREGATION_FAST_SLOT_TIMEOUT",
            &mut self.segregation.fast_slot_timeout_ms,
        );
        env("SQLRELAY_XA_MAX_TRANSACTIONS", &mut self.xa.max_transactions);
        env(
            "SQLRELAY_XA_START_TIMEOUT_MILLIS",
            &mut self.xa.start_timeout_ms,
        );
    }

    /// Pool properties for one datasource: global section overlaid with the
    /// per-name section.
    pub fn pool_properties_for(&self, datasource: &str) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        self.pool.write_properties(&mut properties);
        if let Some(named) = self.datasources.get(datasource) {
            named.write_properties(&mut properties);
        }
        properties
    }

    pub fn datasource_defaults(&self) -> DatasourceDefaults {
        let mut pool = HashMap::new();
        self.pool.write_properties(&mut pool);
        DatasourceDefaults {
            pool,
            segregation: self.segregation.to_segregation_config(),
            xa_max_transactions: self.xa.max_transactions,
            xa_start_timeout: Duration::from_millis(self.xa.start_timeout_ms),
            placeholder_overrides: self.placeholders.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(1528, config.port);
        assert_eq!(100, config.fetch.rows_per_block);
        assert!(config.segregation.enabled);
    }

    #[test]
    fn toml_round_trip() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 9099
            allowed_ips = "10.0.0.0/8"

            [segregation]
            slow_slot_percentage = 30

            [pool]
            maximum_pool_size = 5

            [datasources.analytics]
            maximum_pool_size = 2

            [placeholders]
            "relay.server.dbhost" = "db.internal"
            "#,
        )
        .unwrap();
        assert_eq!(9099, config.port);
        assert_eq!(30, config.segregation.slow_slot_percentage);
        assert_eq!(
            "5",
            config.pool_properties_for("default")["connection.pool.maximumPoolSize"]
        );
        assert_eq!(
            "2",
            config.pool_properties_for("analytics")["connection.pool.maximumPoolSize"]
        );
        assert_eq!("db.internal", config.placeholders["relay.server.dbhost"]);
    }

    #[test]
    fn env_overlay_wins() {
        std::env::set_var("SQLRELAY_PORT", "7777");
        let config = ServerConfig::load(None, std::path::Path::new("/nonexistent")).unwrap();
        assert_eq!(7777, config.port);
        std::env::remove_var("SQLRELAY_PORT");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ServerConfig>("unknown_key = 1").is_err());
    }
}
