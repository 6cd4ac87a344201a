//! The registry of datasources: conn-hash → pool / factory / limiter.
//!
//! Entries are created on first connect and live until shutdown; the map is
//! insert-only and a creation mutex guards the first-connect race. The
//! registry is the single owner, there are no process-wide globals.

use crate::backend::BackendProvider;
use crate::pool::{Pool, PoolConfig, PoolProvider};
use crate::segregator::{SegregationConfig, Segregator};
use crate::session::SessionConnection;
use crate::xa::XaControl;
use sqlrelay_impl::{connection_hash, placeholder, validate_backend_url, RelayResult};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// How physical connections for the entry come into existence.
#[derive(Debug)]
pub enum DatasourceKind {
    /// Non-XA with a pool.
    Pooled { pool: Pool },
    /// Non-XA, a fresh physical connection per session.
    Unpooled,
    /// XA; connections are opened per session from the cached factory and
    /// branches are capped by the control's limiter.
    Xa { control: XaControl },
}

/// One registered datasource.
#[derive(Debug)]
pub struct DatasourceEntry {
    conn_hash: String,
    config: PoolConfig,
    kind: DatasourceKind,
    segregator: Segregator,
    // capability probe, resolved at first result-set open
    row_by_row: OnceLock<bool>,
}

impl DatasourceEntry {
    pub fn conn_hash(&self) -> &str {
        &self.conn_hash
    }

    pub fn datasource(&self) -> &str {
        &self.config.datasource
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn kind(&self) -> &DatasourceKind {
        &self.kind
    }

    pub fn segregator(&self) -> &Segregator {
        &self.segregator
    }

    pub fn is_xa(&self) -> bool {
        matches!(self.kind, DatasourceKind::Xa { .. })
    }

    pub fn xa_control(&self) -> RelayResult<&XaControl> {
        match &self.kind {
            DatasourceKind::Xa { control } => Ok(control),
            _ => Err(sqlrelay_impl::RelayError::XaProtocol(
                "Datasource is not XA-enabled".to_string(),
            )),
        }
    }

    /// Whether result sets of this back-end must stream row by row to keep
    /// LOB locators valid. Resolved once, from the first open connection.
    pub fn row_by_row_mode(&self, probe: impl FnOnce() -> bool) -> bool {
        *self.row_by_row.get_or_init(probe)
    }
}

/// Server-side defaults that apply to every datasource unless overridden by
/// per-datasource configuration or connect properties.
#[derive(Clone, Debug)]
pub struct DatasourceDefaults {
    pub pool: HashMap<String, String>,
    pub segregation: SegregationConfig,
    pub xa_max_transactions: u32,
    pub xa_start_timeout: Duration,
    pub placeholder_overrides: HashMap<String, String>,
}

impl Default for DatasourceDefaults {
    fn default() -> Self {
        Self {
            pool: HashMap::new(),
            segregation: SegregationConfig::default(),
            xa_max_transactions: 16,
            xa_start_timeout: Duration::from_millis(10_000),
            placeholder_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct DatasourceRegistry {
    backend: Arc<dyn BackendProvider>,
    pool_provider: Arc<dyn PoolProvider>,
    defaults: DatasourceDefaults,
    entries: RwLock<HashMap<String, Arc<DatasourceEntry>>>,
    // serializes entry creation so the first two connects race cleanly
    create_guard: tokio::sync::Mutex<()>,
}

impl DatasourceRegistry {
    pub fn new(
        backend: Arc<dyn BackendProvider>,
        pool_provider: Arc<dyn PoolProvider>,
        defaults: DatasourceDefaults,
    ) -> Self {
        Self {
            backend,
            pool_provider,
            defaults,
            entries: RwLock::new(HashMap::new()),
            create_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> Arc<dyn BackendProvider> {
        Arc::clone(&self.backend)
    }

    pub fn get(&self, conn_hash: &str) -> Option<Arc<DatasourceEntry>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(conn_hash).cloned())
    }

    /// Registers the datasource for the given connect data, or returns the
    /// existing entry. Placeholders are validated and resolved before any
    /// other work; nothing is connected yet.
    pub async fn register(
        &self,
        raw_url: &str,
        user: &str,
        password: &str,
        datasource: &str,
        is_xa: bool,
        properties: &HashMap<String, String>,
    ) -> RelayResult<Arc<DatasourceEntry>> {
        let conn_hash = connection_hash(raw_url, user, datasource);
        if let Some(entry) = self.get(&conn_hash) {
            return Ok(entry);
        }

        let _guard = self.create_guard.lock().await;
        if let Some(entry) = self.get(&conn_hash) {
            // lost the creation race to an earlier connect
            return Ok(entry);
        }

        let resolved_url = placeholder::resolve(raw_url, &self.defaults.placeholder_overrides)?;
        validate_backend_url(&resolved_url)?;

        let mut merged = self.defaults.pool.clone();
        for (k, v) in properties {
            merged.insert(k.clone(), v.clone());
        }
        let config = PoolConfig::new(
            resolved_url,
            user.to_string(),
            secstr::SecUtf8::from(password),
            datasource.to_string(),
        )
        .apply_properties(&merged);

        let pooled = merged
            .get("connection.pool.enabled")
            .map_or(true, |v| v != "false");

        let kind = if is_xa {
            DatasourceKind::Xa {
                control: XaControl::new(
                    self.defaults.xa_max_transactions,
                    self.defaults.xa_start_timeout,
                ),
            }
        } else if pooled {
            let pool = self
                .pool_provider
                .create(config.clone(), Arc::clone(&self.backend))
                .await?;
            DatasourceKind::Pooled { pool }
        } else {
            DatasourceKind::Unpooled
        };

        let segregator = Segregator::new(config.max_size, self.defaults.segregation.clone());
        let entry = Arc::new(DatasourceEntry {
            conn_hash: conn_hash.clone(),
            config,
            kind,
            segregator,
            row_by_row: OnceLock::new(),
        });
        info!(
            "DatasourceRegistry: registered datasource \"{}\" as {} ({})",
            entry.datasource(),
            match entry.kind {
                DatasourceKind::Pooled { .. } => "pooled",
                DatasourceKind::Unpooled => "unpooled",
                DatasourceKind::Xa { .. } => "xa",
            },
            conn_hash,
        );
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(conn_hash, Arc::clone(&entry));
        }
        Ok(entry)
    }

    /// Lazily produces the physical connection for a session of this entry.
    pub async fn acquire_connection(
        &self,
        entry: &DatasourceEntry,
    ) -> RelayResult<SessionConnection> {
        match &entry.kind {
            DatasourceKind::Pooled { pool } => Ok(SessionConnection::Pooled(pool.acquire().await?)),
            DatasourceKind::Unpooled => {
                let config = &entry.config;
                let conn = self
                    .backend
                    .open(
                        &config.url,
                        &config.user,
                        config.password.unsecure(),
                        &config.properties,
                    )
                    .await?;
                Ok(SessionConnection::Unpooled(conn))
            }
            DatasourceKind::Xa { .. } => {
                let config = &entry.config;
                let conn = self
                    .backend
                    .open_xa(
                        &config.url,
                        &config.user,
                        config.password.unsecure(),
                        &config.properties,
                    )
                    .await?;
                Ok(SessionConnection::Unpooled(conn))
            }
        }
    }

    /// Takes the connection back on session terminate.
    pub async fn release_connection(&self, entry: &DatasourceEntry, conn: SessionConnection) {
        match (conn, &entry.kind) {
            (SessionConnection::Pooled(pc), DatasourceKind::Pooled { pool }) => {
                pool.release(pc).await;
            }
            (SessionConnection::Pooled(pc), _) => drop(pc),
            (SessionConnection::Unpooled(mut conn), _) => {
                conn.close().await.ok();
            }
        }
    }

    /// Closes every pool; called once at shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<DatasourceEntry>> = self
            .entries
            .write()
            .map(|mut entries| entries.drain().map(|(_, e)| e).collect())
            .unwrap_or_default();
        for entry in entries {
            if let DatasourceKind::Pooled { pool } = &entry.kind {
                pool.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatasourceDefaults, DatasourceRegistry};
    use crate::backend::mock::MockProvider;
    use crate::pool::BuiltinPoolProvider;
    use sqlrelay_impl::ErrorKind;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn registry() -> DatasourceRegistry {
        DatasourceRegistry::new(
            Arc::new(MockProvider::new()),
            Arc::new(BuiltinPoolProvider),
            DatasourceDefaults::default(),
        )
    }

    #[tokio::test]
    async fn first_connect_creates_later_connects_reuse() {
        let registry = registry();
        let a = registry
            .register("mock://db/one", "u", "p", "default", false, &HashMap::new())
            .await
            .unwrap();
        let b = registry
            .register("mock://db/one", "u", "p", "default", false, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(a.conn_hash(), b.conn_hash());
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry
            .register("mock://db/one", "u", "p", "other", false, &HashMap::new())
            .await
            .unwrap();
        assert_ne!(a.conn_hash(), c.conn_hash());
    }

    #[tokio::test]
    async fn placeholders_are_resolved_before_anything_connects() {
        let registry = registry();
        let e = registry
            .register(
                "mock://${relay.server.nohost}/db",
                "u",
                "p",
                "default",
                false,
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::ConfigInvalid, e.kind());

        let e = registry
            .register(
                "mock://${evil}/db",
                "u",
                "p",
                "default",
                false,
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::SecurityDenied, e.kind());
    }

    #[tokio::test]
    async fn xa_entries_carry_a_limiter() {
        let registry = registry();
        let entry = registry
            .register("mock://db/xa", "u", "p", "default", true, &HashMap::new())
            .await
            .unwrap();
        assert!(entry.is_xa());
        assert!(entry.xa_control().is_ok());
    }
}
