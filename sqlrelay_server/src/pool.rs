//! The per-datasource connection pool and its provider SPI.
//!
//! Pools are created through a [`PoolProvider`], so deployments can swap in
//! their own pooling; the built-in implementation covers bounded size,
//! acquire timeout, idle reaping, max lifetime, and validation.

use crate::backend::{BackendConnection, BackendProvider};
use async_trait::async_trait;
use secstr::SecUtf8;
use sqlrelay_impl::{RelayError, RelayResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Immutable description of one pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Back-end URL, placeholders already resolved.
    pub url: String,
    pub user: String,
    pub password: SecUtf8,
    /// Logical datasource name, used in log lines and error texts.
    pub datasource: String,
    pub max_size: u32,
    pub min_idle: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub validate_on_acquire: bool,
    /// Isolation level connections are reset to on release, when they were
    /// changed during a session.
    pub default_isolation: Option<i32>,
    /// Free-form properties, forwarded to the back-end provider.
    pub properties: HashMap<String, String>,
}

impl PoolConfig {
    pub fn new(url: String, user: String, password: SecUtf8, datasource: String) -> Self {
        Self {
            url,
            user,
            password,
            datasource,
            max_size: 10,
            min_idle: 0,
            acquire_timeout: Duration::from_millis(30_000),
            idle_timeout: Duration::from_millis(600_000),
            max_lifetime: Duration::from_millis(1_800_000),
            validate_on_acquire: true,
            default_isolation: None,
            properties: HashMap::new(),
        }
    }

    /// Overlays the pool-related `connection.pool.*` properties.
    pub fn apply_properties(mut self, properties: &HashMap<String, String>) -> Self {
        fn get<T: std::str::FromStr>(
            properties: &HashMap<String, String>,
            key: &str,
        ) -> Option<T> {
            properties.get(key).and_then(|v| v.parse().ok())
        }
        if let Some(v) = get(properties, "connection.pool.maximumPoolSize") {
            self.max_size = v;
        }
        if let Some(v) = get(properties, "connection.pool.minimumIdle") {
            self.min_idle = v;
        }
        if let Some(v) = get(properties, "connection.pool.connectionTimeout") {
            self.acquire_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get(properties, "connection.pool.idleTimeout") {
            self.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get(properties, "connection.pool.maxLifetime") {
            self.max_lifetime = Duration::from_millis(v);
        }
        if let Some(v) = get(properties, "connection.pool.defaultTransactionIsolation") {
            self.default_isolation = Some(v);
        }
        self.properties = properties.clone();
        self
    }
}

/// Abstract factory yielding a [`Pool`] from a [`PoolConfig`].
#[async_trait]
pub trait PoolProvider: Send + Sync + std::fmt::Debug {
    async fn create(
        &self,
        config: PoolConfig,
        backend: Arc<dyn BackendProvider>,
    ) -> RelayResult<Pool>;
}

/// The built-in pool provider.
#[derive(Debug, Default)]
pub struct BuiltinPoolProvider;

#[async_trait]
impl PoolProvider for BuiltinPoolProvider {
    async fn create(
        &self,
        config: PoolConfig,
        backend: Arc<dyn BackendProvider>,
    ) -> RelayResult<Pool> {
        Ok(Pool::new(config, backend))
    }
}

struct IdleConn {
    conn: LiveConn,
    idle_since: Instant,
}

struct LiveConn {
    conn: Box<dyn BackendConnection>,
    created_at: Instant,
    isolation_dirty: bool,
}

struct PoolInner {
    config: PoolConfig,
    backend: Arc<dyn BackendProvider>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
    size: AtomicU32,
    closed: AtomicBool,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("datasource", &self.config.datasource)
            .field("size", &self.size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pool of physical back-end connections for one datasource.
#[derive(Clone, Debug)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    fn new(config: PoolConfig, backend: Arc<dyn BackendProvider>) -> Self {
        let pool = Self(Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size as usize)),
            idle: Mutex::new(VecDeque::new()),
            size: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            config,
            backend,
        }));
        pool.spawn_reaper();
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Number of live physical connections (idle plus lent out).
    pub fn size(&self) -> u32 {
        self.0.size.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.0.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Acquires a connection, waiting at most `acquire_timeout`.
    ///
    /// Waiters queue on the pool semaphore; a timeout surfaces as
    /// `pool-exhausted` and no connection has been taken.
    pub async fn acquire(&self) -> RelayResult<PooledConnection> {
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.0.config.acquire_timeout,
            Arc::clone(&self.0.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_elapsed| RelayError::PoolExhausted {
            datasource: self.0.config.datasource.clone(),
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|_closed| RelayError::Impl("Pool is closed"))?;

        // Drain unhealthy idle connections, hand out the first healthy one.
        loop {
            let o_idle = self.0.idle.lock()?.pop_front();
            let Some(idle) = o_idle else { break };
            let mut live = idle.conn;
            if live.created_at.elapsed() >= self.0.config.max_lifetime {
                debug!(
                    "Pool {}: dropping connection beyond max_lifetime",
                    self.0.config.datasource
                );
                self.close_and_forget(live.conn);
                continue;
            }
            if self.0.config.validate_on_acquire {
                if let Err(e) = live.conn.ping().await {
                    warn!(
                        "Pool {}: validation failed ({e}), evicting",
                        self.0.config.datasource
                    );
                    self.close_and_forget(live.conn);
                    continue;
                }
            }
            return Ok(PooledConnection {
                live: Some(live),
                _permit: permit,
                pool: self.clone(),
            });
        }

        // Nothing usable idle: open a fresh connection lazily.
        match self.open_fresh().await {
            Ok(live) => Ok(PooledConnection {
                live: Some(live),
                _permit: permit,
                pool: self.clone(),
            }),
            Err(e) => Err(e), // permit is returned on drop
        }
    }

    async fn open_fresh(&self) -> RelayResult<LiveConn> {
        let config = &self.0.config;
        let conn = self
            .0
            .backend
            .open(
                &config.url,
                &config.user,
                config.password.unsecure(),
                &config.properties,
            )
            .await?;
        self.0.size.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Pool {}: opened fresh connection ({} live)",
            config.datasource,
            self.size()
        );
        Ok(LiveConn {
            conn,
            created_at: Instant::now(),
            isolation_dirty: false,
        })
    }

    /// Returns a connection to the pool.
    ///
    /// Isolation is reset only when a session changed it, tracked by the
    /// dirty flag on the guard.
    pub async fn release(&self, mut pc: PooledConnection) {
        let Some(mut live) = pc.live.take() else {
            return;
        };
        if self.0.closed.load(Ordering::SeqCst) {
            self.close_and_forget(live.conn);
            return;
        }
        if live.isolation_dirty {
            if let Some(level) = self.0.config.default_isolation {
                match live.conn.set_transaction_isolation(level).await {
                    Ok(()) => live.isolation_dirty = false,
                    Err(e) => {
                        warn!(
                            "Pool {}: isolation reset failed ({e}), closing connection",
                            self.0.config.datasource
                        );
                        self.close_and_forget(live.conn);
                        return;
                    }
                }
            } else {
                live.isolation_dirty = false;
            }
        }
        if let Ok(mut idle) = self.0.idle.lock() {
            idle.push_front(IdleConn {
                conn: live,
                idle_since: Instant::now(),
            });
        }
        // the permit is dropped with the guard, waking one waiter
    }

    /// Closes the pool and every idle connection; lent-out connections are
    /// closed as they come back.
    pub async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.semaphore.close();
        let drained: Vec<IdleConn> = self
            .0
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for idle in drained {
            let mut conn = idle.conn.conn;
            self.0.size.fetch_sub(1, Ordering::SeqCst);
            conn.close().await.ok();
        }
    }

    fn close_and_forget(&self, mut conn: Box<dyn BackendConnection>) {
        self.0.size.fetch_sub(1, Ordering::SeqCst);
        tokio::spawn(async move {
            conn.close().await.ok();
        });
    }

    // Idle connections beyond min_idle are closed after idle_timeout.
    fn spawn_reaper(&self) {
        let weak = Arc::downgrade(&self.0);
        let period = (self.0.config.idle_timeout / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let pool = Pool(inner);
                pool.reap_idle();
            }
        });
    }

    fn reap_idle(&self) {
        let min_idle = self.0.config.min_idle as usize;
        let idle_timeout = self.0.config.idle_timeout;
        let mut victims = Vec::new();
        if let Ok(mut idle) = self.0.idle.lock() {
            while idle.len() > min_idle {
                match idle.back() {
                    Some(candidate) if candidate.idle_since.elapsed() >= idle_timeout => {
                        if let Some(victim) = idle.pop_back() {
                            victims.push(victim);
                        }
                    }
                    _ => break,
                }
            }
        }
        for victim in victims {
            debug!(
                "Pool {}: reaping idle connection",
                self.0.config.datasource
            );
            self.close_and_forget(victim.conn.conn);
        }
    }
}

/// A connection lent out by a [`Pool`]; exclusively owned until released.
#[derive(Debug)]
pub struct PooledConnection {
    live: Option<LiveConn>,
    _permit: OwnedSemaphorePermit,
    pool: Pool,
}

impl std::fmt::Debug for LiveConn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LiveConn")
            .field("created_at", &self.created_at)
            .field("isolation_dirty", &self.isolation_dirty)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn conn_mut(&mut self) -> &mut dyn BackendConnection {
        // the Option is only None after release, which consumes the guard
        match self.live {
            Some(ref mut live) => live.conn.as_mut(),
            None => unreachable!("PooledConnection used after release"),
        }
    }

    pub fn conn_ref(&self) -> &dyn BackendConnection {
        match self.live {
            Some(ref live) => live.conn.as_ref(),
            None => unreachable!("PooledConnection used after release"),
        }
    }

    /// Marks the connection's isolation as changed; the pool resets it on
    /// release.
    pub fn mark_isolation_dirty(&mut self) {
        if let Some(ref mut live) = self.live {
            live.isolation_dirty = true;
        }
    }
}

impl Drop for PooledConnection {
    // a guard that is dropped without release closes the physical connection
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(
                "PooledConnection dropped without release, closing ({})",
                self.pool.0.config.datasource
            );
            self.pool.close_and_forget(live.conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BuiltinPoolProvider, PoolConfig, PoolProvider};
    use crate::backend::mock::MockProvider;
    use sqlrelay_impl::{ErrorKind, RelayError};
    use secstr::SecUtf8;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        let mut config = PoolConfig::new(
            "mock://db".to_string(),
            "u".to_string(),
            SecUtf8::from("p"),
            "default".to_string(),
        );
        config.max_size = 2;
        config.acquire_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let mock = MockProvider::new();
        let pool = BuiltinPoolProvider
            .create(test_config(), Arc::new(mock))
            .await
            .unwrap();

        let c1 = pool.acquire().await.unwrap();
        let _c2 = pool.acquire().await.unwrap();
        let started = std::time::Instant::now();
        match pool.acquire().await {
            Err(RelayError::PoolExhausted { .. }) => {}
            other => panic!("Expected PoolExhausted, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));

        // releasing one connection lets the next acquire through quickly
        pool.release(c1).await;
        let started = std::time::Instant::now();
        let _c3 = pool.acquire().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn connections_are_reused_after_release() {
        let mock = MockProvider::new();
        let state = mock.state();
        let pool = BuiltinPoolProvider
            .create(test_config(), Arc::new(mock))
            .await
            .unwrap();
        let c1 = pool.acquire().await.unwrap();
        pool.release(c1).await;
        let c2 = pool.acquire().await.unwrap();
        pool.release(c2).await;
        assert_eq!(1, state.opened());
    }

    #[tokio::test]
    async fn validation_failure_evicts_and_opens_fresh() {
        let mock = MockProvider::new();
        let state = mock.state();
        let pool = BuiltinPoolProvider
            .create(test_config(), Arc::new(mock))
            .await
            .unwrap();
        let c1 = pool.acquire().await.unwrap();
        pool.release(c1).await;
        state.set_fail_pings(true);
        let c2 = pool.acquire().await.unwrap();
        assert_eq!(2, state.opened());
        state.set_fail_pings(false);
        pool.release(c2).await;
    }

    #[tokio::test]
    async fn idle_reaper_respects_min_idle() {
        let mock = MockProvider::new();
        let state = mock.state();
        let mut config = test_config();
        config.max_size = 3;
        config.min_idle = 1;
        config.idle_timeout = Duration::from_millis(100);
        let pool = BuiltinPoolProvider
            .create(config, Arc::new(mock))
            .await
            .unwrap();
        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();
        pool.release(c1).await;
        pool.release(c2).await;
        assert_eq!(2, pool.idle_count());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(1, pool.idle_count());
        assert_eq!(1, state.closed());
    }

    #[tokio::test]
    async fn pool_exhausted_kind() {
        let mock = MockProvider::new();
        let mut config = test_config();
        config.max_size = 1;
        let pool = BuiltinPoolProvider
            .create(config, Arc::new(mock))
            .await
            .unwrap();
        let _c = pool.acquire().await.unwrap();
        let e = pool.acquire().await.unwrap_err();
        assert_eq!(ErrorKind::PoolExhausted, e.kind());
    }
}
