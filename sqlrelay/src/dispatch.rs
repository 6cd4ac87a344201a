//! Multi-node endpoint management for the driver.
//!
//! The endpoint set is fixed at driver initialization. A background prober
//! pings every endpoint; health transitions are edge-triggered events that a
//! single reconciler task consumes: unhealthy endpoints get their bound
//! connections closed, recovered endpoints trigger a rebalance of idle
//! non-XA connections. Selection is load-aware and sticky per logical
//! connection.

use crate::channel::RpcChannel;
use sqlrelay_impl::{EndpointAddr, RelayError, RelayResult};
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::time::{Duration, Instant};

/// Health of one endpoint, as seen by this driver instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Health {
    Healthy,
    /// One failed call or probe; still eligible as a fallback.
    Suspect,
    Unhealthy,
}

/// Edge-triggered health transitions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointEvent {
    Unhealthy(EndpointAddr),
    Recovered(EndpointAddr),
}

/// The connections the manager can reach into, without a concrete type
/// dependency on the connection module.
pub trait ManagedConnection: Send + Sync + std::fmt::Debug {
    fn endpoint(&self) -> &EndpointAddr;
    fn is_idle(&self) -> bool;
    fn is_xa(&self) -> bool;
    fn is_closed(&self) -> bool;
    /// The bound endpoint became unhealthy; the connection closes itself.
    fn on_server_unhealthy(&self);
    /// The rebalancer wants this connection replaced; the owning pool closes
    /// it and a fresh connect lands on the enlarged healthy set.
    fn mark_for_closure(&self);
}

#[derive(Debug)]
pub struct EndpointState {
    addr: EndpointAddr,
    health: Mutex<Health>,
    consecutive_failures: AtomicU32,
    in_flight: AtomicU32,
    /// Exponentially decayed latency estimate, in microseconds.
    latency_micros: AtomicU64,
    last_success: Mutex<Option<Instant>>,
    last_failure: Mutex<Option<Instant>>,
}

impl EndpointState {
    fn new(addr: EndpointAddr) -> Self {
        Self {
            addr,
            health: Mutex::new(Health::Healthy),
            consecutive_failures: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            latency_micros: AtomicU64::new(0),
            last_success: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    pub fn health(&self) -> Health {
        self.health.lock().map(|h| *h).unwrap_or(Health::Unhealthy)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_micros.load(Ordering::Relaxed))
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success.lock().ok().and_then(|last| *last)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure.lock().ok().and_then(|last| *last)
    }

    pub(crate) fn begin_call(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    // single-pole IIR, alpha = 0.3
    fn update_latency(&self, sample: Duration) {
        let sample = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        let old = self.latency_micros.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            (old * 7 + sample * 3) / 10
        };
        self.latency_micros.store(new, Ordering::Relaxed);
    }

    // load-aware selection weight: busier and slower endpoints score higher
    fn score(&self) -> u64 {
        let latency = self.latency_micros.load(Ordering::Relaxed).max(1);
        (u64::from(self.in_flight()) + 1) * latency
    }
}

/// Configuration of the endpoint manager.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures after which an endpoint counts as unhealthy.
    pub failure_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(1_000),
            probe_timeout: Duration::from_millis(500),
            failure_threshold: 2,
        }
    }
}

#[derive(Debug)]
pub struct EndpointManager {
    endpoints: Vec<Arc<EndpointState>>,
    config: DispatchConfig,
    events: tokio::sync::mpsc::UnboundedSender<EndpointEvent>,
    observers: tokio::sync::broadcast::Sender<EndpointEvent>,
    connections: Mutex<Vec<Weak<dyn ManagedConnection>>>,
}

impl EndpointManager {
    /// Builds the manager and starts the prober and reconciler tasks.
    pub fn start(addrs: Vec<EndpointAddr>, config: DispatchConfig) -> RelayResult<Arc<Self>> {
        if addrs.is_empty() {
            return Err(RelayError::Usage("Endpoint set must not be empty"));
        }
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (observers, _) = tokio::sync::broadcast::channel(16);
        let manager = Arc::new(Self {
            endpoints: addrs.into_iter().map(|a| Arc::new(EndpointState::new(a))).collect(),
            config,
            events: events_tx,
            observers,
            connections: Mutex::new(Vec::new()),
        });
        Self::spawn_prober(&manager);
        Self::spawn_reconciler(&manager, events_rx);
        Ok(manager)
    }

    pub fn endpoints(&self) -> &[Arc<EndpointState>] {
        &self.endpoints
    }

    pub fn endpoint(&self, addr: &EndpointAddr) -> Option<Arc<EndpointState>> {
        self.endpoints.iter().find(|e| e.addr() == addr).cloned()
    }

    /// Observe health transition events (tests, application hooks).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EndpointEvent> {
        self.observers.subscribe()
    }

    pub(crate) fn register_connection(&self, connection: Weak<dyn ManagedConnection>) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.retain(|c| c.strong_count() > 0);
            connections.push(connection);
        }
    }

    /// Picks the least-loaded endpoint of the healthy set; suspect endpoints
    /// are a fallback, unhealthy ones are never picked.
    pub fn select(&self) -> RelayResult<Arc<EndpointState>> {
        self.pick_endpoint(None)
    }

    /// Like [`select`](Self::select), but never returns the given endpoint;
    /// used for the one-shot retry of idempotent operations after a
    /// connection-level failure.
    pub fn select_excluding(&self, excluded: &EndpointAddr) -> RelayResult<Arc<EndpointState>> {
        self.pick_endpoint(Some(excluded))
    }

    fn pick_endpoint(&self, o_excluded: Option<&EndpointAddr>) -> RelayResult<Arc<EndpointState>> {
        let pick = |wanted: Health| {
            self.endpoints
                .iter()
                .filter(|e| e.health() == wanted)
                .filter(|e| o_excluded.map_or(true, |excluded| e.addr() != excluded))
                .min_by_key(|e| e.score())
                .cloned()
        };
        pick(Health::Healthy)
            .or_else(|| pick(Health::Suspect))
            .ok_or_else(|| {
                RelayError::TransportFailure("No healthy endpoint available".to_string())
            })
    }

    pub(crate) fn report_success(&self, addr: &EndpointAddr, elapsed: Duration) {
        let Some(endpoint) = self.endpoint(addr) else { return };
        endpoint.update_latency(elapsed);
        endpoint.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = endpoint.last_success.lock() {
            *last = Some(Instant::now());
        }
        let recovered = {
            let mut health = match endpoint.health.lock() {
                Ok(health) => health,
                Err(_) => return,
            };
            let recovered = *health == Health::Unhealthy;
            *health = Health::Healthy;
            recovered
        };
        if recovered {
            info!("Endpoint {addr} recovered");
            self.emit(EndpointEvent::Recovered(addr.clone()));
        }
    }

    pub(crate) fn report_failure(&self, addr: &EndpointAddr) {
        let Some(endpoint) = self.endpoint(addr) else { return };
        let failures = endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut last) = endpoint.last_failure.lock() {
            *last = Some(Instant::now());
        }
        let became_unhealthy = {
            let mut health = match endpoint.health.lock() {
                Ok(health) => health,
                Err(_) => return,
            };
            match *health {
                Health::Unhealthy => false,
                _ if failures >= self.config.failure_threshold => {
                    *health = Health::Unhealthy;
                    true
                }
                _ => {
                    *health = Health::Suspect;
                    false
                }
            }
        };
        if became_unhealthy {
            warn!("Endpoint {addr} is unhealthy after {failures} consecutive failures");
            self.emit(EndpointEvent::Unhealthy(addr.clone()));
        }
    }

    fn emit(&self, event: EndpointEvent) {
        self.events.send(event.clone()).ok();
        self.observers.send(event).ok();
    }

    fn spawn_prober(manager: &Arc<Self>) {
        use rand::Rng;
        let weak = Arc::downgrade(manager);
        // stagger probers of concurrently started drivers
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..25));
        tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            loop {
                let Some(manager) = weak.upgrade() else { return };
                let interval = manager.config.probe_interval;
                let timeout = manager.config.probe_timeout;
                for endpoint in manager.endpoints.clone() {
                    let probe = async {
                        let started = Instant::now();
                        let mut channel = RpcChannel::open(endpoint.addr()).await?;
                        channel.ping(timeout).await?;
                        Ok::<Duration, RelayError>(started.elapsed())
                    };
                    match tokio::time::timeout(timeout.max(Duration::from_millis(1)) * 2, probe)
                        .await
                    {
                        Ok(Ok(elapsed)) => manager.report_success(endpoint.addr(), elapsed),
                        Ok(Err(_)) | Err(_) => manager.report_failure(endpoint.addr()),
                    }
                }
                drop(manager);
                tokio::time::sleep(interval).await;
            }
        });
    }

    // one reconciler consumes all health events
    fn spawn_reconciler(
        manager: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<EndpointEvent>,
    ) {
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else { return };
                match event {
                    EndpointEvent::Unhealthy(addr) => manager.close_bound_connections(&addr),
                    EndpointEvent::Recovered(_) => manager.rebalance(),
                }
            }
        });
    }

    /// Connections bound to a dead endpoint are notified and close
    /// themselves; their owners then issue fresh connects.
    fn close_bound_connections(&self, addr: &EndpointAddr) {
        let connections = self.live_connections();
        for connection in connections {
            if connection.endpoint() == addr && !connection.is_closed() {
                debug!("Closing connection bound to unhealthy endpoint {addr}");
                connection.on_server_unhealthy();
            }
        }
    }

    /// After a recovery the healthy set grew; idle non-XA connections on
    /// overloaded endpoints are marked so their owners replace them, and the
    /// selector spreads the replacements. XA sessions drain naturally.
    fn rebalance(&self) {
        let connections = self.live_connections();
        let healthy: Vec<&Arc<EndpointState>> = self
            .endpoints
            .iter()
            .filter(|e| e.health() == Health::Healthy)
            .collect();
        if healthy.is_empty() {
            return;
        }
        let live: Vec<_> = connections.iter().filter(|c| !c.is_closed()).collect();
        let target = live.len().div_ceil(healthy.len());
        for endpoint in &self.endpoints {
            let bound: Vec<_> = live
                .iter()
                .filter(|c| c.endpoint() == endpoint.addr())
                .collect();
            let excess = bound.len().saturating_sub(target);
            if excess == 0 {
                continue;
            }
            let mut marked = 0;
            for connection in bound {
                if marked >= excess {
                    break;
                }
                if connection.is_idle() && !connection.is_xa() {
                    debug!(
                        "Rebalance: marking idle connection on {} for closure",
                        endpoint.addr()
                    );
                    connection.mark_for_closure();
                    marked += 1;
                }
            }
        }
    }

    fn live_connections(&self) -> Vec<Arc<dyn ManagedConnection>> {
        self.connections
            .lock()
            .map(|connections| connections.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchConfig, EndpointEvent, EndpointManager, Health};
    use sqlrelay_impl::EndpointAddr;
    use std::time::Duration;

    fn addr(port: u16) -> EndpointAddr {
        EndpointAddr::new("127.0.0.1".to_string(), port)
    }

    fn slow_probe_config() -> DispatchConfig {
        DispatchConfig {
            probe_interval: Duration::from_secs(3600), // keep the prober quiet
            probe_timeout: Duration::from_millis(50),
            failure_threshold: 2,
        }
    }

    #[tokio::test]
    async fn selection_prefers_low_load() {
        let manager =
            EndpointManager::start(vec![addr(1), addr(2)], slow_probe_config()).unwrap();
        let e1 = manager.endpoint(&addr(1)).unwrap();
        manager.report_success(&addr(1), Duration::from_millis(50));
        manager.report_success(&addr(2), Duration::from_millis(50));
        e1.begin_call();
        e1.begin_call();
        let picked = manager.select().unwrap();
        assert_eq!(&addr(2), picked.addr());
    }

    #[tokio::test]
    async fn failures_escalate_to_unhealthy_with_an_event() {
        let manager = EndpointManager::start(vec![addr(1), addr(2)], slow_probe_config()).unwrap();
        let mut events = manager.subscribe();

        manager.report_failure(&addr(1));
        assert_eq!(Health::Suspect, manager.endpoint(&addr(1)).unwrap().health());
        manager.report_failure(&addr(1));
        assert_eq!(
            Health::Unhealthy,
            manager.endpoint(&addr(1)).unwrap().health()
        );
        assert_eq!(
            EndpointEvent::Unhealthy(addr(1)),
            events.recv().await.unwrap()
        );

        // never selected while unhealthy
        for _ in 0..10 {
            assert_eq!(&addr(2), manager.select().unwrap().addr());
        }

        manager.report_success(&addr(1), Duration::from_millis(5));
        assert_eq!(Health::Healthy, manager.endpoint(&addr(1)).unwrap().health());
        assert_eq!(
            EndpointEvent::Recovered(addr(1)),
            events.recv().await.unwrap()
        );
    }

    #[tokio::test]
    async fn excluded_endpoints_are_never_retry_targets() {
        let manager =
            EndpointManager::start(vec![addr(1), addr(2)], slow_probe_config()).unwrap();
        for _ in 0..10 {
            let picked = manager.select_excluding(&addr(1)).unwrap();
            assert_eq!(&addr(2), picked.addr());
        }
        // a lone endpoint cannot be its own retry target
        let manager = EndpointManager::start(vec![addr(1)], slow_probe_config()).unwrap();
        assert!(manager.select_excluding(&addr(1)).is_err());
    }

    #[tokio::test]
    async fn suspect_endpoints_are_fallback_only() {
        let manager = EndpointManager::start(vec![addr(1)], slow_probe_config()).unwrap();
        manager.report_failure(&addr(1));
        // only a suspect endpoint left: still selectable
        assert_eq!(&addr(1), manager.select().unwrap().addr());
        manager.report_failure(&addr(1));
        assert!(manager.select().is_err());
    }
}
