//! Two-lane admission control that keeps slow statements from starving
//! fast ones.
//!
//! Each statement fingerprint carries a weighted latency average; a
//! fingerprint whose average exceeds twice the process-wide average is
//! admitted through the slow lane only. Per lane: open → saturated →
//! idle → borrowing-allowed → open, driven by the counters and wall-clock.

use sqlrelay_impl::{RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Configuration of the segregator, per datasource.
#[derive(Clone, Debug)]
pub struct SegregationConfig {
    pub enabled: bool,
    /// Share of the pool reserved for the slow lane, in percent.
    pub slow_slot_percentage: u32,
    /// How long a lane must have been without new admissions before it may
    /// lend a slot to the other lane.
    pub idle_timeout: Duration,
    pub slow_slot_timeout: Duration,
    pub fast_slot_timeout: Duration,
    /// Samples required before a fingerprint can be classified slow.
    pub min_samples: u64,
    /// Overall average is recomputed after this many recorded executions …
    pub recompute_every: u32,
    /// … or after this much time, whichever comes first.
    pub recompute_interval: Duration,
}

impl Default for SegregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_slot_percentage: 20,
            idle_timeout: Duration::from_millis(5_000),
            slow_slot_timeout: Duration::from_millis(10_000),
            fast_slot_timeout: Duration::from_millis(10_000),
            min_samples: 5,
            recompute_every: 50,
            recompute_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct LatencyRecord {
    avg_micros: u64,
    count: u64,
    last_sample: Instant,
}

/// Latency tracking per statement fingerprint.
///
/// Readers never block writers of other fingerprints: the map is behind a
/// read lock and each record carries its own mutex.
#[derive(Debug)]
pub struct LatencyStore {
    records: RwLock<HashMap<u64, Arc<Mutex<LatencyRecord>>>>,
    total_sum_micros: AtomicU64,
    total_count: AtomicU64,
    overall_avg_micros: AtomicU64,
    since_recompute: AtomicU32,
    last_recompute: Mutex<Instant>,
    min_samples: u64,
    recompute_every: u32,
    recompute_interval: Duration,
}

impl LatencyStore {
    fn new(config: &SegregationConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            total_sum_micros: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
            overall_avg_micros: AtomicU64::new(0),
            since_recompute: AtomicU32::new(0),
            last_recompute: Mutex::new(Instant::now()),
            min_samples: config.min_samples,
            recompute_every: config.recompute_every,
            recompute_interval: config.recompute_interval,
        }
    }

    /// Records one execution; failures are recorded like successes.
    pub fn record(&self, fingerprint: u64, elapsed: Duration) {
        let sample_micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let o_record = self
            .records
            .read()
            .ok()
            .and_then(|records| records.get(&fingerprint).cloned());
        match o_record {
            Some(record) => {
                if let Ok(mut record) = record.lock() {
                    record.avg_micros = (record.avg_micros * 4 + sample_micros) / 5;
                    record.count += 1;
                    record.last_sample = Instant::now();
                }
            }
            None => {
                if let Ok(mut records) = self.records.write() {
                    records
                        .entry(fingerprint)
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(LatencyRecord {
                                avg_micros: sample_micros,
                                count: 0,
                                last_sample: Instant::now(),
                            }))
                        })
                        .lock()
                        .map(|mut record| {
                            record.count += 1;
                            record.last_sample = Instant::now();
                        })
                        .ok();
                }
            }
        }
        self.total_sum_micros
            .fetch_add(sample_micros, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.maybe_recompute_overall();
    }

    // bounded schedule, to avoid recomputing under contention
    fn maybe_recompute_overall(&self) {
        let due_by_count =
            self.since_recompute.fetch_add(1, Ordering::Relaxed) + 1 >= self.recompute_every;
        let due_by_time = self
            .last_recompute
            .lock()
            .map(|last| last.elapsed() >= self.recompute_interval)
            .unwrap_or(false);
        if due_by_count || due_by_time {
            self.recompute_overall();
        }
    }

    fn recompute_overall(&self) {
        let count = self.total_count.load(Ordering::Relaxed);
        if count > 0 {
            let sum = self.total_sum_micros.load(Ordering::Relaxed);
            self.overall_avg_micros.store(sum / count, Ordering::Relaxed);
        }
        self.since_recompute.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_recompute.lock() {
            *last = Instant::now();
        }
        trace!(
            "LatencyStore: overall average recomputed to {} µs",
            self.overall_avg_micros.load(Ordering::Relaxed)
        );
    }

    /// The last recomputed overall average.
    pub fn overall_avg(&self) -> Duration {
        Duration::from_micros(self.overall_avg_micros.load(Ordering::Relaxed))
    }

    /// The fingerprint's current weighted average, if it was ever recorded.
    pub fn avg_of(&self, fingerprint: u64) -> Option<Duration> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&fingerprint).cloned())
            .and_then(|record| {
                record
                    .lock()
                    .map(|record| Duration::from_micros(record.avg_micros))
                    .ok()
            })
    }

    /// Slow iff the weighted average is at least twice the overall average
    /// and enough samples were seen.
    pub fn is_slow(&self, fingerprint: u64) -> bool {
        let overall = self.overall_avg_micros.load(Ordering::Relaxed);
        if overall == 0 {
            return false;
        }
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&fingerprint).cloned())
            .and_then(|record| record.lock().ok().map(|r| (r.avg_micros, r.count)))
            .is_some_and(|(avg, count)| count >= self.min_samples && avg >= 2 * overall)
    }
}

/// The two admission lanes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lane {
    Fast,
    Slow,
}

impl Lane {
    fn name(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

#[derive(Debug)]
struct LaneState {
    cap: u32,
    in_use: u32,
    borrowed_out: u32,
    last_activity: Instant,
    ever_used: bool,
}

impl LaneState {
    fn new(cap: u32) -> Self {
        Self {
            cap,
            in_use: 0,
            borrowed_out: 0,
            last_activity: Instant::now(),
            ever_used: false,
        }
    }

    fn has_free_slot(&self) -> bool {
        self.in_use + self.borrowed_out < self.cap
    }

    // A lane lends only when it is below capacity, has been quiet for the
    // idle timeout, has seen traffic at least once, and keeps one slot
    // un-lent for itself.
    fn may_lend(&self, idle_timeout: Duration) -> bool {
        self.has_free_slot()
            && self.ever_used
            && self.last_activity.elapsed() >= idle_timeout
            && self.cap - self.borrowed_out > 1
    }
}

#[derive(Debug)]
struct Lanes {
    fast: LaneState,
    slow: LaneState,
}

impl Lanes {
    fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        match lane {
            Lane::Fast => &mut self.fast,
            Lane::Slow => &mut self.slow,
        }
    }
}

/// Proof of admission; must be handed back through
/// [`Segregator::release`].
#[derive(Debug)]
#[must_use]
pub struct AdmissionPermit {
    fingerprint: u64,
    lane: Lane,
    borrowed_from: Option<Lane>,
    counted: bool,
    started: Instant,
}

impl AdmissionPermit {
    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn is_borrowed(&self) -> bool {
        self.borrowed_from.is_some()
    }
}

/// The per-datasource segregator.
#[derive(Debug)]
pub struct Segregator {
    config: SegregationConfig,
    lanes: Mutex<Lanes>,
    released: Notify,
    latency: LatencyStore,
}

impl Segregator {
    pub fn new(pool_size: u32, config: SegregationConfig) -> Self {
        let slow_cap = pool_size * config.slow_slot_percentage / 100;
        let fast_cap = pool_size - slow_cap;
        debug!(
            "Segregator: fast_cap = {}, slow_cap = {}, enabled = {}",
            fast_cap, slow_cap, config.enabled
        );
        Self {
            lanes: Mutex::new(Lanes {
                fast: LaneState::new(fast_cap),
                slow: LaneState::new(slow_cap),
            }),
            released: Notify::new(),
            latency: LatencyStore::new(&config),
            config,
        }
    }

    pub fn latency(&self) -> &LatencyStore {
        &self.latency
    }

    /// The lane the fingerprint is currently classified into.
    pub fn classify(&self, fingerprint: u64) -> Lane {
        if self.latency.is_slow(fingerprint) {
            Lane::Slow
        } else {
            Lane::Fast
        }
    }

    /// Admits one execution of the fingerprint, waiting at most the lane's
    /// slot timeout. On timeout nothing has been admitted.
    pub async fn acquire(&self, fingerprint: u64) -> RelayResult<AdmissionPermit> {
        let started = Instant::now();
        if !self.config.enabled {
            return Ok(AdmissionPermit {
                fingerprint,
                lane: Lane::Fast,
                borrowed_from: None,
                counted: false,
                started,
            });
        }
        let lane = self.classify(fingerprint);
        let slot_timeout = match lane {
            Lane::Fast => self.config.fast_slot_timeout,
            Lane::Slow => self.config.slow_slot_timeout,
        };
        let deadline = tokio::time::Instant::now() + slot_timeout;

        loop {
            {
                let mut lanes = self.lanes.lock()?;
                let own = lanes.lane_mut(lane);
                if own.has_free_slot() {
                    own.in_use += 1;
                    own.ever_used = true;
                    own.last_activity = Instant::now();
                    return Ok(AdmissionPermit {
                        fingerprint,
                        lane,
                        borrowed_from: None,
                        counted: true,
                        started,
                    });
                }
                let other_lane = match lane {
                    Lane::Fast => Lane::Slow,
                    Lane::Slow => Lane::Fast,
                };
                let other = lanes.lane_mut(other_lane);
                if other.may_lend(self.config.idle_timeout) {
                    other.borrowed_out += 1;
                    debug!(
                        "Segregator: {} lane borrows a slot from the {} lane",
                        lane.name(),
                        other_lane.name()
                    );
                    return Ok(AdmissionPermit {
                        fingerprint,
                        lane,
                        borrowed_from: Some(other_lane),
                        counted: true,
                        started,
                    });
                }
            }
            // Bounded waits tolerate both spurious and missed wake-ups.
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(RelayError::SegregatorTimeout {
                    lane: lane.name(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
            let slice = deadline.min(now + Duration::from_millis(25));
            tokio::time::timeout_at(slice, self.released.notified())
                .await
                .ok();
        }
    }

    /// Returns the slot and records the observed latency, also for failed
    /// executions.
    pub fn release(&self, permit: AdmissionPermit) {
        self.latency.record(permit.fingerprint, permit.started.elapsed());
        if !permit.counted {
            return;
        }
        if let Ok(mut lanes) = self.lanes.lock() {
            match permit.borrowed_from {
                Some(lender) => {
                    let lender = lanes.lane_mut(lender);
                    lender.borrowed_out = lender.borrowed_out.saturating_sub(1);
                }
                None => {
                    let own = lanes.lane_mut(permit.lane);
                    own.in_use = own.in_use.saturating_sub(1);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Records a latency sample without admission, for executions that are
    /// measured elsewhere.
    pub fn record_latency(&self, fingerprint: u64, elapsed: Duration) {
        self.latency.record(fingerprint, elapsed);
    }

    pub fn fast_in_use(&self) -> u32 {
        self.lanes.lock().map(|l| l.fast.in_use).unwrap_or(0)
    }

    pub fn slow_in_use(&self) -> u32 {
        self.lanes.lock().map(|l| l.slow.in_use).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Lane, SegregationConfig, Segregator};
    use sqlrelay_impl::ErrorKind;
    use std::time::Duration;

    fn quick_config() -> SegregationConfig {
        SegregationConfig {
            enabled: true,
            slow_slot_percentage: 20,
            idle_timeout: Duration::from_millis(50),
            slow_slot_timeout: Duration::from_millis(150),
            fast_slot_timeout: Duration::from_millis(150),
            min_samples: 5,
            recompute_every: 1,
            recompute_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn caps_follow_the_percentage() {
        let segregator = Segregator::new(10, quick_config());
        let lanes = segregator.lanes.lock().unwrap();
        assert_eq!(2, lanes.slow.cap);
        assert_eq!(8, lanes.fast.cap);
    }

    // the overall average reflects the whole process, so the scenarios keep
    // a steady stream of ordinary statements next to the misbehaving one
    fn record_background(segregator: &Segregator, n: u32) {
        for _ in 0..n {
            segregator.record_latency(0x0bac_u64, Duration::from_millis(10));
        }
    }

    fn record_slow_history(segregator: &Segregator, fp: u64) {
        record_background(segregator, 40);
        for _ in 0..4 {
            segregator.record_latency(fp, Duration::from_millis(10));
        }
        for _ in 0..5 {
            segregator.record_latency(fp, Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn classification_crosses_after_slow_samples() {
        let segregator = Segregator::new(10, quick_config());
        let fp = 0xfeed_u64;
        record_background(&segregator, 45);
        // four fast samples, overall settles low
        for _ in 0..4 {
            segregator.record_latency(fp, Duration::from_millis(10));
        }
        assert_eq!(Lane::Fast, segregator.classify(fp));
        // the fifth sample is slow; the weighted average jumps past 2x overall
        segregator.record_latency(fp, Duration::from_millis(500));
        assert_eq!(Lane::Slow, segregator.classify(fp));
    }

    #[tokio::test]
    async fn literal_timing_vector_crosses_after_the_fifth_sample() {
        let segregator = Segregator::new(10, quick_config());
        let fp = 0xf00d_u64;
        record_background(&segregator, 40);
        for (i, ms) in [10_u64, 12, 11, 9, 500, 520, 540, 560, 580]
            .into_iter()
            .enumerate()
        {
            segregator.record_latency(fp, Duration::from_millis(ms));
            if i < 4 {
                assert_eq!(Lane::Fast, segregator.classify(fp), "sample {i}");
            } else {
                // within one sample of the crossing
                assert_eq!(Lane::Slow, segregator.classify(fp), "sample {i}");
            }
        }
    }

    #[tokio::test]
    async fn min_samples_guard_classification() {
        let segregator = Segregator::new(10, quick_config());
        segregator.record_latency(1, Duration::from_millis(10));
        // one enormous sample is not enough evidence
        segregator.record_latency(2, Duration::from_millis(5_000));
        assert_eq!(Lane::Fast, segregator.classify(2));
    }

    #[tokio::test]
    async fn slow_lane_saturates_while_fast_stays_available() {
        let mut config = quick_config();
        config.idle_timeout = Duration::from_secs(60); // no borrowing here
        let segregator = Segregator::new(10, config);
        let fp = 0xabba_u64;
        record_slow_history(&segregator, fp);
        assert_eq!(Lane::Slow, segregator.classify(fp));

        let p1 = segregator.acquire(fp).await.unwrap();
        let p2 = segregator.acquire(fp).await.unwrap();
        assert_eq!(2, segregator.slow_in_use());
        // the third slow execution times out, the fast lane is unaffected
        let e = segregator.acquire(fp).await.unwrap_err();
        assert_eq!(ErrorKind::SegregatorTimeout, e.kind());
        let fast = segregator.acquire(0x1).await.unwrap();
        segregator.release(fast);
        segregator.release(p1);
        segregator.release(p2);
        assert_eq!(0, segregator.slow_in_use());
    }

    #[tokio::test]
    async fn released_slots_admit_waiters() {
        let mut config = quick_config();
        config.idle_timeout = Duration::from_secs(60);
        let segregator = std::sync::Arc::new(Segregator::new(5, config));
        // slow cap = 1
        let fp = 0xcafe_u64;
        record_slow_history(&segregator, fp);
        let p1 = segregator.acquire(fp).await.unwrap();
        let waiter = {
            let segregator = std::sync::Arc::clone(&segregator);
            tokio::spawn(async move { segregator.acquire(fp).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        segregator.release(p1);
        let p2 = waiter.await.unwrap().unwrap();
        segregator.release(p2);
    }

    #[tokio::test]
    async fn idle_fast_lane_lends_to_slow_waiters() {
        let mut config = quick_config();
        config.idle_timeout = Duration::from_millis(30);
        let segregator = Segregator::new(5, config); // slow cap 1, fast cap 4
        let fp = 0xdead_u64;
        record_slow_history(&segregator, fp);
        assert_eq!(Lane::Slow, segregator.classify(fp));

        // the fast lane must have seen traffic before it may lend
        let fast = segregator.acquire(0x2).await.unwrap();
        segregator.release(fast);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let p1 = segregator.acquire(fp).await.unwrap();
        assert!(!p1.is_borrowed());
        let p2 = segregator.acquire(fp).await.unwrap();
        assert!(p2.is_borrowed());
        {
            let lanes = segregator.lanes.lock().unwrap();
            assert_eq!(1, lanes.fast.borrowed_out);
            assert!(lanes.fast.in_use + lanes.fast.borrowed_out <= lanes.fast.cap);
        }
        segregator.release(p2);
        {
            let lanes = segregator.lanes.lock().unwrap();
            assert_eq!(0, lanes.fast.borrowed_out);
        }
        segregator.release(p1);
    }

    #[tokio::test]
    async fn disabled_segregator_admits_everything() {
        let mut config = quick_config();
        config.enabled = false;
        let segregator = Segregator::new(1, config);
        let p1 = segregator.acquire(1).await.unwrap();
        let p2 = segregator.acquire(1).await.unwrap();
        segregator.release(p1);
        segregator.release(p2);
    }
}
