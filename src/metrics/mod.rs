mod ewma;

pub use ewma::{Ewma, TICK_INTERVAL};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A frozen, read-only copy of a meter at an instant.
///
/// This is the metrics read surface: safe to hand out, serialize, and drop
/// without any synchronization with the live meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub count: u64,
    pub rate1: f64,
    pub rate5: f64,
    pub rate15: f64,
    pub rate_mean: f64,
}

#[derive(Debug)]
struct MeterInner {
    name: String,
    count: AtomicU64,
    a1: Ewma,
    a5: Ewma,
    a15: Ewma,
    // Snapshot fields, refreshed on every mark and every tick so reads
    // stay lock-free.
    rate1_bits: AtomicU64,
    rate5_bits: AtomicU64,
    rate15_bits: AtomicU64,
    rate_mean_bits: AtomicU64,
    stopped: AtomicBool,
    started_at: Instant,
}

impl MeterInner {
    fn new(name: String) -> Self {
        Self {
            name,
            count: AtomicU64::new(0),
            a1: Ewma::one_minute(),
            a5: Ewma::five_minute(),
            a15: Ewma::fifteen_minute(),
            rate1_bits: AtomicU64::new(0f64.to_bits()),
            rate5_bits: AtomicU64::new(0f64.to_bits()),
            rate15_bits: AtomicU64::new(0f64.to_bits()),
            rate_mean_bits: AtomicU64::new(0f64.to_bits()),
            stopped: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    fn mark(&self, n: u64) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.count.fetch_add(n, Ordering::Relaxed);
        self.a1.update(n);
        self.a5.update(n);
        self.a15.update(n);
        self.refresh_snapshot();
    }

    fn tick(&self) {
        self.a1.tick();
        self.a5.tick();
        self.a15.tick();
        self.refresh_snapshot();
    }

    fn refresh_snapshot(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(f64::EPSILON);
        let mean = self.count.load(Ordering::Relaxed) as f64 / elapsed;
        self.rate1_bits
            .store(self.a1.rate().to_bits(), Ordering::Relaxed);
        self.rate5_bits
            .store(self.a5.rate().to_bits(), Ordering::Relaxed);
        self.rate15_bits
            .store(self.a15.rate().to_bits(), Ordering::Relaxed);
        self.rate_mean_bits.store(mean.to_bits(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            count: self.count.load(Ordering::Relaxed),
            rate1: f64::from_bits(self.rate1_bits.load(Ordering::Relaxed)),
            rate5: f64::from_bits(self.rate5_bits.load(Ordering::Relaxed)),
            rate15: f64::from_bits(self.rate15_bits.load(Ordering::Relaxed)),
            rate_mean: f64::from_bits(self.rate_mean_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Handle to a live meter. Cloning is cheap; all clones observe the same
/// counters. Created through [`MeterScheduler::meter`].
#[derive(Debug, Clone)]
pub struct Meter {
    id: u64,
    inner: Arc<MeterInner>,
    registry: Arc<Registry>,
}

impl Meter {
    /// Record the occurrence of `n` events.
    ///
    /// A no-op once the meter has been stopped: a mark racing `stop` may or
    /// may not apply, but nothing lands after `stop` has returned and the
    /// stopped flag is visible.
    pub fn mark(&self, n: u64) {
        self.inner.mark(n);
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// One-minute moving average rate, events per second.
    pub fn rate1(&self) -> f64 {
        f64::from_bits(self.inner.rate1_bits.load(Ordering::Relaxed))
    }

    /// Five-minute moving average rate, events per second.
    pub fn rate5(&self) -> f64 {
        f64::from_bits(self.inner.rate5_bits.load(Ordering::Relaxed))
    }

    /// Fifteen-minute moving average rate, events per second.
    pub fn rate15(&self) -> f64 {
        f64::from_bits(self.inner.rate15_bits.load(Ordering::Relaxed))
    }

    /// Mean rate since creation, events per second.
    pub fn rate_mean(&self) -> f64 {
        f64::from_bits(self.inner.rate_mean_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        self.inner.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stop the meter and remove it from the scheduler registry.
    ///
    /// Subsequent marks are silently ignored. Stopping twice is harmless.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.registry.remove(self.id);
            debug!(meter = %self.inner.name, "meter stopped");
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    meters: RwLock<HashMap<u64, Arc<MeterInner>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn insert(&self, inner: Arc<MeterInner>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.meters.write() {
            Ok(mut meters) => {
                meters.insert(id, inner);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, inner);
            }
        }
        id
    }

    fn remove(&self, id: u64) {
        match self.meters.write() {
            Ok(mut meters) => {
                meters.remove(&id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&id);
            }
        }
    }

    /// Tick every registered meter under the shared read lock. Removal
    /// waits for the cycle, so a meter is either ticked fully or skipped
    /// entirely, never half-ticked.
    fn tick_all(&self) {
        let meters = match self.meters.read() {
            Ok(meters) => meters,
            Err(poisoned) => poisoned.into_inner(),
        };
        for inner in meters.values() {
            inner.tick();
        }
    }

    fn len(&self) -> usize {
        match self.meters.read() {
            Ok(meters) => meters.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Ticks every registered meter on a fixed five-second interval from a
/// single background task.
///
/// One instance per process, constructed in `main` and shared by reference;
/// meters deregister themselves through their handles.
#[derive(Debug)]
pub struct MeterScheduler {
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl MeterScheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Create a meter and register it for ticking.
    pub fn meter(&self, name: impl Into<String>) -> Meter {
        let inner = Arc::new(MeterInner::new(name.into()));
        let id = self.registry.insert(Arc::clone(&inner));
        debug!(meter = %inner.name, id, "meter registered");
        Meter {
            id,
            inner,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Spawn the ticker task. Must be called from within a tokio runtime.
    ///
    /// Only the first call spawns; a second ticker would drain every meter's
    /// bucket twice per window and skew all the rates.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + TICK_INTERVAL;
            let mut interval = tokio::time::interval_at(start, TICK_INTERVAL);
            // A stalled runtime must not replay missed ticks as a burst,
            // that would skew every EWMA window.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => registry.tick_all(),
                }
            }
            debug!("meter scheduler stopped");
        });
    }

    /// Stop the ticker task. Registered meters keep their last rates.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn registered_meters(&self) -> usize {
        self.registry.len()
    }
}

impl Default for MeterScheduler {
    fn default() -> Self {
        Self::new()
    }
}
