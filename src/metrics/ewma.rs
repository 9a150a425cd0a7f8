use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Interval at which the scheduler ticks every registered meter.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const TICK_INTERVAL_SECS: f64 = 5.0;

/// A single exponentially-weighted moving average window.
///
/// `update` feeds raw event counts into a bucket; `tick` drains the bucket
/// into the smoothed rate. Only the meter scheduler calls `tick`, so the
/// read-modify-write of the rate needs no lock; `rate` is a lock-free read.
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    uncounted: AtomicU64,
    rate_bits: AtomicU64,
    initialized: AtomicBool,
}

impl Ewma {
    pub fn new(window_secs: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK_INTERVAL_SECS / window_secs).exp(),
            uncounted: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn one_minute() -> Self {
        Self::new(60.0)
    }

    pub fn five_minute() -> Self {
        Self::new(300.0)
    }

    pub fn fifteen_minute() -> Self {
        Self::new(900.0)
    }

    /// Record `n` events into the current tick bucket.
    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the bucket into the rate and reset it.
    ///
    /// The first tick sets the rate to the instantaneous value with no
    /// smoothing; subsequent ticks blend with `rate += alpha * (instant - rate)`.
    /// The bucket resets whether or not any events were recorded.
    pub fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / TICK_INTERVAL_SECS;
        let next = if self.initialized.load(Ordering::Acquire) {
            let rate = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
            rate + self.alpha * (instant_rate - rate)
        } else {
            self.initialized.store(true, Ordering::Release);
            instant_rate
        };
        self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Smoothed rate in events per second; zero before the first tick.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Decay factor for this window.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}
