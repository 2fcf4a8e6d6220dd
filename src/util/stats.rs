//! Latency statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tdigest::TDigest;

/// A thread-safe reservoir sampler for nanosecond latency values.
///
/// Uses atomic operations so the interrupt handler can record samples without
/// taking a lock. The number of retained samples is capped at `N`; once the
/// reservoir is full, incoming samples replace random slots so the retained
/// set stays an unbiased sample of everything seen.
pub struct ReservoirSampler<const N: usize> {
    /// The retained samples, in nanoseconds.
    samples: [AtomicU64; N],

    /// Total number of samples offered, including ones not retained.
    count: AtomicUsize,
}

impl<const N: usize> ReservoirSampler<N> {
    /// Create a new empty reservoir.
    pub fn new() -> Self {
        Self {
            samples: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicUsize::new(0),
        }
    }

    /// Record one latency sample.
    ///
    /// This method is thread-safe and can be called from multiple threads
    /// simultaneously.
    pub fn sample(&self, latency_ns: u64) {
        if N == 0 {
            return;
        }

        let index = self.count.fetch_add(1, Ordering::Relaxed);
        if index < N {
            self.samples[index].store(latency_ns, Ordering::Relaxed);
        } else {
            let random_index = rand::thread_rng().gen_range(0..N);
            self.samples[random_index].store(latency_ns, Ordering::Relaxed);
        }
    }

    /// Total number of samples offered since the last reset.
    pub fn total(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Snapshot the retained samples.
    pub fn snapshot(&self) -> Vec<u64> {
        let retained = self.total().min(N);
        (0..retained)
            .map(|i| self.samples[i].load(Ordering::Relaxed))
            .collect()
    }

    /// Reset the reservoir.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

impl<const N: usize> Default for ReservoirSampler<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Standardized quantile estimates of a latency distribution.
#[derive(Debug, Clone)]
pub struct LatencyEstimates {
    /// The number of samples in the distribution.
    pub count: usize,

    /// The quantiles of the distribution as (percentile, value) pairs.
    pub quantiles: Vec<(f64, Duration)>,
}

impl LatencyEstimates {
    /// Get the value at a specific percentile, if it was estimated.
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        self.quantiles
            .iter()
            .find(|(p, _)| (*p - percentile).abs() < f64::EPSILON)
            .map(|(_, v)| *v)
    }
}

impl fmt::Display for LatencyEstimates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count: {}", self.count)?;
        for (p, v) in &self.quantiles {
            write!(f, ", p{}: {:?}", p * 100.0, v)?;
        }
        Ok(())
    }
}

/// A latency distribution backed by a t-digest.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    digest: TDigest,
}

impl LatencyDigest {
    const PERCENTILES: [f64; 5] = [0.001, 0.5, 0.9, 0.99, 0.999];

    /// Create a new empty distribution.
    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(100),
        }
    }

    /// Add a single latency value.
    pub fn add(&mut self, latency: Duration) {
        self.merge(vec![latency.as_secs_f64()]);
    }

    /// Add every sample retained by a reservoir.
    pub fn add_all<const N: usize>(&mut self, reservoir: &ReservoirSampler<N>) {
        let values = reservoir
            .snapshot()
            .into_iter()
            .map(|ns| Duration::from_nanos(ns).as_secs_f64())
            .collect();
        self.merge(values);
    }

    fn merge(&mut self, values: Vec<f64>) {
        let digest = std::mem::replace(&mut self.digest, TDigest::new_with_size(100));
        self.digest = digest.merge_unsorted(values);
    }

    /// Get the statistical estimates of the distribution.
    pub fn estimates(&self) -> LatencyEstimates {
        let quantiles = Self::PERCENTILES
            .iter()
            .map(|&p| {
                let seconds = self.digest.estimate_quantile(p);
                (p, Duration::from_nanos((seconds * 1e9) as u64))
            })
            .collect();

        LatencyEstimates {
            count: self.digest.count() as usize,
            quantiles,
        }
    }
}

impl Default for LatencyDigest {
    fn default() -> Self {
        Self::new()
    }
}
