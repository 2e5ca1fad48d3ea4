//! Bounded latency sample store.
//!
//! Samples are kept exactly until `capacity` is reached; after that each new
//! sample replaces a random slot with probability `capacity / seen`
//! (Algorithm R). The RNG is seeded, so the retained set is reproducible for
//! a given seed and ingest order. Percentiles from a sampled reservoir are an
//! estimate whose error shrinks with capacity; counts are never sampled.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Reservoir {
    samples: Vec<f64>,
    capacity: usize,
    seen: u64,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            seen: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn record(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.samples[slot as usize] = value;
        }
    }

    /// True while every recorded sample is still retained.
    pub fn is_exact(&self) -> bool {
        self.seen as usize == self.samples.len()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Fold `other` into `self`.
    ///
    /// While the union fits, samples are concatenated. Otherwise each side
    /// contributes slots in proportion to how many samples it has seen, chosen
    /// without replacement by the seeded RNG.
    pub fn merge(&mut self, other: &Reservoir) {
        if other.seen == 0 {
            return;
        }
        let total_seen = self.seen + other.seen;
        if self.samples.len() + other.samples.len() <= self.capacity {
            self.samples.extend_from_slice(&other.samples);
            self.seen = total_seen;
            return;
        }

        let share = self.capacity as f64 * (self.seen as f64 / total_seen as f64);
        let mine = (share.round() as usize).min(self.samples.len());
        let theirs = (self.capacity - mine).min(other.samples.len());
        let mine = (self.capacity - theirs).min(self.samples.len());

        let mut merged = pick(&mut self.rng, &self.samples, mine);
        merged.extend(pick(&mut self.rng, &other.samples, theirs));
        self.samples = merged;
        self.seen = total_seen;
    }

    /// Nearest-rank percentile over the retained samples, `q` in `0..=100`.
    pub fn percentile(&self, q: f64) -> f64 {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        percentile_of_sorted(&sorted, q)
    }
}

/// Nearest-rank percentile: the value at index `ceil(q/100 * n) - 1`.
pub fn percentile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = ((q.clamp(0.0, 100.0) / 100.0) * n as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

fn pick(rng: &mut StdRng, from: &[f64], count: usize) -> Vec<f64> {
    if count >= from.len() {
        return from.to_vec();
    }
    rand::seq::index::sample(rng, from.len(), count)
        .into_iter()
        .map(|i| from[i])
        .collect()
}
