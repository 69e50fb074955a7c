use crate::cg_interface::{Event, EventSink, MessageFlags, MessageKind, NodeId, SimTime};
use indexmap::IndexMap;

/// Per-node values of one run, keyed by metric id in insertion order
pub type RunMetrics = IndexMap<String, Vec<f64>>;

// ============================================================================
// Incremental Statistics
// ============================================================================

/// Running mean and variance (Welford), plus extremes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementalStats {
    n: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl IncrementalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64) {
        if self.n == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance, zero with fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Half width of the normal confidence interval for the mean
    pub fn half_width(&self, z: f64) -> f64 {
        if self.n == 0 {
            return f64::INFINITY;
        }
        z * self.std_dev() / (self.n as f64).sqrt()
    }
}

// ============================================================================
// Precision Evaluator
// ============================================================================

/// z for a two-sided 95% interval
pub const Z_95: f64 = 1.959_963_984_540_054;

/// Decides when an average is known precisely enough to stop sampling
#[derive(Debug, Clone, PartialEq)]
pub struct AvgEvaluator {
    /// Relative half width to reach
    pub precision: f64,
    /// Absolute half width below which the estimate is accepted regardless
    pub res_limit: f64,
    pub min_samples: u64,
    pub z: f64,
}

impl Default for AvgEvaluator {
    fn default() -> Self {
        Self {
            precision: 0.05,
            res_limit: 0.0,
            min_samples: 100,
            z: Z_95,
        }
    }
}

impl AvgEvaluator {
    pub fn new(precision: f64, res_limit: f64, min_samples: u64) -> Self {
        Self {
            precision,
            res_limit,
            min_samples,
            ..Self::default()
        }
    }

    pub fn is_precise(&self, stats: &IncrementalStats) -> bool {
        if stats.n() < self.min_samples {
            return false;
        }
        let half = stats.half_width(self.z);
        half < self.res_limit || (stats.mean() != 0.0 && half / stats.mean().abs() < self.precision)
    }
}

// ============================================================================
// Message Statistics
// ============================================================================

const FLOOD: usize = 0;
const ANTIENTROPY: usize = 1;

/// Per-node message counters, collected outside burn-in only.
///
/// Deliveries flagged `NO_MESSAGE` (local posts, cloud fetches) did not
/// cross the network and are not counted as traffic.
#[derive(Debug, Clone)]
pub struct MessageStatistics {
    updates_sent: [Vec<u64>; 2],
    updates_received: [Vec<u64>; 2],
    nup_sent: [Vec<u64>; 2],
    nup_received: [Vec<u64>; 2],
    digests_sent: Vec<u64>,
    digests_received: Vec<u64>,
    cloud_accesses: Vec<u64>,
    cloud_productive: Vec<u64>,
}

impl MessageStatistics {
    pub fn new(size: usize) -> Self {
        let zeros = || vec![0u64; size];
        Self {
            updates_sent: [zeros(), zeros()],
            updates_received: [zeros(), zeros()],
            nup_sent: [zeros(), zeros()],
            nup_received: [zeros(), zeros()],
            digests_sent: zeros(),
            digests_received: zeros(),
            cloud_accesses: zeros(),
            cloud_productive: zeros(),
        }
    }

    pub fn size(&self) -> usize {
        self.digests_sent.len()
    }

    pub fn updates_sent(&self, node: NodeId) -> u64 {
        self.updates_sent[FLOOD][node] + self.updates_sent[ANTIENTROPY][node]
    }

    pub fn updates_received(&self, node: NodeId) -> u64 {
        self.updates_received[FLOOD][node] + self.updates_received[ANTIENTROPY][node]
    }

    pub fn antientropy_updates_received(&self, node: NodeId) -> u64 {
        self.updates_received[ANTIENTROPY][node]
    }

    pub fn nup_sent(&self, node: NodeId) -> u64 {
        self.nup_sent[FLOOD][node] + self.nup_sent[ANTIENTROPY][node]
    }

    pub fn nup_received(&self, node: NodeId) -> u64 {
        self.nup_received[FLOOD][node] + self.nup_received[ANTIENTROPY][node]
    }

    /// Digests exchanged, sent or received
    pub fn digests(&self, node: NodeId) -> u64 {
        self.digests_sent[node] + self.digests_received[node]
    }

    pub fn cloud_accesses(&self, node: NodeId) -> u64 {
        self.cloud_accesses[node]
    }

    pub fn cloud_productive(&self, node: NodeId) -> u64 {
        self.cloud_productive[node]
    }

    fn per_node(&self, f: impl Fn(NodeId) -> u64) -> Vec<f64> {
        (0..self.size()).map(|i| f(i) as f64).collect()
    }

    /// Traffic metrics keyed by metric id
    pub fn metrics(&self, with_cloud: bool) -> Vec<(&'static str, Vec<f64>)> {
        let mut metrics = vec![
            ("updates_sent", self.per_node(|i| self.updates_sent(i))),
            ("updates_received", self.per_node(|i| self.updates_received(i))),
            ("nup_sent", self.per_node(|i| self.nup_sent(i))),
            ("nup_received", self.per_node(|i| self.nup_received(i))),
            ("ae_digests", self.per_node(|i| self.digests(i))),
        ];
        if with_cloud {
            metrics.push(("cloud_accesses", self.per_node(|i| self.cloud_accesses(i))));
            metrics.push(("cloud_productive", self.per_node(|i| self.cloud_productive(i))));
        }
        metrics
    }
}

impl EventSink for MessageStatistics {
    fn log(&mut self, _raw_time: SimTime, burning_in: bool, node: NodeId, event: Event) {
        if burning_in {
            return;
        }
        match event {
            Event::MessageReceived { sender, kind, flags } => {
                if flags.contains(MessageFlags::NO_MESSAGE) {
                    return;
                }
                let protocol = if flags.is_antientropy() { ANTIENTROPY } else { FLOOD };
                let (sent, received) = match kind {
                    MessageKind::Update => (&mut self.updates_sent, &mut self.updates_received),
                    MessageKind::NoUpdate => (&mut self.nup_sent, &mut self.nup_received),
                };
                sent[protocol][sender] += 1;
                received[protocol][node] += 1;
            }
            Event::DigestExchanged { sender } => {
                self.digests_sent[sender] += 1;
                self.digests_received[node] += 1;
            }
            Event::CloudAccess { productive } => {
                self.cloud_accesses[node] += 1;
                if productive {
                    self.cloud_productive[node] += 1;
                }
            }
            Event::StateChange { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_incremental_stats_matches_two_pass() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples: Vec<f64> = (0..1000).map(|_| rng.gen_range(-5.0..20.0)).collect();
        let mut stats = IncrementalStats::new();
        for x in &samples {
            stats.add(*x);
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
        assert_eq!(stats.n(), 1000);
        assert!((stats.mean() - mean).abs() < 1e-9);
        assert!((stats.variance() - var).abs() < 1e-6);
        assert_eq!(stats.min(), samples.iter().cloned().fold(f64::INFINITY, f64::min));
    }

    #[test]
    fn test_evaluator_needs_min_samples() {
        let evaluator = AvgEvaluator::default();
        let mut stats = IncrementalStats::new();
        for _ in 0..99 {
            stats.add(10.0);
        }
        assert!(!evaluator.is_precise(&stats));
        stats.add(10.0);
        assert!(evaluator.is_precise(&stats));
    }

    #[test]
    fn test_evaluator_precision_and_res_limit() {
        let mut stats = IncrementalStats::new();
        for i in 0..200 {
            stats.add(if i % 2 == 0 { 0.0 } else { 2.0 });
        }
        // mean 1, std ~1, half width ~0.14
        assert!(!AvgEvaluator::new(0.05, 0.0, 100).is_precise(&stats));
        assert!(AvgEvaluator::new(0.2, 0.0, 100).is_precise(&stats));
        assert!(AvgEvaluator::new(0.05, 0.5, 100).is_precise(&stats));
    }

    #[test]
    fn test_message_statistics_buckets() {
        let mut stats = MessageStatistics::new(3);
        let received = |kind, flags| Event::MessageReceived { sender: 0, kind, flags };

        stats.log(1.0, false, 1, received(MessageKind::Update, MessageFlags::NONE));
        stats.log(1.0, false, 2, received(MessageKind::Update, MessageFlags::ANTIENTROPY_PUSH));
        stats.log(1.0, false, 2, received(MessageKind::NoUpdate, MessageFlags::DUPLICATE));
        stats.log(1.0, false, 0, received(MessageKind::Update, MessageFlags::NO_MESSAGE));
        stats.log(0.5, true, 1, received(MessageKind::Update, MessageFlags::NONE));
        stats.log(1.0, false, 1, Event::DigestExchanged { sender: 0 });
        stats.log(1.0, false, 2, Event::CloudAccess { productive: true });
        stats.log(1.0, false, 2, Event::CloudAccess { productive: false });

        assert_eq!(stats.updates_sent(0), 2);
        assert_eq!(stats.updates_received(1), 1);
        assert_eq!(stats.antientropy_updates_received(2), 1);
        assert_eq!(stats.nup_received(2), 1);
        assert_eq!(stats.updates_received(0), 0);
        assert_eq!(stats.digests(0), 1);
        assert_eq!(stats.digests(1), 1);
        assert_eq!(stats.cloud_accesses(2), 2);
        assert_eq!(stats.cloud_productive(2), 1);
        assert_eq!(stats.metrics(false).len(), 5);
        assert_eq!(stats.metrics(true).len(), 7);
    }
}
