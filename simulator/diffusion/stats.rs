// Diffusion Simulator Statistics

use cg_rust::cg_statistics::Z_95;
use cg_rust::{AggregateMetrics, IncrementalStats};
use indexmap::IndexMap;

// ============================================================================
// Simulation Result
// ============================================================================

/// Outcome of a batch of runs
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiffusionResult {
    /// Configuration summary
    pub config_summary: String,

    /// Base seed; run `i` used `seed + i`
    pub seed_used: u64,

    pub runs: usize,
    pub failed: usize,
    pub stopped_early: bool,

    /// Run-level summary of every metric (mean over nodes, then over runs)
    pub metrics: IndexMap<String, MetricSummary>,

    /// Mean end-to-end delay of each node over all runs
    pub per_node_delay: Vec<f64>,

    /// Mean connectivity lower bound of each node, when estimated
    pub per_node_bound: Option<Vec<f64>>,
}

/// Summary of one run-level statistic
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,

    /// Half width of the 95% confidence interval on the mean
    pub half_width: f64,

    pub samples: u64,
}

impl From<&IncrementalStats> for MetricSummary {
    fn from(stats: &IncrementalStats) -> Self {
        Self {
            mean: stats.mean(),
            std_dev: stats.std_dev(),
            min: stats.min(),
            max: stats.max(),
            half_width: stats.half_width(Z_95),
            samples: stats.n(),
        }
    }
}

impl DiffusionResult {
    pub fn from_aggregate(config_summary: String, seed_used: u64, aggregate: &AggregateMetrics) -> Self {
        let metrics = aggregate
            .ids()
            .filter_map(|id| {
                aggregate
                    .run_mean(id)
                    .map(|stats| (id.to_string(), MetricSummary::from(stats)))
            })
            .collect();

        Self {
            config_summary,
            seed_used,
            runs: aggregate.runs(),
            failed: aggregate.failed(),
            stopped_early: aggregate.stopped_early(),
            metrics,
            per_node_delay: aggregate.node_means("e2e_delay").unwrap_or_default(),
            per_node_bound: aggregate.node_means("tce_delay"),
        }
    }

    pub fn metric(&self, id: &str) -> Option<&MetricSummary> {
        self.metrics.get(id)
    }

    /// Ratio of the mean flooding delay to its connectivity lower bound
    pub fn delay_stretch(&self) -> Option<f64> {
        let delay = self.metric("e2e_delay")?.mean;
        let bound = self.metric("tce_delay")?.mean;
        (bound > 0.0).then(|| delay / bound)
    }

    /// Print human-readable summary
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    DISSEMINATION SIMULATION RESULTS                    ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration: {}", self.config_summary);
        println!("Seed: {}", self.seed_used);
        println!(
            "Runs: {} completed, {} failed{}",
            self.runs,
            self.failed,
            if self.stopped_early { " (stopped early, precise)" } else { "" }
        );
        println!();

        println!("═══ Delays ═══");
        for id in ["e2e_delay", "receiver_delay", "tce_delay"] {
            if let Some(summary) = self.metric(id) {
                print_metric(id, summary);
            }
        }
        if let Some(stretch) = self.delay_stretch() {
            println!("  Stretch over connectivity bound: {:.3}", stretch);
        }
        if let Some(reached) = self.metric("reached") {
            println!("  Reached: {:.1}%", reached.mean * 100.0);
        }
        println!();

        println!("═══ Message Overhead ═══");
        for id in ["updates_sent", "updates_received", "duplicates", "ae_digests", "nup_sent", "nup_received"] {
            if let Some(summary) = self.metric(id) {
                print_metric(id, summary);
            }
        }
        println!();

        if self.metric("cloud_accesses").is_some() {
            println!("═══ Cloud ═══");
            for id in ["cloud_accesses", "cloud_productive"] {
                if let Some(summary) = self.metric(id) {
                    print_metric(id, summary);
                }
            }
            println!();
        }

        if !self.per_node_delay.is_empty() {
            let (slowest, delay) = self
                .per_node_delay
                .iter()
                .enumerate()
                .filter(|(_, d)| !d.is_nan())
                .fold((0, f64::NEG_INFINITY), |best, (node, d)| {
                    if *d > best.1 { (node, *d) } else { best }
                });
            if delay.is_finite() {
                println!("Slowest node: {} (mean delay {:.4})", slowest, delay);
            }
        }
    }
}

fn print_metric(id: &str, summary: &MetricSummary) {
    println!(
        "  {:<18} {:>10.4} ± {:<8.4} (min={:.4}, max={:.4}, n={})",
        id, summary.mean, summary.half_width, summary.min, summary.max, summary.samples
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_rust::RunMetrics;

    fn metrics(delays: Vec<f64>) -> RunMetrics {
        let mut m = RunMetrics::new();
        m.insert("e2e_delay".into(), delays);
        m
    }

    #[test]
    fn test_summary_from_aggregate() {
        let mut aggregate = AggregateMetrics::new();
        aggregate.add(&metrics(vec![0.0, 1.0, 2.0]));
        aggregate.add(&metrics(vec![0.0, 3.0, 4.0]));

        let result = DiffusionResult::from_aggregate("test".into(), 7, &aggregate);
        assert_eq!(result.runs, 2);
        assert_eq!(result.per_node_delay, vec![0.0, 2.0, 3.0]);
        assert!(result.per_node_bound.is_none());

        let e2e = result.metric("e2e_delay").unwrap();
        assert_eq!(e2e.samples, 2);
        assert!((e2e.mean - 5.0 / 3.0).abs() < 1e-9);
        assert!(result.delay_stretch().is_none());
    }

    #[test]
    fn test_delay_stretch() {
        let mut aggregate = AggregateMetrics::new();
        let mut m = metrics(vec![0.0, 4.0]);
        m.insert("tce_delay".into(), vec![0.0, 2.0]);
        aggregate.add(&m);

        let result = DiffusionResult::from_aggregate("test".into(), 0, &aggregate);
        assert!((result.delay_stretch().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(result.per_node_bound, Some(vec![0.0, 2.0]));
    }
}
