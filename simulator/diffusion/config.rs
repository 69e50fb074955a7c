// Diffusion Simulator Configuration

use cg_rust::cg_graph::IndexedNeighborGraph;
use cg_rust::{AvgEvaluator, Experiment, SimError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration for a batch of dissemination runs
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Network topology
    pub topology: TopologyConfig,

    /// Protocol, churn and measurement settings of every run
    pub experiment: Experiment,

    /// Maximum number of runs
    pub repetitions: usize,

    /// Worker threads, all available cores when zero
    pub cores: usize,

    /// Early stopping, disabled when absent
    pub precision: Option<PrecisionConfig>,

    /// Print every protocol event of the first run
    pub trace_first_run: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            experiment: Experiment::default(),
            repetitions: 100,
            cores: 0,
            precision: None,
            trace_first_run: false,
        }
    }
}

impl DiffusionConfig {
    pub fn cores(&self) -> usize {
        if self.cores > 0 {
            self.cores
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }

    pub fn evaluator(&self) -> Option<AvgEvaluator> {
        self.precision
            .as_ref()
            .map(|p| AvgEvaluator::new(p.relative, p.absolute, p.min_samples))
    }
}

// ============================================================================
// Topology
// ============================================================================

/// How the overlay graph is built
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyConfig {
    Line { size: usize },
    Ring { size: usize },
    Complete { size: usize },

    /// Erdős–Rényi G(n, p), drawn once per batch
    Random { size: usize, probability: f64, seed: u64 },

    /// Explicit undirected edge list
    Edges { size: usize, edges: Vec<(usize, usize)> },
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig::Ring { size: 100 }
    }
}

impl TopologyConfig {
    pub fn build(&self) -> Result<IndexedNeighborGraph, SimError> {
        match self {
            TopologyConfig::Line { size } => Ok(IndexedNeighborGraph::line(*size)),
            TopologyConfig::Ring { size } => Ok(IndexedNeighborGraph::ring(*size)),
            TopologyConfig::Complete { size } => Ok(IndexedNeighborGraph::complete(*size)),
            TopologyConfig::Random { size, probability, seed } => {
                if !(0.0..=1.0).contains(probability) {
                    return Err(SimError::InvalidConfig(format!("edge probability {}", probability)));
                }
                let mut rng = StdRng::seed_from_u64(*seed);
                let mut edges = Vec::new();
                for u in 0..*size {
                    for v in (u + 1)..*size {
                        if rng.gen::<f64>() < *probability {
                            edges.push((u, v));
                        }
                    }
                }
                IndexedNeighborGraph::from_edges(*size, &edges)
            }
            TopologyConfig::Edges { size, edges } => IndexedNeighborGraph::from_edges(*size, edges),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TopologyConfig::Line { size } => format!("line of {}", size),
            TopologyConfig::Ring { size } => format!("ring of {}", size),
            TopologyConfig::Complete { size } => format!("complete graph of {}", size),
            TopologyConfig::Random { size, probability, .. } => {
                format!("G({}, {})", size, probability)
            }
            TopologyConfig::Edges { size, edges } => {
                format!("{} nodes, {} edges", size, edges.len())
            }
        }
    }
}

// ============================================================================
// Precision
// ============================================================================

/// Confidence-interval stopping rule on the mean end-to-end delay
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PrecisionConfig {
    /// Relative half width of the 95% interval
    pub relative: f64,

    /// Absolute half width accepted regardless of the mean
    pub absolute: f64,

    pub min_samples: u64,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        let evaluator = AvgEvaluator::default();
        Self {
            relative: evaluator.precision,
            absolute: evaluator.res_limit,
            min_samples: evaluator.min_samples,
        }
    }
}
