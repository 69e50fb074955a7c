//! Experiment descriptors and entry points
//!
//! An [`Experiment`] is an immutable, serializable description of a run. A
//! fresh engine, network and protocol state are built from it for every
//! repetition, so repetitions can run on any thread.

use crate::cg_bitset::NodeSet;
use crate::cg_cloud::CloudConfig;
use crate::cg_connectivity::TemporalConnectivityEstimator;
use crate::cg_distributions::{ChurnMode, DistributionSpec, YaoAverages};
use crate::cg_engine::{Anchor, EngineBuilder};
use crate::cg_error::SimError;
use crate::cg_executor::{TrialAggregate, TrialWorker};
use crate::cg_graph::{connected_components, IndexedNeighborGraph};
use crate::cg_interface::{EventSink, NodeId, SimTime, State, PROCESS_SCHEDULABLE_TYPE};
use crate::cg_network::Network;
use crate::cg_process::{FixedProcess, Process, RenewalProcess};
use crate::cg_selectors::SelectorKind;
use crate::cg_service::{DisseminationService, ServiceConfig};
use crate::cg_statistics::{AvgEvaluator, IncrementalStats, RunMetrics};
use indexmap::IndexMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

// ============================================================================
// Process Specification
// ============================================================================

/// How node availability evolves during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessSpec {
    /// Every node always up
    #[default]
    Static,

    /// Churn preset with the same averages at every node
    Renewal { mode: ChurnMode, li: f64, di: f64 },

    /// Churn preset with per-node averages drawn from the yao generator
    Yao { mode: ChurnMode },

    /// Explicit session and inter-session distributions
    Custom { up: DistributionSpec, down: DistributionSpec },
}

impl ProcessSpec {
    pub fn has_churn(&self) -> bool {
        !matches!(self, ProcessSpec::Static)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        match self {
            ProcessSpec::Static | ProcessSpec::Yao { .. } => {}
            ProcessSpec::Renewal { mode, li, di } => {
                mode.uptime(*li)?;
                mode.downtime(*di)?;
            }
            ProcessSpec::Custom { up, down } => {
                up.build()?;
                down.build()?;
            }
        }
        Ok(())
    }

    /// One process per node. Nodes in `always_up` get a fixed up process.
    pub fn build(
        &self,
        size: usize,
        initial: State,
        always_up: &NodeSet,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Process>, SimError> {
        let yao = YaoAverages::new()?;
        let mut processes = Vec::with_capacity(size);
        for id in 0..size {
            if always_up.contains(id) {
                processes.push(Process::Fixed(FixedProcess::new(id, State::Up)));
                continue;
            }
            let (up, down) = match self {
                ProcessSpec::Static => {
                    processes.push(Process::Fixed(FixedProcess::new(id, State::Up)));
                    continue;
                }
                ProcessSpec::Renewal { mode, li, di } => (mode.uptime(*li)?, mode.downtime(*di)?),
                ProcessSpec::Yao { mode } => {
                    let (li, di) = yao.draw(rng);
                    (mode.uptime(li)?, mode.downtime(di)?)
                }
                ProcessSpec::Custom { up, down } => (up.build()?, down.build()?),
            };
            processes.push(Process::Renewal(RenewalProcess::new(id, up, down, initial, rng)));
        }
        Ok(processes)
    }
}

// ============================================================================
// Experiment
// ============================================================================

/// Complete description of a dissemination experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    pub process: ProcessSpec,

    /// Initial state of renewal processes
    pub initial: State,

    pub selector: SelectorKind,

    /// Node publishing the update
    pub source: NodeId,

    /// Churn warm-up before measurements start
    pub burnin: SimTime,

    /// Halts the run this long after burn-in
    pub anchor: Option<SimTime>,

    /// Protocol round length
    pub period: SimTime,

    /// Inactivity after which a node gives up pushing
    pub timeout: Option<SimTime>,

    /// Anti-entropy every this many rounds, disabled when zero
    pub antientropy_interval: u32,

    pub cloud: Option<CloudConfig>,

    /// Nodes that never go down
    pub cloud_nodes: Vec<NodeId>,

    /// Also run the temporal connectivity estimator (`tce_delay` metric)
    pub connectivity: bool,

    /// Base seed; repetition `i` uses `seed + i`
    pub seed: u64,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            process: ProcessSpec::Static,
            initial: State::Down,
            selector: SelectorKind::Random,
            source: 0,
            burnin: 0.0,
            anchor: None,
            period: 1.0,
            timeout: None,
            antientropy_interval: 0,
            cloud: None,
            cloud_nodes: Vec::new(),
            connectivity: false,
            seed: 0,
        }
    }
}

impl Experiment {
    /// Rejects descriptors that cannot run on `graph`, or that could run
    /// forever
    pub fn validate(&self, graph: &IndexedNeighborGraph) -> Result<(), SimError> {
        let size = graph.size();
        if self.source >= size {
            return Err(SimError::UnknownNode { node: self.source, size });
        }
        if let Some(&node) = self.cloud_nodes.iter().find(|n| **n >= size) {
            return Err(SimError::UnknownNode { node, size });
        }
        if !(self.period > 0.0 && self.period.is_finite()) {
            return Err(SimError::InvalidConfig(format!("period {}", self.period)));
        }
        if let Some(timeout) = self.timeout {
            if !(timeout > 0.0) {
                return Err(SimError::InvalidTimeout(timeout));
            }
        }
        if !(self.burnin >= 0.0 && self.burnin.is_finite()) {
            return Err(SimError::InvalidConfig(format!("burn-in {}", self.burnin)));
        }
        if let Some(anchor) = self.anchor {
            Anchor::new(anchor)?;
        }
        if let Some(cloud) = &self.cloud {
            cloud.validate()?;
        }
        self.process.validate()?;

        // under churn the run ends only once everyone is reached
        if self.process.has_churn() && self.anchor.is_none() && self.cloud.is_none() {
            if self.timeout.is_some() {
                return Err(SimError::InvalidConfig(
                    "a timeout under churn needs an anchor or a cloud".into(),
                ));
            }
            if connected_components(graph, |_| true).len() > 1 {
                return Err(SimError::InvalidConfig(
                    "disconnected graph under churn needs an anchor or a cloud".into(),
                ));
            }
        }
        Ok(())
    }

    /// Runs one repetition and returns its per-node metrics
    pub fn run_once(&self, graph: Arc<IndexedNeighborGraph>, seed: u64) -> Result<RunMetrics, SimError> {
        self.run_once_with_sink(graph, seed, None)
    }

    /// Like [`Experiment::run_once`], also reporting every protocol event
    /// to `sink`
    pub fn run_once_with_sink(
        &self,
        graph: Arc<IndexedNeighborGraph>,
        seed: u64,
        sink: Option<Box<dyn EventSink>>,
    ) -> Result<RunMetrics, SimError> {
        self.validate(&graph)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let cloud_nodes: NodeSet = self.cloud_nodes.iter().copied().collect();
        let processes = self
            .process
            .build(graph.size(), self.initial, &cloud_nodes, &mut rng)?;
        let network = Network::new(Arc::clone(&graph), processes)?;

        let mut service = DisseminationService::new(
            Arc::clone(&graph),
            ServiceConfig {
                source: self.source,
                selector: self.selector,
                period: self.period,
                timeout: self.timeout,
                antientropy_interval: self.antientropy_interval,
                cloud: self.cloud.clone(),
                seed: rng.gen(),
            },
        )?;
        if let Some(sink) = sink {
            service = service.with_event_sink(sink);
        }
        let service = Rc::new(RefCell::new(service));

        let mut builder = EngineBuilder::new(network)
            .with_burnin(self.burnin)
            .with_seed(rng.gen());
        builder.add_observer(Box::new(service.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
        let estimator = if self.connectivity {
            let estimator = Rc::new(RefCell::new(TemporalConnectivityEstimator::new(
                Arc::clone(&graph),
                self.source,
                cloud_nodes,
            )?));
            builder.add_observer(Box::new(estimator.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
            Some(estimator)
        } else {
            None
        };
        if let Some(anchor) = self.anchor {
            builder.add_observer(Box::new(Anchor::new(anchor)?), None, false, false);
        }

        let mut engine = builder.build()?;
        engine.run()?;
        debug!(
            "run with seed {} ended at raw time {:.4} ({} dispatches)",
            seed,
            engine.clock().raw_time(),
            engine.dispatched()
        );

        let mut metrics = service.borrow().metrics();
        if let Some(estimator) = estimator {
            metrics.insert("tce_delay".into(), estimator.borrow().delays());
        }
        Ok(metrics)
    }

    /// Runs up to `repetitions` repetitions on `cores` threads. With an
    /// evaluator, stops as soon as the tracked averages are precise.
    pub fn run_many(
        &self,
        graph: Arc<IndexedNeighborGraph>,
        repetitions: usize,
        cores: usize,
        evaluator: Option<AvgEvaluator>,
    ) -> Result<AggregateMetrics, SimError> {
        self.validate(&graph)?;
        let mut aggregate = AggregateMetrics::new();
        let mut worker = TrialWorker::new(cores);
        if let Some(evaluator) = evaluator {
            worker = worker.with_evaluator(evaluator);
        }

        let experiment = self.clone();
        let base = self.seed;
        let report = worker.run(
            repetitions,
            move |i| experiment.run_once(Arc::clone(&graph), base.wrapping_add(i as u64)),
            &mut aggregate,
        )?;
        aggregate.failed = report.failed;
        aggregate.stopped_early = report.stopped_early;

        if aggregate.runs == 0 && report.failed > 0 {
            return Err(SimError::Executor(format!("all {} trials failed", report.failed)));
        }
        info!(
            "{} runs aggregated ({} failed) on {} cores",
            aggregate.runs, aggregate.failed, cores
        );
        Ok(aggregate)
    }
}

/// Runs one repetition with a random seed and default protocol settings
pub fn run_once(
    graph: Arc<IndexedNeighborGraph>,
    process: ProcessSpec,
    selector: SelectorKind,
    source: NodeId,
    burnin: SimTime,
    anchor: Option<SimTime>,
) -> Result<RunMetrics, SimError> {
    let experiment = Experiment {
        process,
        selector,
        source,
        burnin,
        anchor,
        ..Experiment::default()
    };
    experiment.run_once(graph, rand::thread_rng().gen())
}

/// Runs `repetitions` repetitions in parallel and aggregates them
#[allow(clippy::too_many_arguments)]
pub fn run_many(
    graph: Arc<IndexedNeighborGraph>,
    process: ProcessSpec,
    selector: SelectorKind,
    source: NodeId,
    burnin: SimTime,
    anchor: Option<SimTime>,
    repetitions: usize,
    cores: usize,
) -> Result<AggregateMetrics, SimError> {
    let experiment = Experiment {
        process,
        selector,
        source,
        burnin,
        anchor,
        seed: rand::thread_rng().gen(),
        ..Experiment::default()
    };
    experiment.run_many(graph, repetitions, cores, None)
}

// ============================================================================
// Aggregation
// ============================================================================

/// Running per-node statistics of every metric over many runs.
///
/// NaN values (e.g. delays of unreached nodes) are skipped. Each run also
/// contributes its mean over nodes to a per-metric run-level statistic,
/// which is what early stopping looks at.
#[derive(Debug, Clone)]
pub struct AggregateMetrics {
    per_node: IndexMap<String, Vec<IncrementalStats>>,
    run_means: IndexMap<String, IncrementalStats>,
    tracked: Vec<String>,
    runs: usize,
    failed: usize,
    stopped_early: bool,
}

impl Default for AggregateMetrics {
    fn default() -> Self {
        Self::tracking(&["e2e_delay"])
    }
}

impl AggregateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate whose early stopping looks at the run means of `ids`
    pub fn tracking(ids: &[&str]) -> Self {
        Self {
            per_node: IndexMap::new(),
            run_means: IndexMap::new(),
            tracked: ids.iter().map(|id| id.to_string()).collect(),
            runs: 0,
            failed: 0,
            stopped_early: false,
        }
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.per_node.keys().map(String::as_str)
    }

    pub fn per_node(&self, id: &str) -> Option<&[IncrementalStats]> {
        self.per_node.get(id).map(Vec::as_slice)
    }

    /// Mean of `id` at every node over all runs
    pub fn node_means(&self, id: &str) -> Option<Vec<f64>> {
        self.per_node
            .get(id)
            .map(|stats| stats.iter().map(IncrementalStats::mean).collect())
    }

    pub fn run_mean(&self, id: &str) -> Option<&IncrementalStats> {
        self.run_means.get(id)
    }

    pub fn add(&mut self, metrics: &RunMetrics) {
        self.runs += 1;
        for (id, values) in metrics {
            let stats = self.per_node.entry(id.clone()).or_default();
            if stats.len() < values.len() {
                stats.resize(values.len(), IncrementalStats::new());
            }
            let mut sum = 0.0;
            let mut count = 0usize;
            for (node, value) in values.iter().enumerate() {
                if value.is_nan() {
                    continue;
                }
                stats[node].add(*value);
                sum += value;
                count += 1;
            }
            if count > 0 {
                self.run_means
                    .entry(id.clone())
                    .or_default()
                    .add(sum / count as f64);
            }
        }
    }
}

impl TrialAggregate<RunMetrics> for AggregateMetrics {
    fn fold(&mut self, value: RunMetrics) {
        self.add(&value);
    }

    fn tracked(&self) -> Vec<&IncrementalStats> {
        self.tracked
            .iter()
            .filter_map(|id| self.run_means.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(size: usize) -> Arc<IndexedNeighborGraph> {
        Arc::new(IndexedNeighborGraph::line(size))
    }

    fn churn() -> ProcessSpec {
        ProcessSpec::Renewal { mode: ChurnMode::TE, li: 1.0, di: 1.0 }
    }

    #[test]
    fn test_line_graph_scenario() {
        let metrics = run_once(line(5), ProcessSpec::Static, SelectorKind::Random, 0, 0.0, None).unwrap();
        assert_eq!(metrics["e2e_delay"], vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(metrics["reached"], vec![1.0; 5]);
        let delays = &metrics["e2e_delay"];
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_complete_graph_terminates() {
        let graph = Arc::new(IndexedNeighborGraph::complete(16));
        let experiment = Experiment { source: 5, ..Experiment::default() };
        let metrics = experiment.run_once(graph, 42).unwrap();
        assert_eq!(metrics["reached"], vec![1.0; 16]);
        assert_eq!(metrics["e2e_delay"][5], 0.0);
        assert!(metrics["e2e_delay"].iter().all(|d| *d >= 0.0));
    }

    #[test]
    fn test_churn_run_reaches_everyone() {
        let graph = Arc::new(IndexedNeighborGraph::ring(20));
        let experiment = Experiment {
            process: churn(),
            burnin: 5.0,
            period: 0.2,
            selector: SelectorKind::AntiCentrality,
            ..Experiment::default()
        };
        let metrics = experiment.run_once(graph, 42).unwrap();
        assert_eq!(metrics["reached"], vec![1.0; 20]);
        assert!(metrics["receiver_delay"].iter().all(|d| *d >= 0.0));
    }

    #[test]
    fn test_connectivity_bounds_dissemination() {
        let graph = Arc::new(IndexedNeighborGraph::ring(16));
        let experiment = Experiment {
            process: churn(),
            burnin: 3.0,
            period: 0.5,
            connectivity: true,
            ..Experiment::default()
        };
        for seed in 0..5 {
            let metrics = experiment.run_once(Arc::clone(&graph), seed).unwrap();
            let tce = &metrics["tce_delay"];
            let e2e = &metrics["e2e_delay"];
            for (lower, actual) in tce.iter().zip(e2e) {
                assert!(*lower <= *actual + 1e-9, "tce {} > flood {}", lower, actual);
            }
        }
    }

    #[test]
    fn test_anchor_bounds_runs_with_timeout() {
        let graph = Arc::new(IndexedNeighborGraph::ring(12));
        let mut experiment = Experiment {
            process: churn(),
            timeout: Some(0.5),
            ..Experiment::default()
        };
        assert!(matches!(experiment.validate(&graph), Err(SimError::InvalidConfig(_))));

        experiment.anchor = Some(20.0);
        let metrics = experiment.run_once(graph, 7).unwrap();
        assert_eq!(metrics["e2e_delay"].len(), 12);
    }

    #[test]
    fn test_cloud_run_counts_accesses() {
        let graph = Arc::new(IndexedNeighborGraph::ring(10));
        let experiment = Experiment {
            process: churn(),
            burnin: 2.0,
            cloud: Some(CloudConfig { period: 4.0, ..CloudConfig::default() }),
            cloud_nodes: vec![0],
            ..Experiment::default()
        };
        let metrics = experiment.run_once(graph, 3).unwrap();
        assert_eq!(metrics["reached"], vec![1.0; 10]);
        assert!(metrics.contains_key("cloud_accesses"));
        assert!(metrics.contains_key("cloud_productive"));
    }

    #[test]
    fn test_validation_errors() {
        let graph = line(4);
        let bad_source = Experiment { source: 4, ..Experiment::default() };
        assert_eq!(bad_source.validate(&graph), Err(SimError::UnknownNode { node: 4, size: 4 }));

        let zero_period = Experiment { period: 0.0, ..Experiment::default() };
        assert!(zero_period.validate(&graph).unwrap_err().is_config());

        let zero_timeout = Experiment { timeout: Some(0.0), ..Experiment::default() };
        assert_eq!(zero_timeout.validate(&graph), Err(SimError::InvalidTimeout(0.0)));

        let bad_process = Experiment {
            process: ProcessSpec::Custom {
                up: DistributionSpec::Exponential { mean: -1.0 },
                down: DistributionSpec::Exponential { mean: 1.0 },
            },
            ..Experiment::default()
        };
        assert!(bad_process.validate(&graph).unwrap_err().is_config());

        let split = IndexedNeighborGraph::from_edges(4, &[(0, 1), (2, 3)]).unwrap();
        let churn_split = Experiment { process: churn(), ..Experiment::default() };
        assert!(churn_split.validate(&split).is_err());
        assert!(Experiment::default().validate(&split).is_ok());
    }

    #[test]
    fn test_run_many_aggregates_runs() {
        let aggregate = run_many(line(5), ProcessSpec::Static, SelectorKind::Random, 0, 0.0, None, 8, 2).unwrap();
        assert_eq!(aggregate.runs(), 8);
        assert_eq!(aggregate.failed(), 0);
        assert_eq!(aggregate.node_means("e2e_delay"), Some(vec![0.0, 1.0, 2.0, 3.0, 4.0]));
        assert_eq!(aggregate.per_node("reached").map(|s| s[4].n()), Some(8));
    }

    #[test]
    fn test_run_many_stops_when_precise() {
        let experiment = Experiment::default();
        let aggregate = experiment
            .run_many(line(5), 200, 2, Some(AvgEvaluator::new(0.05, 0.0, 5)))
            .unwrap();
        assert!(aggregate.stopped_early());
        assert_eq!(aggregate.runs(), 5);
        assert!((aggregate.run_mean("e2e_delay").unwrap().mean() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_nan_values_are_skipped() {
        let mut aggregate = AggregateMetrics::new();
        let mut metrics = RunMetrics::new();
        metrics.insert("e2e_delay".into(), vec![0.0, f64::NAN, 4.0]);
        aggregate.add(&metrics);
        let stats = aggregate.per_node("e2e_delay").unwrap();
        assert_eq!(stats[1].n(), 0);
        assert_eq!(aggregate.run_mean("e2e_delay").unwrap().mean(), 2.0);
    }

    #[test]
    fn test_descriptor_from_yaml() {
        let yaml = r#"
process:
  type: yao
  mode: LTE
selector: anticentrality
source: 3
burnin: 10.0
anchor: 48.0
cloud:
  period: 12.0
"#;
        let experiment: Experiment = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(experiment.process, ProcessSpec::Yao { mode: ChurnMode::LTE });
        assert_eq!(experiment.selector, SelectorKind::AntiCentrality);
        assert_eq!(experiment.anchor, Some(48.0));
        assert_eq!(experiment.period, 1.0);
        assert_eq!(experiment.cloud.map(|c| c.fixed_fraction), Some(0.5));
    }
}
