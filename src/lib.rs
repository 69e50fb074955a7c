//! # cgRust - Churn-aware Gossip Simulation
//!
//! A discrete-event simulator for epidemic dissemination of a single update
//! over a network whose members keep going up and down. It estimates
//! propagation delay, coverage and message load under different
//! peer-selection heuristics.
//!
//! ## Core Components
//!
//! - **SimulationEngine**: deterministic event loop with observers, timers and stop permits
//! - **Network / Process**: topology plus an alternating-renewal churn model per node
//! - **FloodChannel**: per-node dissemination state machine over the live subgraph
//! - **PeerSelector**: random, (anti-)centrality and component-aware peer selection
//! - **TemporalConnectivityEstimator**: lower bound on delay under instant forwarding
//! - **TrialWorker**: parallel repetitions with confidence-based early stopping
//!
//! ## Usage
//!
//! ```no_run
//! use cg_rust::{run_once, IndexedNeighborGraph, ProcessSpec, SelectorKind};
//! use std::sync::Arc;
//!
//! let graph = Arc::new(IndexedNeighborGraph::line(5));
//! let metrics = run_once(graph, ProcessSpec::Static, SelectorKind::Random, 0, 0.0, None).unwrap();
//! println!("delays: {:?}", metrics["e2e_delay"]);
//! ```
//!
//! Descriptor-driven batches (YAML scenarios, tracing, summaries) live in
//! the `simulator/` binaries.

// Shared types
pub mod cg_bitset;
pub mod cg_error;
pub mod cg_interface;

// Topology and churn
pub mod cg_distributions;
pub mod cg_graph;
pub mod cg_network;
pub mod cg_process;

// Engine and protocols
pub mod cg_cloud;
pub mod cg_connectivity;
pub mod cg_cyclic;
pub mod cg_dissemination;
pub mod cg_engine;
pub mod cg_selectors;
pub mod cg_service;

// Measurement and batches
pub mod cg_executor;
pub mod cg_experiment;
pub mod cg_statistics;

// Re-export commonly used types
pub use cg_engine::{Anchor, EngineBuilder, EventObserver, SimClock, SimulationEngine};
pub use cg_error::{SimError, SimResult};
pub use cg_experiment::{run_many, run_once, AggregateMetrics, Experiment, ProcessSpec};
pub use cg_graph::IndexedNeighborGraph;
pub use cg_interface::{Event, EventSink, NodeId, NoOpSink, PeerSelection, SimTime, State};
pub use cg_selectors::{PeerSelector, SelectorKind};
pub use cg_statistics::{AvgEvaluator, IncrementalStats, RunMetrics};
