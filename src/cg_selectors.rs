//! Peer selection strategies
//!
//! A selector picks the neighbor a node pushes to. Neighbors present in the
//! forbidden set are never candidates; among the rest, down neighbors are
//! only distinguishable from absent ones through [`PeerSelection`]:
//! `NoPeer` when nothing is eligible, `NoLivePeer` when eligible neighbors
//! exist but none of them is up.

use crate::cg_bitset::NodeSet;
use crate::cg_error::SimError;
use crate::cg_graph::{connected_components, IndexedNeighborGraph, Liveness};
use crate::cg_interface::{NodeId, PeerSelection};
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub trait PeerSelector: fmt::Debug {
    fn select(
        &mut self,
        selecting: NodeId,
        graph: &IndexedNeighborGraph,
        forbidden: &NodeSet,
        liveness: &dyn Liveness,
    ) -> Result<PeerSelection, SimError>;
}

fn eligible(selecting: NodeId, graph: &IndexedNeighborGraph, forbidden: &NodeSet) -> Vec<NodeId> {
    graph
        .neighbors(selecting)
        .iter()
        .copied()
        .filter(|n| !forbidden.contains(*n))
        .collect()
}

// ============================================================================
// Random
// ============================================================================

/// Uniform choice among live eligible neighbors
#[derive(Debug)]
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl PeerSelector for RandomSelector {
    fn select(
        &mut self,
        selecting: NodeId,
        graph: &IndexedNeighborGraph,
        forbidden: &NodeSet,
        liveness: &dyn Liveness,
    ) -> Result<PeerSelection, SimError> {
        let mut candidates = eligible(selecting, graph, forbidden);
        if candidates.is_empty() {
            return Ok(PeerSelection::NoPeer);
        }
        candidates.shuffle(&mut self.rng);
        Ok(candidates
            .into_iter()
            .find(|n| liveness.is_up(*n))
            .map_or(PeerSelection::NoLivePeer, PeerSelection::Peer))
    }
}

// ============================================================================
// Roulette Wheel
// ============================================================================

/// Fitness-proportional choice over a fixed weight vector
#[derive(Debug, Clone)]
pub struct RouletteWheel {
    cumulative: Vec<f64>,
}

impl RouletteWheel {
    pub fn new(weights: &[f64]) -> Result<Self, SimError> {
        let total: f64 = weights.iter().sum();
        if !(total > 0.0 && total.is_finite()) || weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(SimError::NonNormalizableWeights { total });
        }
        let mut acc = 0.0;
        let mut cumulative: Vec<f64> = weights
            .iter()
            .map(|w| {
                acc += w / total;
                acc
            })
            .collect();
        if let Some(last) = cumulative.last_mut() {
            *last = 1.0;
        }
        Ok(Self { cumulative })
    }

    /// Index selected by `u` in `[0, 1)`
    pub fn spin(&self, u: f64) -> usize {
        let index = self.cumulative.partition_point(|c| *c <= u);
        index.min(self.cumulative.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }
}

// ============================================================================
// Centrality / Anti-centrality
// ============================================================================

/// Roulette choice weighted by neighbor degree, or by its inverse
#[derive(Debug)]
pub struct BiasedCentralitySelector {
    rng: StdRng,
    anti: bool,
}

impl BiasedCentralitySelector {
    pub fn centrality(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            anti: false,
        }
    }

    pub fn anti_centrality(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            anti: true,
        }
    }

    fn weight(&self, graph: &IndexedNeighborGraph, node: NodeId) -> f64 {
        let degree = graph.degree(node).max(1) as f64;
        if self.anti {
            1.0 / degree
        } else {
            degree
        }
    }
}

impl PeerSelector for BiasedCentralitySelector {
    fn select(
        &mut self,
        selecting: NodeId,
        graph: &IndexedNeighborGraph,
        forbidden: &NodeSet,
        liveness: &dyn Liveness,
    ) -> Result<PeerSelection, SimError> {
        let candidates = eligible(selecting, graph, forbidden);
        if candidates.is_empty() {
            return Ok(PeerSelection::NoPeer);
        }
        let live: Vec<NodeId> = candidates.into_iter().filter(|n| liveness.is_up(*n)).collect();
        if live.is_empty() {
            return Ok(PeerSelection::NoLivePeer);
        }
        let weights: Vec<f64> = live.iter().map(|n| self.weight(graph, *n)).collect();
        let wheel = RouletteWheel::new(&weights)?;
        Ok(PeerSelection::Peer(live[wheel.spin(self.rng.gen())]))
    }
}

// ============================================================================
// Component
// ============================================================================

#[derive(Debug)]
struct ComponentPlan {
    signature: u64,
    /// Neighbors grouped by component of the graph minus the selecting node,
    /// largest component first
    components: Vec<NodeSet>,
    cursor: usize,
}

impl ComponentPlan {
    fn build(selecting: NodeId, graph: &IndexedNeighborGraph) -> Self {
        let mut ranked: Vec<(usize, NodeSet)> = connected_components(graph, |v| v != selecting)
            .into_iter()
            .filter_map(|component| {
                let size = component.len();
                let touching: NodeSet = component
                    .into_iter()
                    .filter(|v| graph.is_edge(selecting, *v))
                    .collect();
                (!touching.is_empty()).then_some((size, touching))
            })
            .collect();
        // stable: ties keep discovery order
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        Self {
            signature: graph.signature(),
            components: ranked.into_iter().map(|(_, set)| set).collect(),
            cursor: 0,
        }
    }
}

/// Spreads pushes across the components a node bridges.
///
/// Each call constrains the delegate to the next component (largest first)
/// until every component has been tried once; after that the delegate runs
/// unconstrained. The plan is rebuilt whenever the graph signature changes.
#[derive(Debug)]
pub struct ComponentSelector {
    delegate: Box<dyn PeerSelector>,
    plans: HashMap<NodeId, ComponentPlan>,
}

impl ComponentSelector {
    pub fn new(delegate: Box<dyn PeerSelector>) -> Self {
        Self {
            delegate,
            plans: HashMap::new(),
        }
    }
}

impl PeerSelector for ComponentSelector {
    fn select(
        &mut self,
        selecting: NodeId,
        graph: &IndexedNeighborGraph,
        forbidden: &NodeSet,
        liveness: &dyn Liveness,
    ) -> Result<PeerSelection, SimError> {
        let Self { delegate, plans } = self;
        let signature = graph.signature();
        let plan = plans
            .entry(selecting)
            .or_insert_with(|| ComponentPlan::build(selecting, graph));
        if plan.signature != signature {
            *plan = ComponentPlan::build(selecting, graph);
        }

        while plan.cursor < plan.components.len() {
            let component = &plan.components[plan.cursor];
            let mut constrained = forbidden.clone();
            for n in graph.neighbors(selecting) {
                if !component.contains(*n) {
                    constrained.insert(*n);
                }
            }
            plan.cursor += 1;
            if let PeerSelection::Peer(peer) = delegate.select(selecting, graph, &constrained, liveness)? {
                return Ok(PeerSelection::Peer(peer));
            }
        }
        delegate.select(selecting, graph, forbidden, liveness)
    }
}

// ============================================================================
// Selector Kind
// ============================================================================

/// Named selector family, as used in experiment descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Random,
    Centrality,
    AntiCentrality,
    Component,
}

impl SelectorKind {
    pub fn build(&self, seed: u64) -> Box<dyn PeerSelector> {
        match self {
            SelectorKind::Random => Box::new(RandomSelector::new(seed)),
            SelectorKind::Centrality => Box::new(BiasedCentralitySelector::centrality(seed)),
            SelectorKind::AntiCentrality => Box::new(BiasedCentralitySelector::anti_centrality(seed)),
            SelectorKind::Component => Box::new(ComponentSelector::new(Box::new(
                BiasedCentralitySelector::anti_centrality(seed),
            ))),
        }
    }
}

impl FromStr for SelectorKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(SelectorKind::Random),
            "centrality" => Ok(SelectorKind::Centrality),
            "anticentrality" => Ok(SelectorKind::AntiCentrality),
            "component" => Ok(SelectorKind::Component),
            _ => Err(SimError::UnknownSelector(s.to_string())),
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectorKind::Random => "random",
            SelectorKind::Centrality => "centrality",
            SelectorKind::AntiCentrality => "anticentrality",
            SelectorKind::Component => "component",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg_graph::AllLive;

    struct Down(Vec<NodeId>);

    impl Liveness for Down {
        fn is_up(&self, node: NodeId) -> bool {
            !self.0.contains(&node)
        }

        fn live_count(&self) -> usize {
            0
        }

        fn version(&self) -> u64 {
            0
        }
    }

    /// 0 bridges a hub (1, with leaves 3..=6) and a leaf (2)
    fn hub_and_leaf() -> IndexedNeighborGraph {
        IndexedNeighborGraph::from_edges(7, &[(0, 1), (0, 2), (1, 3), (1, 4), (1, 5), (1, 6)]).unwrap()
    }

    #[test]
    fn test_roulette_rejects_bad_weights() {
        assert!(matches!(
            RouletteWheel::new(&[0.0, 0.0]),
            Err(SimError::NonNormalizableWeights { .. })
        ));
        assert!(RouletteWheel::new(&[]).is_err());
        assert!(RouletteWheel::new(&[1.0, f64::INFINITY]).is_err());
        assert!(RouletteWheel::new(&[1.0, -0.5]).is_err());
    }

    #[test]
    fn test_roulette_skips_zero_weights() {
        let wheel = RouletteWheel::new(&[0.0, 1.0, 0.0, 1.0]).unwrap();
        assert_eq!(wheel.spin(0.0), 1);
        assert_eq!(wheel.spin(0.49), 1);
        assert_eq!(wheel.spin(0.5), 3);
        assert_eq!(wheel.spin(0.999_999), 3);
    }

    #[test]
    fn test_roulette_proportionality() {
        let weights = [1.0, 2.0, 7.0];
        let wheel = RouletteWheel::new(&weights).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 3];
        let spins = 100_000;
        for _ in 0..spins {
            counts[wheel.spin(rng.gen())] += 1;
        }
        for (count, weight) in counts.iter().zip(weights) {
            let observed = *count as f64 / spins as f64;
            assert!((observed - weight / 10.0).abs() < 0.01, "{} vs {}", observed, weight / 10.0);
        }
    }

    #[test]
    fn test_random_respects_forbidden() {
        let graph = IndexedNeighborGraph::complete(5);
        let forbidden: NodeSet = [1, 2, 3].into_iter().collect();
        let mut selector = RandomSelector::new(42);
        for _ in 0..50 {
            let choice = selector.select(0, &graph, &forbidden, &AllLive { size: 5 }).unwrap();
            assert_eq!(choice, PeerSelection::Peer(4));
        }
    }

    #[test]
    fn test_no_peer_versus_no_live_peer() {
        let graph = IndexedNeighborGraph::line(3);
        let mut selector = RandomSelector::new(42);
        let all: NodeSet = [0, 2].into_iter().collect();
        assert_eq!(
            selector.select(1, &graph, &all, &AllLive { size: 3 }).unwrap(),
            PeerSelection::NoPeer
        );
        assert_eq!(
            selector.select(1, &graph, &NodeSet::new(), &Down(vec![0, 2])).unwrap(),
            PeerSelection::NoLivePeer
        );

        let mut biased = BiasedCentralitySelector::centrality(42);
        assert_eq!(
            biased.select(1, &graph, &NodeSet::new(), &Down(vec![0, 2])).unwrap(),
            PeerSelection::NoLivePeer
        );
        assert_eq!(
            biased.select(1, &graph, &all, &AllLive { size: 3 }).unwrap(),
            PeerSelection::NoPeer
        );
    }

    #[test]
    fn test_centrality_bias() {
        let graph = hub_and_leaf();
        let live = AllLive { size: 7 };
        let mut central = BiasedCentralitySelector::centrality(42);
        let mut anti = BiasedCentralitySelector::anti_centrality(42);
        let rounds = 6000;
        let mut hub = 0;
        let mut leaf = 0;
        for _ in 0..rounds {
            if central.select(0, &graph, &NodeSet::new(), &live).unwrap() == PeerSelection::Peer(1) {
                hub += 1;
            }
            if anti.select(0, &graph, &NodeSet::new(), &live).unwrap() == PeerSelection::Peer(2) {
                leaf += 1;
            }
        }
        // degree(1) = 5, degree(2) = 1
        assert!((hub as f64 / rounds as f64 - 5.0 / 6.0).abs() < 0.03);
        assert!((leaf as f64 / rounds as f64 - 5.0 / 6.0).abs() < 0.03);
    }

    #[test]
    fn test_component_tries_largest_first() {
        let graph = hub_and_leaf();
        let live = AllLive { size: 7 };
        let mut selector = SelectorKind::Component.build(42);

        assert_eq!(selector.select(0, &graph, &NodeSet::new(), &live).unwrap(), PeerSelection::Peer(1));
        assert_eq!(selector.select(0, &graph, &NodeSet::new(), &live).unwrap(), PeerSelection::Peer(2));
        // every component tried: unconstrained from now on
        let forbidden: NodeSet = [2].into_iter().collect();
        assert_eq!(selector.select(0, &graph, &forbidden, &live).unwrap(), PeerSelection::Peer(1));
    }

    #[test]
    fn test_component_skips_exhausted_component() {
        let graph = hub_and_leaf();
        let live = AllLive { size: 7 };
        let mut selector = SelectorKind::Component.build(7);
        let forbidden: NodeSet = [1].into_iter().collect();
        assert_eq!(selector.select(0, &graph, &forbidden, &live).unwrap(), PeerSelection::Peer(2));
    }

    #[test]
    fn test_selector_kind_parsing() {
        assert_eq!("Random".parse::<SelectorKind>().unwrap(), SelectorKind::Random);
        assert_eq!("anticentrality".parse::<SelectorKind>().unwrap(), SelectorKind::AntiCentrality);
        assert_eq!(
            "closest".parse::<SelectorKind>(),
            Err(SimError::UnknownSelector("closest".to_string()))
        );
        assert_eq!(SelectorKind::Component.to_string(), "component");
        let parsed: SelectorKind = serde_yaml::from_str("centrality").unwrap();
        assert_eq!(parsed, SelectorKind::Centrality);
    }
}
