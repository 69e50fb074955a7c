//! Graph structures for the dissemination layer
//!
//! - [`IndexedNeighborGraph`]: immutable adjacency lists over a dense id space
//! - [`connected_components`]: BFS partitioning, used by the component selector
//! - [`IdMapper`]: sparse-to-dense id remapping
//! - [`LiveTransformer`]: materializes the subgraph induced by live vertices,
//!   cached per network version since every node of a run asks for the same
//!   view within one round

use crate::cg_error::SimError;
use crate::cg_interface::NodeId;
use hashbrown::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

// ============================================================================
// Indexed Neighbor Graph
// ============================================================================

/// Immutable adjacency structure. Vertex `v`'s neighbors are
/// `neighbors(v)`; ids are `0..size()`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedNeighborGraph {
    adjacency: Vec<Vec<NodeId>>,
    edges: usize,
    signature: u64,
}

impl IndexedNeighborGraph {
    /// Builds a graph from explicit neighbor lists. Lists are sorted and
    /// de-duplicated; every id must be in range and self loops are rejected.
    pub fn from_adjacency(mut adjacency: Vec<Vec<NodeId>>) -> Result<Self, SimError> {
        let size = adjacency.len();
        for (v, list) in adjacency.iter_mut().enumerate() {
            list.sort_unstable();
            list.dedup();
            if let Some(&bad) = list.iter().find(|&&u| u >= size) {
                return Err(SimError::UnknownNode { node: bad, size });
            }
            if list.binary_search(&v).is_ok() {
                return Err(SimError::InvalidConfig(format!("self loop at vertex {}", v)));
            }
        }
        Ok(Self::assemble(adjacency))
    }

    /// Builds an undirected graph on `size` vertices from an edge list
    pub fn from_edges(size: usize, edges: &[(NodeId, NodeId)]) -> Result<Self, SimError> {
        let mut adjacency = vec![Vec::new(); size];
        for &(a, b) in edges {
            for node in [a, b] {
                if node >= size {
                    return Err(SimError::UnknownNode { node, size });
                }
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
        Self::from_adjacency(adjacency)
    }

    /// Path 0 - 1 - ... - (size - 1)
    pub fn line(size: usize) -> Self {
        let adjacency = (0..size)
            .map(|v| {
                let mut list = Vec::with_capacity(2);
                if v > 0 {
                    list.push(v - 1);
                }
                if v + 1 < size {
                    list.push(v + 1);
                }
                list
            })
            .collect();
        Self::assemble(adjacency)
    }

    /// Cycle over `size` vertices; sizes below 3 degenerate to a line
    pub fn ring(size: usize) -> Self {
        if size < 3 {
            return Self::line(size);
        }
        let adjacency = (0..size)
            .map(|v| {
                let mut list = vec![(v + size - 1) % size, (v + 1) % size];
                list.sort_unstable();
                list
            })
            .collect();
        Self::assemble(adjacency)
    }

    pub fn complete(size: usize) -> Self {
        let adjacency = (0..size)
            .map(|v| (0..size).filter(|&u| u != v).collect())
            .collect();
        Self::assemble(adjacency)
    }

    fn assemble(adjacency: Vec<Vec<NodeId>>) -> Self {
        let edges = adjacency.iter().map(Vec::len).sum();
        let mut hasher = DefaultHasher::new();
        adjacency.hash(&mut hasher);
        Self {
            adjacency,
            edges,
            signature: hasher.finish(),
        }
    }

    pub fn size(&self) -> usize {
        self.adjacency.len()
    }

    pub fn degree(&self, v: NodeId) -> usize {
        self.adjacency[v].len()
    }

    pub fn neighbors(&self, v: NodeId) -> &[NodeId] {
        &self.adjacency[v]
    }

    pub fn neighbor(&self, v: NodeId, i: usize) -> NodeId {
        self.adjacency[v][i]
    }

    pub fn is_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.adjacency
            .get(from)
            .map_or(false, |list| list.binary_search(&to).is_ok())
    }

    /// Number of directed arcs (twice the edge count for undirected graphs)
    pub fn arc_count(&self) -> usize {
        self.edges
    }

    /// Content hash, stable for the lifetime of the graph
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Subgraph induced by `keep`, remapped into a dense id space
    pub fn induced(&self, keep: impl Fn(NodeId) -> bool) -> (IdMapper, IndexedNeighborGraph) {
        let mut mapper = IdMapper::new();
        for v in 0..self.size() {
            if keep(v) {
                mapper.add(v);
            }
        }
        let adjacency = mapper
            .reverse
            .iter()
            .map(|&v| {
                self.adjacency[v]
                    .iter()
                    .filter_map(|&u| mapper.try_map(u))
                    .collect::<Vec<_>>()
            })
            .collect();
        (mapper, Self::assemble(adjacency))
    }
}

// ============================================================================
// Graph Algorithms
// ============================================================================

/// Connected components of the subgraph induced by `include`, each listed in
/// ascending id order. Components are returned in order of their smallest id.
pub fn connected_components(
    graph: &IndexedNeighborGraph,
    include: impl Fn(NodeId) -> bool,
) -> Vec<Vec<NodeId>> {
    let mut seen = vec![false; graph.size()];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for root in 0..graph.size() {
        if seen[root] || !include(root) {
            continue;
        }
        seen[root] = true;
        queue.push_back(root);
        let mut members = Vec::new();

        while let Some(v) = queue.pop_front() {
            members.push(v);
            for &u in graph.neighbors(v) {
                if !seen[u] && include(u) {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }

        members.sort_unstable();
        components.push(members);
    }

    components
}

/// Hop distances from `source` over the vertices accepted by `include`;
/// unreachable vertices get `None`.
pub fn bfs_distances(
    graph: &IndexedNeighborGraph,
    source: NodeId,
    include: impl Fn(NodeId) -> bool,
) -> Vec<Option<usize>> {
    let mut distance = vec![None; graph.size()];
    if source >= graph.size() || !include(source) {
        return distance;
    }
    distance[source] = Some(0);
    let mut queue = VecDeque::from([source]);
    while let Some(v) = queue.pop_front() {
        let next = distance[v].map_or(0, |d| d + 1);
        for &u in graph.neighbors(v) {
            if distance[u].is_none() && include(u) {
                distance[u] = Some(next);
                queue.push_back(u);
            }
        }
    }
    distance
}

// ============================================================================
// Id Mapping
// ============================================================================

/// Bidirectional map from sparse original ids to a dense `0..len()` range
#[derive(Debug, Clone, Default)]
pub struct IdMapper {
    forward: HashMap<NodeId, NodeId>,
    reverse: Vec<NodeId>,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` if absent and returns its dense id
    pub fn add(&mut self, id: NodeId) -> NodeId {
        let next = self.reverse.len();
        let dense = *self.forward.entry(id).or_insert(next);
        if dense == next {
            self.reverse.push(id);
        }
        dense
    }

    pub fn try_map(&self, id: NodeId) -> Option<NodeId> {
        self.forward.get(&id).copied()
    }

    pub fn is_mapped(&self, id: NodeId) -> bool {
        self.forward.contains_key(&id)
    }

    pub fn reverse_map(&self, dense: NodeId) -> NodeId {
        self.reverse[dense]
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

// ============================================================================
// Live Transform
// ============================================================================

/// Read access to which vertices are up right now
pub trait Liveness {
    fn is_up(&self, node: NodeId) -> bool;

    fn live_count(&self) -> usize;

    /// Bumped on every availability change
    fn version(&self) -> u64;
}

/// Every vertex is live. Used once a graph has been restricted to live nodes.
pub struct AllLive {
    pub size: usize,
}

impl Liveness for AllLive {
    fn is_up(&self, _node: NodeId) -> bool {
        true
    }

    fn live_count(&self) -> usize {
        self.size
    }

    fn version(&self) -> u64 {
        0
    }
}

/// Live subgraph with its id mapping
#[derive(Debug)]
pub struct LiveSubgraph {
    pub mapper: IdMapper,
    pub graph: IndexedNeighborGraph,
}

/// Result of restricting a graph to its live vertices
#[derive(Debug, Clone)]
pub enum LiveView {
    /// Nobody is up
    NoLiveNodes,
    /// Everybody is up: use the original graph and ids
    Identity,
    Remapped(Rc<LiveSubgraph>),
}

/// Builds live views, reusing the last one while the network version is
/// unchanged.
#[derive(Debug, Default)]
pub struct LiveTransformer {
    cached: Option<(u64, LiveView)>,
    builds: usize,
}

impl LiveTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&mut self, graph: &IndexedNeighborGraph, liveness: &dyn Liveness) -> LiveView {
        let version = liveness.version();
        if let Some((cached_version, view)) = &self.cached {
            if *cached_version == version {
                return view.clone();
            }
        }

        let view = match liveness.live_count() {
            0 => LiveView::NoLiveNodes,
            n if n == graph.size() => LiveView::Identity,
            _ => {
                self.builds += 1;
                let (mapper, live) = graph.induced(|v| liveness.is_up(v));
                LiveView::Remapped(Rc::new(LiveSubgraph { mapper, graph: live }))
            }
        };
        self.cached = Some((version, view.clone()));
        view
    }

    /// Number of subgraphs materialized so far
    pub fn builds(&self) -> usize {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mask {
        up: Vec<bool>,
        version: u64,
    }

    impl Liveness for Mask {
        fn is_up(&self, node: NodeId) -> bool {
            self.up[node]
        }

        fn live_count(&self) -> usize {
            self.up.iter().filter(|u| **u).count()
        }

        fn version(&self) -> u64 {
            self.version
        }
    }

    #[test]
    fn test_line_and_ring_shapes() {
        let line = IndexedNeighborGraph::line(5);
        assert_eq!(line.neighbors(0), &[1]);
        assert_eq!(line.neighbors(2), &[1, 3]);
        assert_eq!(line.arc_count(), 8);

        let ring = IndexedNeighborGraph::ring(5);
        assert_eq!(ring.neighbors(0), &[1, 4]);
        assert!(ring.is_edge(4, 0));
        assert_eq!(ring.arc_count(), 10);
    }

    #[test]
    fn test_from_edges_validates() {
        let graph = IndexedNeighborGraph::from_edges(3, &[(0, 1), (1, 2), (1, 0)]).unwrap();
        assert_eq!(graph.degree(1), 2);
        assert_eq!(graph.neighbors(0), &[1]);

        assert_eq!(
            IndexedNeighborGraph::from_edges(3, &[(0, 5)]),
            Err(SimError::UnknownNode { node: 5, size: 3 })
        );
        assert!(IndexedNeighborGraph::from_adjacency(vec![vec![0]]).is_err());
    }

    #[test]
    fn test_components_respect_filter() {
        // 0-1-2 3-4, removing 1 splits the first component
        let graph = IndexedNeighborGraph::from_edges(5, &[(0, 1), (1, 2), (3, 4)]).unwrap();
        assert_eq!(connected_components(&graph, |_| true), vec![vec![0, 1, 2], vec![3, 4]]);
        assert_eq!(
            connected_components(&graph, |v| v != 1),
            vec![vec![0], vec![2], vec![3, 4]]
        );
    }

    #[test]
    fn test_bfs_distances() {
        let graph = IndexedNeighborGraph::line(4);
        let d = bfs_distances(&graph, 0, |_| true);
        assert_eq!(d, vec![Some(0), Some(1), Some(2), Some(3)]);
        let cut = bfs_distances(&graph, 0, |v| v != 2);
        assert_eq!(cut, vec![Some(0), Some(1), None, None]);
    }

    #[test]
    fn test_id_mapper_round_trip() {
        let mut mapper = IdMapper::new();
        assert_eq!(mapper.add(7), 0);
        assert_eq!(mapper.add(3), 1);
        assert_eq!(mapper.add(7), 0);
        assert_eq!(mapper.reverse_map(1), 3);
        assert!(!mapper.is_mapped(5));
        assert_eq!(mapper.len(), 2);
    }

    #[test]
    fn test_live_transform_cases() {
        let graph = IndexedNeighborGraph::ring(4);
        let mut transformer = LiveTransformer::new();

        let none = Mask { up: vec![false; 4], version: 1 };
        assert!(matches!(transformer.live(&graph, &none), LiveView::NoLiveNodes));

        let all = Mask { up: vec![true; 4], version: 2 };
        assert!(matches!(transformer.live(&graph, &all), LiveView::Identity));

        let some = Mask { up: vec![true, false, true, true], version: 3 };
        let LiveView::Remapped(sub) = transformer.live(&graph, &some) else {
            panic!("expected a remapped view");
        };
        assert_eq!(sub.graph.size(), 3);
        // 0 keeps only its edge to 3, which is dense id 2
        assert_eq!(sub.graph.neighbors(0), &[2]);
        assert_eq!(sub.mapper.reverse_map(2), 3);
        assert_eq!(transformer.builds(), 1);

        // same version hits the cache
        transformer.live(&graph, &some);
        assert_eq!(transformer.builds(), 1);
    }
}
