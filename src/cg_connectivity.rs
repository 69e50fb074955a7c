//! Temporal connectivity estimator
//!
//! Tracks which nodes a message could have reached from the source if every
//! node forwarded it instantly to every live neighbor. This is the lower
//! bound on dissemination delay that any gossip protocol is measured
//! against.
//!
//! Reachability only grows. A node becomes reachable when it is live and
//! adjacent to a live reachable node, so the only events that can extend the
//! reached set are logins: on each login the estimator expands from the
//! logged-in node and its reached neighbors.

use crate::cg_bitset::NodeSet;
use crate::cg_engine::{Dispatch, EventObserver, ObserverId, SimulationEngine};
use crate::cg_error::SimError;
use crate::cg_graph::{IndexedNeighborGraph, Liveness};
use crate::cg_interface::{NodeId, SimTime, START_SCHEDULABLE_TYPE};
use crate::cg_network::Network;
use indexmap::IndexSet;
use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
pub struct TemporalConnectivityEstimator {
    graph: Arc<IndexedNeighborGraph>,
    source: NodeId,
    /// Always live, whatever their process says
    cloud: NodeSet,
    /// Clock time of first reach, NaN until reached
    reached: Vec<SimTime>,
    parent: Vec<Option<NodeId>>,
    done: NodeSet,
    reached_count: usize,
    me: Option<ObserverId>,
    open: IndexSet<NodeId>,
    queue: VecDeque<NodeId>,
}

impl TemporalConnectivityEstimator {
    pub fn new(graph: Arc<IndexedNeighborGraph>, source: NodeId, cloud: NodeSet) -> Result<Self, SimError> {
        let size = graph.size();
        if source >= size {
            return Err(SimError::UnknownNode { node: source, size });
        }
        if let Some(node) = cloud.iter().find(|n| *n >= size) {
            return Err(SimError::UnknownNode { node, size });
        }
        Ok(Self {
            graph,
            source,
            cloud,
            reached: vec![SimTime::NAN; size],
            parent: vec![None; size],
            done: NodeSet::with_capacity(size),
            reached_count: 0,
            me: None,
            open: IndexSet::new(),
            queue: VecDeque::new(),
        })
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn is_seeded(&self) -> bool {
        self.is_reached(self.source)
    }

    pub fn is_reached(&self, node: NodeId) -> bool {
        !self.reached[node].is_nan()
    }

    pub fn reached_count(&self) -> usize {
        self.reached_count
    }

    /// Clock time at which `node` became reachable, NaN if it never did
    pub fn reached_time(&self, node: NodeId) -> SimTime {
        self.reached[node]
    }

    pub fn end_to_end_delay(&self, node: NodeId) -> SimTime {
        self.reached[node] - self.reached[self.source]
    }

    /// End-to-end delay of every node
    pub fn delays(&self) -> Vec<f64> {
        (0..self.reached.len())
            .map(|node| self.end_to_end_delay(node))
            .collect()
    }

    /// Node through which `node` was first reached
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parent[node]
    }

    fn is_live(&self, node: NodeId, network: &Network) -> bool {
        self.cloud.contains(node) || network.is_up(node)
    }

    fn reach(&mut self, node: NodeId, parent: Option<NodeId>, time: SimTime) -> Result<(), SimError> {
        if self.is_reached(node) {
            return Err(SimError::DuplicateFirstReach(node));
        }
        self.reached[node] = time;
        self.parent[node] = parent;
        self.reached_count += 1;

        let graph = Arc::clone(&self.graph);
        self.refresh_done(node);
        for &neighbor in graph.neighbors(node) {
            self.refresh_done(neighbor);
        }
        Ok(())
    }

    fn refresh_done(&mut self, node: NodeId) {
        if self.done.contains(node) || !self.is_reached(node) {
            return;
        }
        if self.graph.neighbors(node).iter().all(|n| self.is_reached(*n)) {
            self.done.insert(node);
        }
    }

    // Breadth-first expansion over live unreached nodes
    fn expand(&mut self, start: NodeId, network: &Network, time: SimTime) -> Result<(), SimError> {
        let graph = Arc::clone(&self.graph);
        self.queue.clear();
        self.queue.push_back(start);
        while let Some(node) = self.queue.pop_front() {
            for &next in graph.neighbors(node) {
                if !self.is_reached(next) && self.is_live(next, network) {
                    self.reach(next, Some(node), time)?;
                    self.queue.push_back(next);
                }
            }
        }
        Ok(())
    }

    fn seed(&mut self, network: &Network, time: SimTime) -> Result<(), SimError> {
        debug!("connectivity estimator seeded at node {} (time {})", self.source, time);
        self.reach(self.source, None, time)?;
        self.expand(self.source, network, time)
    }

    fn on_login(&mut self, node: NodeId, network: &Network, time: SimTime) -> Result<(), SimError> {
        let mut open = std::mem::take(&mut self.open);
        open.clear();
        if self.is_reached(node) && !self.done.contains(node) {
            open.insert(node);
        }
        for &neighbor in self.graph.neighbors(node) {
            if self.is_reached(neighbor) && !self.done.contains(neighbor) {
                open.insert(neighbor);
            }
        }
        for &candidate in open.iter() {
            if self.is_live(candidate, network) {
                self.expand(candidate, network, time)?;
            }
        }
        self.open = open;
        Ok(())
    }
}

impl EventObserver for TemporalConnectivityEstimator {
    fn started(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        self.me = Some(me);
        let burnin = engine.clock().burnin();
        engine.schedule_timer(me, START_SCHEDULABLE_TYPE, burnin, 0)?;
        Ok(())
    }

    fn event_performed(
        &mut self,
        engine: &mut SimulationEngine,
        dispatch: &Dispatch,
    ) -> Result<(), SimError> {
        let Dispatch::NetworkChanged(change) = dispatch else {
            return Ok(());
        };
        if !change.state.is_up() {
            return Ok(());
        }
        let time = engine.clock().time();
        if !self.is_seeded() {
            if change.node == self.source {
                self.seed(engine.network(), time)?;
            }
            return Ok(());
        }
        self.on_login(change.node, engine.network(), time)
    }

    fn timer_fired(&mut self, engine: &mut SimulationEngine, _tag: u64) -> Result<(), SimError> {
        if !self.is_seeded() && self.is_live(self.source, engine.network()) {
            self.seed(engine.network(), engine.clock().time())?;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.reached_count == self.reached.len()
    }
}
