use crate::cg_bitset::NodeSet;
use crate::cg_error::SimError;
use crate::cg_graph::{IndexedNeighborGraph, Liveness};
use crate::cg_interface::{NetworkChange, NodeId, SimTime, State};
use crate::cg_process::Process;
use rand::RngCore;
use std::sync::Arc;

/// Immutable topology plus the availability process of every vertex.
///
/// The engine owns the network for the duration of a run; everybody else
/// gets shared references. Only the engine drives transitions.
#[derive(Debug)]
pub struct Network {
    graph: Arc<IndexedNeighborGraph>,
    processes: Vec<Process>,
    live: usize,
    version: u64,
}

impl Network {
    pub fn new(graph: Arc<IndexedNeighborGraph>, processes: Vec<Process>) -> Result<Self, SimError> {
        if processes.len() != graph.size() {
            return Err(SimError::InvalidConfig(format!(
                "{} processes for a graph of {} vertices",
                processes.len(),
                graph.size()
            )));
        }
        if let Some((index, p)) = processes.iter().enumerate().find(|(i, p)| p.id() != *i) {
            return Err(SimError::InvalidConfig(format!(
                "process at index {} has id {}",
                index,
                p.id()
            )));
        }
        let live = processes.iter().filter(|p| p.is_up()).count();
        Ok(Self {
            graph,
            processes,
            live,
            version: 0,
        })
    }

    pub fn graph(&self) -> &IndexedNeighborGraph {
        &self.graph
    }

    pub fn shared_graph(&self) -> Arc<IndexedNeighborGraph> {
        Arc::clone(&self.graph)
    }

    pub fn size(&self) -> usize {
        self.processes.len()
    }

    pub fn process(&self, node: NodeId) -> &Process {
        &self.processes[node]
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    /// Ids of the processes that are up right now
    pub fn live_set(&self) -> NodeSet {
        self.processes
            .iter()
            .filter(|p| p.is_up())
            .map(Process::id)
            .collect()
    }

    /// Fires the pending transition of `node`'s renewal process
    pub(crate) fn transition(
        &mut self,
        node: NodeId,
        rng: &mut dyn RngCore,
        now: SimTime,
    ) -> Result<NetworkChange, SimError> {
        let size = self.processes.len();
        let process = self
            .processes
            .get_mut(node)
            .ok_or(SimError::UnknownNode { node, size })?;

        let Process::Renewal(renewal) = process else {
            return Err(SimError::Invariant(format!(
                "fixed process {} received a transition",
                node
            )));
        };

        let (state, next_shift) = renewal.transition(rng);
        match state {
            State::Up => self.live += 1,
            State::Down => self.live -= 1,
        }
        self.version += 1;

        Ok(NetworkChange {
            node,
            state,
            time: now,
            next_shift,
        })
    }
}

impl Liveness for Network {
    fn is_up(&self, node: NodeId) -> bool {
        self.processes[node].is_up()
    }

    fn live_count(&self) -> usize {
        self.live
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg_distributions::Constant;
    use crate::cg_process::{FixedProcess, RenewalProcess};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rejects_size_mismatch() {
        let graph = Arc::new(IndexedNeighborGraph::line(3));
        let processes = vec![Process::Fixed(FixedProcess::new(0, State::Up))];
        assert!(Network::new(graph, processes).is_err());
    }

    #[test]
    fn test_transition_tracks_live_count() {
        let mut rng = StdRng::seed_from_u64(42);
        let graph = Arc::new(IndexedNeighborGraph::line(2));
        let processes = vec![
            Process::Fixed(FixedProcess::new(0, State::Up)),
            Process::Renewal(RenewalProcess::new(
                1,
                Box::new(Constant(1.0)),
                Box::new(Constant(1.0)),
                State::Down,
                &mut rng,
            )),
        ];
        let mut network = Network::new(graph, processes).unwrap();
        assert_eq!(network.live_count(), 1);

        let change = network.transition(1, &mut rng, 1.0).unwrap();
        assert_eq!(change.state, State::Up);
        assert_eq!(change.next_shift, 2.0);
        assert_eq!(network.live_count(), 2);
        assert_eq!(network.version(), 1);
        assert_eq!(network.live_set().len(), 2);

        assert!(matches!(network.transition(0, &mut rng, 1.0), Err(SimError::Invariant(_))));
    }
}
