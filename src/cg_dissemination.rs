//! Flood dissemination state machine
//!
//! A [`FloodChannel`] carries one message slot (the update, or the latest
//! "no update" marker) across every node of the network. Each node runs a
//! [`FloodProtocol`]:
//!
//! ```text
//! Idle ──reached──▶ Active ◀──peer found── Waiting
//!                     │  └──no live peer──▶   │
//!                     └──────neighbors covered / timeout──▶ Done
//! ```
//!
//! Pushes carry the sender's history (the set of nodes known to hold the
//! message); the receiver merges it and returns its own, which the sender
//! merges back. Selection never targets a node already in the history.
//!
//! A node that is Done no longer pushes, but it still hands whatever history
//! it learns to its live neighbors holding the same message. On a connected
//! graph that stays up, every history ends up containing every node.

use crate::cg_bitset::NodeSet;
use crate::cg_engine::SimClock;
use crate::cg_error::SimError;
use crate::cg_graph::{AllLive, IndexedNeighborGraph, LiveTransformer, LiveView, Liveness};
use crate::cg_interface::{
    Event, EventSink, MessageFlags, MessageKind, NodeId, PeerSelection, SimTime,
};
use crate::cg_network::Network;
use crate::cg_selectors::PeerSelector;
use log::trace;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Idle,
    Active,
    Waiting,
    Done,
}

impl ProtocolState {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolState::Idle => "IDLE",
            ProtocolState::Active => "ACTIVE",
            ProtocolState::Waiting => "WAITING",
            ProtocolState::Done => "DONE",
        }
    }
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message {
    pub origin: NodeId,
    /// Raw time at which the message was produced
    pub timestamp: SimTime,
    pub kind: MessageKind,
}

impl Message {
    pub fn update(origin: NodeId, timestamp: SimTime) -> Self {
        Self {
            origin,
            timestamp,
            kind: MessageKind::Update,
        }
    }

    pub fn no_update(origin: NodeId, timestamp: SimTime) -> Self {
        Self {
            origin,
            timestamp,
            kind: MessageKind::NoUpdate,
        }
    }

    /// Last-writer-wins order. On equal timestamps the larger origin wins,
    /// so any two distinct markers are totally ordered.
    pub fn supersedes(&self, other: &Message) -> bool {
        self.timestamp > other.timestamp
            || (self.timestamp == other.timestamp && self.origin > other.origin)
    }
}

// ============================================================================
// Per-node Protocol
// ============================================================================

#[derive(Debug, Clone)]
pub struct FloodProtocol {
    node: NodeId,
    state: ProtocolState,
    history: NodeSet,
    message: Option<Message>,
    reached_at: Option<SimTime>,
    uptime_at_reach: Option<f64>,
    reached_round: u64,
    last_active: SimTime,
    duplicates: u64,
    contacts_initiated: u64,
    contacts_received: u64,
}

impl FloodProtocol {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            state: ProtocolState::Idle,
            history: NodeSet::new(),
            message: None,
            reached_at: None,
            uptime_at_reach: None,
            reached_round: 0,
            last_active: 0.0,
            duplicates: 0,
            contacts_initiated: 0,
            contacts_received: 0,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn history(&self) -> &NodeSet {
        &self.history
    }

    pub fn message(&self) -> Option<Message> {
        self.message
    }

    pub fn is_reached(&self) -> bool {
        self.reached_at.is_some()
    }

    /// Clock time (post burn-in) of the first reach
    pub fn reached_at(&self) -> Option<SimTime> {
        self.reached_at
    }

    /// Node uptime at the instant it was first reached
    pub fn uptime_at_reach(&self) -> Option<f64> {
        self.uptime_at_reach
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn contacts_initiated(&self) -> u64 {
        self.contacts_initiated
    }

    pub fn contacts_received(&self) -> u64 {
        self.contacts_received
    }

    fn reset(&mut self, message: Option<Message>, initial: Option<&NodeSet>) {
        self.history.clear();
        if let Some(initial) = initial {
            self.history.union_with(initial);
        }
        self.reached_at = None;
        self.uptime_at_reach = None;
        if message.is_some() {
            self.state = ProtocolState::Idle;
        }
        self.message = message;
    }

    fn mark_reached(&mut self, time: SimTime, raw: SimTime, uptime: f64, round: u64) -> bool {
        if self.reached_at.is_some() {
            self.duplicates += 1;
            return false;
        }
        self.reached_at = Some(time);
        self.uptime_at_reach = Some(uptime);
        self.reached_round = round;
        self.history.insert(self.node);
        if self.state != ProtocolState::Done {
            self.last_active = raw;
            self.state = ProtocolState::Active;
        }
        true
    }

    fn check_done(&mut self, graph: &IndexedNeighborGraph) {
        if self.state == ProtocolState::Done || !self.history.contains(self.node) {
            return;
        }
        if self.neighbors_covered(graph) {
            self.state = ProtocolState::Done;
        }
    }

    fn neighbors_covered(&self, graph: &IndexedNeighborGraph) -> bool {
        graph
            .neighbors(self.node)
            .iter()
            .all(|n| self.history.contains(*n))
    }
}

// ============================================================================
// Channel
// ============================================================================

/// What a channel operation may read and report to
pub struct Context<'a> {
    pub clock: &'a SimClock,
    pub network: &'a Network,
    pub sink: &'a mut dyn EventSink,
}

impl Context<'_> {
    fn log(&mut self, node: NodeId, event: Event) {
        self.sink
            .log(self.clock.raw_time(), self.clock.is_burning_in(), node, event);
    }
}

/// One message slot flooded over the whole network
#[derive(Debug)]
pub struct FloodChannel {
    kind: MessageKind,
    graph: Arc<IndexedNeighborGraph>,
    protocols: Vec<FloodProtocol>,
    selector: Box<dyn PeerSelector>,
    transformer: LiveTransformer,
    timeout: Option<SimTime>,
    round: u64,
    active: usize,
    done: usize,
    reached: usize,
    deliveries: Vec<(NodeId, Message)>,
    mapped: NodeSet,
}

impl FloodChannel {
    pub fn new(
        kind: MessageKind,
        graph: Arc<IndexedNeighborGraph>,
        selector: Box<dyn PeerSelector>,
        timeout: Option<SimTime>,
    ) -> Result<Self, SimError> {
        if let Some(t) = timeout {
            if !(t > 0.0) {
                return Err(SimError::InvalidTimeout(t));
            }
        }
        let protocols = (0..graph.size()).map(FloodProtocol::new).collect();
        Ok(Self {
            kind,
            graph,
            protocols,
            selector,
            transformer: LiveTransformer::new(),
            timeout,
            round: 0,
            active: 0,
            done: 0,
            reached: 0,
            deliveries: Vec::new(),
            mapped: NodeSet::new(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.protocols.len()
    }

    pub fn protocol(&self, node: NodeId) -> &FloodProtocol {
        &self.protocols[node]
    }

    pub fn protocols(&self) -> &[FloodProtocol] {
        &self.protocols
    }

    /// Protocols currently in the Active state
    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn done_count(&self) -> usize {
        self.done
    }

    pub fn reached_count(&self) -> usize {
        self.reached
    }

    pub fn all_reached(&self) -> bool {
        self.reached == self.protocols.len()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Live subgraphs materialized so far
    pub fn transformer_builds(&self) -> usize {
        self.transformer.builds()
    }

    /// First receptions since the last call, in delivery order
    pub fn take_deliveries(&mut self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.deliveries)
    }

    /// Opens a new round. Nodes reached from here on push starting next round.
    pub fn begin_round(&mut self) {
        self.round += 1;
    }

    fn check_node(&self, node: NodeId) -> Result<(), SimError> {
        if node >= self.protocols.len() {
            return Err(SimError::UnknownNode {
                node,
                size: self.protocols.len(),
            });
        }
        Ok(())
    }

    // Runs `f` on one protocol and keeps the aggregate counters in step with
    // whatever state change it made.
    fn track<R>(
        &mut self,
        node: NodeId,
        ctx: &mut Context<'_>,
        f: impl FnOnce(&mut FloodProtocol) -> R,
    ) -> R {
        let protocol = &mut self.protocols[node];
        let before = protocol.state;
        let was_reached = protocol.is_reached();
        let result = f(protocol);
        let after = protocol.state;
        let reached = protocol.is_reached();

        if before != after {
            if before == ProtocolState::Active {
                self.active -= 1;
            }
            if after == ProtocolState::Active {
                self.active += 1;
            }
            if before == ProtocolState::Done {
                self.done -= 1;
            }
            if after == ProtocolState::Done {
                self.done += 1;
            }
            ctx.log(
                node,
                Event::StateChange {
                    kind: self.kind,
                    from_state: before.name(),
                    to_state: after.name(),
                },
            );
        }
        match (was_reached, reached) {
            (false, true) => self.reached += 1,
            (true, false) => self.reached -= 1,
            _ => {}
        }
        result
    }

    /// Binds `node` to `message`, replacing history with `initial`
    pub fn set_message(
        &mut self,
        node: NodeId,
        message: Option<Message>,
        initial: Option<&NodeSet>,
        ctx: &mut Context<'_>,
    ) -> Result<(), SimError> {
        self.check_node(node)?;
        self.track(node, ctx, |p| p.reset(message, initial));
        Ok(())
    }

    /// Records that `node` holds the message. Returns true on first reach;
    /// later calls only count a duplicate.
    pub fn mark_reached(
        &mut self,
        node: NodeId,
        sender: NodeId,
        flags: MessageFlags,
        ctx: &mut Context<'_>,
    ) -> Result<bool, SimError> {
        self.check_node(node)?;
        let uptime = ctx.network.process(node).uptime(ctx.clock);
        let time = ctx.clock.time();
        let raw = ctx.clock.raw_time();
        let round = self.round;

        let first = self.track(node, ctx, |p| p.mark_reached(time, raw, uptime, round));
        if first {
            if let Some(message) = self.protocols[node].message {
                self.deliveries.push((node, message));
            }
        }
        // duplicate anti-entropy deliveries are an artefact of the exchange
        if first || !flags.is_antientropy() {
            let flags = if first { flags } else { flags | MessageFlags::DUPLICATE };
            ctx.log(
                node,
                Event::MessageReceived {
                    sender,
                    kind: self.kind,
                    flags,
                },
            );
        }
        Ok(first)
    }

    /// Halts dissemination at `node`
    pub fn stop(&mut self, node: NodeId, ctx: &mut Context<'_>) -> Result<(), SimError> {
        self.check_node(node)?;
        self.track(node, ctx, |p| p.state = ProtocolState::Done);
        Ok(())
    }

    /// Starts flooding `message` from `source`. Every node is bound to the
    /// message; only the source is reached.
    pub fn publish(
        &mut self,
        source: NodeId,
        message: Message,
        ctx: &mut Context<'_>,
    ) -> Result<(), SimError> {
        self.check_node(source)?;
        if self.reached > 0 && !self.all_reached() {
            return Err(SimError::Invariant(
                "only one update can be in flight at a time".into(),
            ));
        }
        for node in 0..self.protocols.len() {
            self.track(node, ctx, |p| p.reset(Some(message), None));
        }
        self.mark_reached(source, source, MessageFlags::NO_MESSAGE, ctx)?;
        Ok(())
    }

    /// Posts a locally produced marker at `node`. It replaces the held one
    /// only if it supersedes it.
    pub fn post(
        &mut self,
        node: NodeId,
        message: Message,
        ctx: &mut Context<'_>,
    ) -> Result<bool, SimError> {
        self.check_node(node)?;
        let replaces = self.protocols[node]
            .message
            .map_or(true, |held| message.supersedes(&held));
        if replaces {
            self.set_message(node, Some(message), None, ctx)?;
        }
        self.mark_reached(node, node, MessageFlags::NO_MESSAGE, ctx)?;
        Ok(replaces)
    }

    /// Executes one round of the protocol at `node`
    pub fn next_cycle(&mut self, node: NodeId, ctx: &mut Context<'_>) -> Result<(), SimError> {
        self.check_node(node)?;
        let protocol = &self.protocols[node];
        if protocol.state == ProtocolState::Done
            || !ctx.network.is_up(node)
            || !protocol.is_reached()
            || protocol.reached_round == self.round
        {
            return Ok(());
        }

        let raw = ctx.clock.raw_time();
        if let Some(timeout) = self.timeout {
            if raw - protocol.last_active > timeout {
                self.track(node, ctx, |p| p.state = ProtocolState::Done);
                self.spread_history(node, ctx);
                return Ok(());
            }
        }

        match self.select_peer(node, ctx.network)? {
            PeerSelection::Peer(peer) => {
                self.track(node, ctx, |p| {
                    p.state = ProtocolState::Active;
                    p.last_active = raw;
                    p.contacts_initiated += 1;
                });
                self.protocols[peer].contacts_received += 1;
                trace!("{:?} push {} -> {} at {}", self.kind, node, peer, raw);
                self.send(node, peer, MessageFlags::NONE, ctx)?;
            }
            PeerSelection::NoLivePeer => {
                self.track(node, ctx, |p| p.state = ProtocolState::Waiting);
            }
            PeerSelection::NoPeer => {
                let graph = Arc::clone(&self.graph);
                self.track(node, ctx, |p| {
                    p.state = if p.neighbors_covered(&graph) {
                        ProtocolState::Done
                    } else {
                        ProtocolState::Waiting
                    };
                });
                self.spread_history(node, ctx);
            }
        }
        Ok(())
    }

    /// Anti-entropy contact from `initiator` to a random live neighbor. The
    /// side holding the message pushes or pulls it; a digest is exchanged
    /// either way.
    pub fn antientropy(
        &mut self,
        initiator: NodeId,
        rng: &mut dyn RngCore,
        ctx: &mut Context<'_>,
    ) -> Result<(), SimError> {
        self.check_node(initiator)?;
        if !ctx.network.is_up(initiator) {
            return Err(SimError::Invariant(format!(
                "anti-entropy initiated by down node {}",
                initiator
            )));
        }
        let live: Vec<NodeId> = self
            .graph
            .neighbors(initiator)
            .iter()
            .copied()
            .filter(|n| ctx.network.is_up(*n))
            .collect();
        let Some(&responder) = live.choose(rng) else {
            return Ok(());
        };

        ctx.log(responder, Event::DigestExchanged { sender: initiator });
        let has_initiator = self.protocols[initiator].is_reached();
        let has_responder = self.protocols[responder].is_reached();
        match (has_initiator, has_responder) {
            (true, false) => self.send(initiator, responder, MessageFlags::ANTIENTROPY_PUSH, ctx),
            (false, true) => self.send(responder, initiator, MessageFlags::ANTIENTROPY_PULL, ctx),
            _ => Ok(()),
        }
    }

    fn select_peer(&mut self, node: NodeId, network: &Network) -> Result<PeerSelection, SimError> {
        let history = &self.protocols[node].history;
        match self.transformer.live(&self.graph, network) {
            LiveView::NoLiveNodes => Ok(PeerSelection::NoLivePeer),
            LiveView::Identity => self.selector.select(node, &self.graph, history, network),
            LiveView::Remapped(live) => {
                let mapped_node = live.mapper.try_map(node).ok_or_else(|| {
                    SimError::Invariant(format!("node {} selecting while down", node))
                })?;
                self.mapped.clear();
                for id in history.iter() {
                    if let Some(mapped) = live.mapper.try_map(id) {
                        self.mapped.insert(mapped);
                    }
                }
                let all = AllLive {
                    size: live.mapper.len(),
                };
                let selection = self
                    .selector
                    .select(mapped_node, &live.graph, &self.mapped, &all)?;
                Ok(selection.map(|id| live.mapper.reverse_map(id)))
            }
        }
    }

    fn send(
        &mut self,
        from: NodeId,
        to: NodeId,
        flags: MessageFlags,
        ctx: &mut Context<'_>,
    ) -> Result<(), SimError> {
        let carried = self.protocols[from].message;
        let history = self.protocols[from].history.clone();
        let graph = Arc::clone(&self.graph);

        if self.kind == MessageKind::NoUpdate {
            if let Some(carried) = carried {
                let held = self.protocols[to].message;
                if held.map_or(true, |held| carried.supersedes(&held)) {
                    self.set_message(to, Some(carried), Some(&history), ctx)?;
                } else if held != Some(carried) {
                    // receiver knows something newer: nothing to merge
                    self.mark_reached(to, from, flags, ctx)?;
                    self.track(from, ctx, |s| {
                        s.history.insert(to);
                        s.check_done(&graph);
                    });
                    self.spread_history(from, ctx);
                    return Ok(());
                }
            }
        }

        self.mark_reached(to, from, flags, ctx)?;
        let back = self.track(to, ctx, |r| {
            r.history.union_with(&history);
            r.check_done(&graph);
            r.history.clone()
        });
        self.track(from, ctx, |s| {
            s.history.union_with(&back);
            s.check_done(&graph);
        });
        self.spread_history(to, ctx);
        self.spread_history(from, ctx);
        Ok(())
    }

    // Done nodes pass their history on to live, reached neighbors bound to
    // the same message. Every hop strictly grows a history, so it settles.
    fn spread_history(&mut self, start: NodeId, ctx: &mut Context<'_>) {
        let graph = Arc::clone(&self.graph);
        let mut pending = vec![start];
        while let Some(node) = pending.pop() {
            let protocol = &self.protocols[node];
            if protocol.state != ProtocolState::Done || !ctx.network.is_up(node) {
                continue;
            }
            let history = protocol.history.clone();
            let message = protocol.message;
            for &peer in graph.neighbors(node) {
                let neighbor = &self.protocols[peer];
                if !ctx.network.is_up(peer)
                    || !neighbor.is_reached()
                    || neighbor.message != message
                    || neighbor.history.is_superset(&history)
                {
                    continue;
                }
                self.track(peer, ctx, |p| {
                    p.history.union_with(&history);
                    p.check_done(&graph);
                });
                pending.push(peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg_interface::{NoOpSink, State};
    use crate::cg_process::{FixedProcess, Process};
    use crate::cg_selectors::SelectorKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(graph: &Arc<IndexedNeighborGraph>, down: &[NodeId]) -> Network {
        let processes = (0..graph.size())
            .map(|i| {
                let state = if down.contains(&i) { State::Down } else { State::Up };
                Process::Fixed(FixedProcess::new(i, state))
            })
            .collect();
        Network::new(Arc::clone(graph), processes).unwrap()
    }

    fn channel(kind: MessageKind, graph: &Arc<IndexedNeighborGraph>, timeout: Option<f64>) -> FloodChannel {
        FloodChannel::new(kind, Arc::clone(graph), SelectorKind::Random.build(42), timeout).unwrap()
    }

    #[derive(Default)]
    struct Received(Vec<(NodeId, NodeId, MessageFlags)>);

    impl EventSink for Received {
        fn log(&mut self, _raw: SimTime, _burning_in: bool, node: NodeId, event: Event) {
            if let Event::MessageReceived { sender, flags, .. } = event {
                self.0.push((node, sender, flags));
            }
        }
    }

    fn run_round(channel: &mut FloodChannel, clock: &SimClock, network: &Network) {
        let mut sink = NoOpSink;
        let mut ctx = Context { clock, network, sink: &mut sink };
        channel.begin_round();
        for node in 0..channel.size() {
            channel.next_cycle(node, &mut ctx).unwrap();
        }
    }

    #[test]
    fn test_mark_reached_is_idempotent() {
        let graph = Arc::new(IndexedNeighborGraph::line(3));
        let network = network(&graph, &[]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let mut clock = SimClock::new(0.0);
        let mut sink = Received::default();

        clock.advance(2.0).unwrap();
        {
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            flood.publish(0, Message::update(0, 2.0), &mut ctx).unwrap();
            assert!(flood.mark_reached(1, 0, MessageFlags::NONE, &mut ctx).unwrap());
        }
        clock.advance(5.0).unwrap();
        {
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            assert!(!flood.mark_reached(1, 2, MessageFlags::NONE, &mut ctx).unwrap());
            assert!(!flood.mark_reached(1, 2, MessageFlags::ANTIENTROPY_PUSH, &mut ctx).unwrap());
        }

        let p = flood.protocol(1);
        assert_eq!(p.reached_at(), Some(2.0));
        assert_eq!(p.uptime_at_reach(), Some(2.0));
        assert_eq!(p.duplicates(), 2);
        assert_eq!(flood.reached_count(), 2);
        // duplicate anti-entropy delivery not reported
        assert_eq!(sink.0.len(), 3);
        assert_eq!(sink.0[2], (1, 2, MessageFlags::DUPLICATE));
    }

    #[test]
    fn test_line_floods_one_hop_per_round() {
        let graph = Arc::new(IndexedNeighborGraph::line(5));
        let network = network(&graph, &[]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let mut clock = SimClock::new(0.0);
        {
            let mut sink = NoOpSink;
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
        }

        for round in 0..4 {
            clock.advance(round as f64).unwrap();
            run_round(&mut flood, &clock, &network);
        }

        let reached: Vec<_> = flood.protocols().iter().map(|p| p.reached_at()).collect();
        assert_eq!(reached, vec![Some(0.0), Some(0.0), Some(1.0), Some(2.0), Some(3.0)]);
        assert!(flood.all_reached());
        assert_eq!(flood.done_count(), 5);
        assert_eq!(flood.active_count(), 0);
        assert!(flood.protocols().iter().all(|p| p.history().len() == 5));
        assert_eq!(flood.protocol(0).contacts_initiated(), 1);
        assert_eq!(flood.protocol(4).contacts_received(), 1);
    }

    #[test]
    fn test_complete_graph_terminates_with_full_history() {
        let graph = Arc::new(IndexedNeighborGraph::complete(12));
        let network = network(&graph, &[]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let mut clock = SimClock::new(0.0);
        {
            let mut sink = NoOpSink;
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            flood.publish(3, Message::update(3, 0.0), &mut ctx).unwrap();
        }

        let mut rounds = 0;
        while flood.active_count() > 0 {
            clock.advance(rounds as f64).unwrap();
            run_round(&mut flood, &clock, &network);
            rounds += 1;
            assert!(rounds < 100, "flood did not terminate");
        }
        assert!(flood.all_reached());
        for p in flood.protocols() {
            assert_eq!(p.state(), ProtocolState::Done);
            assert!(p.history().contains(p.node()));
            assert!(graph.neighbors(p.node()).iter().all(|n| p.history().contains(*n)));
        }
    }

    #[test]
    fn test_histories_converge_on_connected_graphs() {
        let mut edges: Vec<(NodeId, NodeId)> = (0..15).map(|i| (i, i + 1)).collect();
        edges.extend([(0, 8), (3, 12), (5, 6)]);
        let graphs = [
            IndexedNeighborGraph::line(5),
            IndexedNeighborGraph::ring(9),
            IndexedNeighborGraph::from_edges(16, &edges).unwrap(),
        ];
        for graph in graphs {
            let graph = Arc::new(graph);
            let size = graph.size();
            for kind in [SelectorKind::Random, SelectorKind::AntiCentrality] {
                let network = network(&graph, &[]);
                let mut flood =
                    FloodChannel::new(MessageKind::Update, Arc::clone(&graph), kind.build(7), None).unwrap();
                let mut clock = SimClock::new(0.0);
                {
                    let mut sink = NoOpSink;
                    let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
                    flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
                }
                let mut rounds = 0;
                while flood.active_count() > 0 {
                    clock.advance(rounds as f64).unwrap();
                    run_round(&mut flood, &clock, &network);
                    rounds += 1;
                    assert!(rounds < 200, "flood did not terminate");
                }
                assert_eq!(flood.done_count(), size);
                for p in flood.protocols() {
                    assert_eq!(p.history().len(), size, "node {} history incomplete", p.node());
                }
            }
        }
    }

    #[test]
    fn test_waits_behind_down_neighbor() {
        let graph = Arc::new(IndexedNeighborGraph::line(3));
        let network = network(&graph, &[1]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let clock = SimClock::new(0.0);
        {
            let mut sink = NoOpSink;
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
        }
        run_round(&mut flood, &clock, &network);
        assert_eq!(flood.protocol(0).state(), ProtocolState::Waiting);
        assert_eq!(flood.active_count(), 0);
        assert_eq!(flood.transformer_builds(), 1);
    }

    #[test]
    fn test_timeout_ends_waiting() {
        let graph = Arc::new(IndexedNeighborGraph::line(3));
        let network = network(&graph, &[1]);
        let mut flood = channel(MessageKind::Update, &graph, Some(0.5));
        let mut clock = SimClock::new(0.0);
        {
            let mut sink = NoOpSink;
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
        }
        run_round(&mut flood, &clock, &network);
        clock.advance(1.0).unwrap();
        run_round(&mut flood, &clock, &network);
        assert_eq!(flood.protocol(0).state(), ProtocolState::Done);
        assert!(matches!(
            FloodChannel::new(MessageKind::Update, graph, SelectorKind::Random.build(1), Some(0.0)),
            Err(SimError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_nup_supersedes_last_writer_wins() {
        let newer = Message::no_update(1, 5.0);
        let older = Message::no_update(7, 3.0);
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));

        let low = Message::no_update(2, 4.0);
        let high = Message::no_update(6, 4.0);
        assert!(high.supersedes(&low));
        assert!(!low.supersedes(&high));
        assert!(!high.supersedes(&high));
    }

    #[test]
    fn test_nup_channel_replaces_older_marker() {
        let graph = Arc::new(IndexedNeighborGraph::line(2));
        let network = network(&graph, &[]);
        let mut nup = channel(MessageKind::NoUpdate, &graph, None);
        let mut clock = SimClock::new(0.0);
        clock.advance(5.0).unwrap();
        {
            let mut sink = NoOpSink;
            let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
            assert!(nup.post(1, Message::no_update(1, 3.0), &mut ctx).unwrap());
            assert!(nup.post(0, Message::no_update(0, 5.0), &mut ctx).unwrap());
            // older post does not replace
            assert!(!nup.post(0, Message::no_update(0, 4.0), &mut ctx).unwrap());
        }
        run_round(&mut nup, &clock, &network);

        assert_eq!(nup.protocol(1).message(), Some(Message::no_update(0, 5.0)));
        assert!(nup.protocol(1).history().contains(0));
        assert_eq!(nup.protocol(0).state(), ProtocolState::Done);
        let deliveries = nup.take_deliveries();
        assert_eq!(deliveries.last(), Some(&(1, Message::no_update(0, 5.0))));
        assert!(nup.take_deliveries().is_empty());
    }

    #[test]
    fn test_antientropy_pulls_from_holder() {
        let graph = Arc::new(IndexedNeighborGraph::line(2));
        let network = network(&graph, &[]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let clock = SimClock::new(0.0);
        let mut rng = StdRng::seed_from_u64(42);
        let mut sink = Received::default();
        let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };

        flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
        flood.antientropy(1, &mut rng, &mut ctx).unwrap();
        assert!(flood.protocol(1).is_reached());
        assert_eq!(sink.0.last(), Some(&(1, 0, MessageFlags::ANTIENTROPY_PULL)));
    }

    #[test]
    fn test_publish_rejects_concurrent_update() {
        let graph = Arc::new(IndexedNeighborGraph::line(3));
        let network = network(&graph, &[]);
        let mut flood = channel(MessageKind::Update, &graph, None);
        let clock = SimClock::new(0.0);
        let mut sink = NoOpSink;
        let mut ctx = Context { clock: &clock, network: &network, sink: &mut sink };
        flood.publish(0, Message::update(0, 0.0), &mut ctx).unwrap();
        assert!(matches!(
            flood.publish(2, Message::update(2, 0.0), &mut ctx),
            Err(SimError::Invariant(_))
        ));
    }
}
