// all node ids index dense vectors: a graph of n vertices uses 0..n
pub type NodeId = usize;

/// Simulated time. Has no relation to wall-clock time.
pub type SimTime = f64;

/// Tag used to order ties in the event queue and to filter which observers
/// get notified of a dispatch.
pub type SchedulableType = u32;

// ============================================================================
// Schedulable Types
// ============================================================================

/// Churn transitions of renewal processes
pub const PROCESS_SCHEDULABLE_TYPE: SchedulableType = 0;

/// Rounds of the pausing cyclic runner
pub const CYCLE_SCHEDULABLE_TYPE: SchedulableType = 1;

/// End of burn-in, start of measurements
pub const START_SCHEDULABLE_TYPE: SchedulableType = 2;

pub const ANCHOR_SCHEDULABLE_TYPE: SchedulableType = 3;

/// Per-node periodic actions (cloud accesses). Sorts last among ties.
pub const PERIODIC_SCHEDULABLE_TYPE: SchedulableType = SchedulableType::MAX;

// ============================================================================
// Availability
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Up,
    Down,
}

impl State {
    pub fn is_up(&self) -> bool {
        matches!(self, State::Up)
    }

    pub fn flip(&self) -> State {
        match self {
            State::Up => State::Down,
            State::Down => State::Up,
        }
    }
}

/// Typed notification posted by the churn model whenever a process changes
/// availability. Consumers react to it instead of polling the network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkChange {
    pub node: NodeId,
    pub state: State,
    /// Raw clock time of the transition
    pub time: SimTime,
    /// Raw time of the next transition of the same process
    pub next_shift: SimTime,
}

// ============================================================================
// Peer Selection Outcome
// ============================================================================

/// Outcome of a peer selection. The two "no" variants are normal protocol
/// states, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelection {
    /// Neighbor to contact
    Peer(NodeId),
    /// Eligible neighbors exist but none of them is currently up
    NoLivePeer,
    /// No eligible neighbor at all
    NoPeer,
}

impl PeerSelection {
    pub fn peer(&self) -> Option<NodeId> {
        match self {
            PeerSelection::Peer(id) => Some(*id),
            _ => None,
        }
    }

    /// Maps a selected id through `f`, keeping the no-peer variants.
    pub fn map(self, f: impl FnOnce(NodeId) -> NodeId) -> PeerSelection {
        match self {
            PeerSelection::Peer(id) => PeerSelection::Peer(f(id)),
            other => other,
        }
    }
}

// ============================================================================
// Message Flags
// ============================================================================

/// Flags describing how a message reached a protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    /// Receiver already had the message
    pub const DUPLICATE: MessageFlags = MessageFlags(1);
    pub const ANTIENTROPY_PUSH: MessageFlags = MessageFlags(2);
    pub const ANTIENTROPY_PULL: MessageFlags = MessageFlags(4);
    /// Reached by means other than the P2P network (source, cloud)
    pub const NO_MESSAGE: MessageFlags = MessageFlags(8);

    pub fn contains(&self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | other.0)
    }

    pub fn is_antientropy(&self) -> bool {
        self.0 & (Self::ANTIENTROPY_PUSH.0 | Self::ANTIENTROPY_PULL.0) != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        self.with(rhs)
    }
}

/// Which message slot an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Update,
    /// Timestamp-only "no update" marker
    NoUpdate,
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by the dissemination layer for statistics and debugging
#[derive(Debug, Clone)]
pub enum Event {
    /// A protocol instance received a message from `sender`
    MessageReceived {
        sender: NodeId,
        kind: MessageKind,
        flags: MessageFlags,
    },
    /// Anti-entropy exchange with nothing to transfer
    DigestExchanged { sender: NodeId },
    /// Protocol state change
    StateChange {
        kind: MessageKind,
        from_state: &'static str,
        to_state: &'static str,
    },
    /// Node polled the cloud
    CloudAccess { productive: bool },
}

/// Trait for consuming events from the dissemination layer
pub trait EventSink {
    /// `raw_time` is the raw clock, `burning_in` tells whether the event
    /// happened before the measurement window opened.
    fn log(&mut self, raw_time: SimTime, burning_in: bool, node: NodeId, event: Event);
}

/// No-op event sink
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _raw_time: SimTime, _burning_in: bool, _node: NodeId, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_compose() {
        let flags = MessageFlags::ANTIENTROPY_PULL | MessageFlags::DUPLICATE;
        assert!(flags.contains(MessageFlags::DUPLICATE));
        assert!(flags.is_antientropy());
        assert!(!flags.contains(MessageFlags::NO_MESSAGE));
        assert!(!MessageFlags::NO_MESSAGE.is_antientropy());
    }

    #[test]
    fn test_selection_map_keeps_reasons() {
        assert_eq!(PeerSelection::Peer(2).map(|i| i + 10), PeerSelection::Peer(12));
        assert_eq!(PeerSelection::NoPeer.map(|i| i + 10), PeerSelection::NoPeer);
        assert_eq!(PeerSelection::NoLivePeer.peer(), None);
    }
}
