// Event sink printing protocol events of a traced run

use cg_rust::cg_interface::MessageFlags;
use cg_rust::{Event, EventSink, NodeId, SimTime};
use log::info;

/// Logs every event after burn-in, one line each
#[derive(Debug, Default)]
pub struct LoggingEventSink {
    /// Also log state changes
    pub verbose: bool,
}

impl LoggingEventSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for LoggingEventSink {
    fn log(&mut self, raw_time: SimTime, burning_in: bool, node: NodeId, event: Event) {
        if burning_in {
            return;
        }
        match event {
            Event::MessageReceived { sender, kind, flags } => {
                let tag = if flags.contains(MessageFlags::NO_MESSAGE) {
                    " (local)"
                } else if flags.contains(MessageFlags::DUPLICATE) {
                    " (duplicate)"
                } else if flags.is_antientropy() {
                    " (anti-entropy)"
                } else {
                    ""
                };
                info!("[{:>10.4}] {:?} {} -> {}{}", raw_time, kind, sender, node, tag);
            }
            Event::DigestExchanged { sender } => {
                info!("[{:>10.4}] digest {} <-> {}", raw_time, sender, node);
            }
            Event::CloudAccess { productive } => {
                info!(
                    "[{:>10.4}] cloud access by {}{}",
                    raw_time,
                    node,
                    if productive { " fetched the update" } else { "" }
                );
            }
            Event::StateChange { kind, from_state, to_state } => {
                if self.verbose {
                    info!("[{:>10.4}] {:?} {}: {} -> {}", raw_time, kind, node, from_state, to_state);
                }
            }
        }
    }
}
