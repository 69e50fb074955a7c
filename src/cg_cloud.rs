//! Cloud-assisted dissemination
//!
//! Besides flooding, every node periodically polls a central store. A poll
//! that finds the update delivers it directly; an empty poll produces a
//! "no update" marker (NUP) that the node floods to tell its neighbors the
//! store was just checked. Hearing a fresh NUP postpones the node's own
//! next poll.

use crate::cg_cyclic::PeriodicAction;
use crate::cg_dissemination::Message;
use crate::cg_error::SimError;
use crate::cg_interface::{NodeId, SimTime};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Cloud polling parameters. Times share the unit of the churn model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Mean interval a node waits without news before polling
    pub period: f64,

    /// Fraction of the period that is not randomized
    pub fixed_fraction: f64,

    /// Delay applied to polls that expired while the node was offline
    pub login_grace: f64,

    /// Offset of the first poll from the end of burn-in
    pub initial_delay: f64,

    /// Draw the randomized part uniformly; when false it is always maximal
    pub randomize: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            period: 24.0,
            fixed_fraction: 0.5,
            login_grace: 0.0,
            initial_delay: 0.0,
            randomize: true,
        }
    }
}

impl CloudConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.period > 0.0 && self.period.is_finite()) {
            return Err(SimError::InvalidConfig(format!("cloud period {}", self.period)));
        }
        if !(0.0..=1.0).contains(&self.fixed_fraction) {
            return Err(SimError::InvalidConfig(format!(
                "cloud fixed fraction {}",
                self.fixed_fraction
            )));
        }
        if !(self.login_grace >= 0.0) || !(self.initial_delay >= 0.0) {
            return Err(SimError::InvalidConfig("negative cloud delay".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Cloud Store
// ============================================================================

/// Central store holding at most one published update
#[derive(Debug, Clone, Default)]
pub struct Cloud {
    update: Option<Message>,
}

impl Cloud {
    pub fn publish(&mut self, update: Message) {
        self.update = Some(update);
    }

    pub fn update(&self) -> Option<Message> {
        self.update
    }

    pub fn has_update(&self) -> bool {
        self.update.is_some()
    }
}

// ============================================================================
// Accessor
// ============================================================================

/// Per-node polling timer: `last_heard + psi + U * alpha`
#[derive(Debug)]
pub struct CloudAccessor {
    action: PeriodicAction,
    psi: f64,
    alpha: f64,
    randomize: bool,
    last_heard: SimTime,
    accesses: u64,
}

impl CloudAccessor {
    pub fn new(node: NodeId, priority: u32, config: &CloudConfig, burnin: SimTime, tag: u64) -> Self {
        Self {
            action: PeriodicAction::new(
                node,
                priority,
                burnin + config.initial_delay,
                config.login_grace,
                tag,
            ),
            psi: config.period * config.fixed_fraction,
            alpha: config.period * (1.0 - config.fixed_fraction),
            randomize: config.randomize,
            last_heard: 0.0,
            accesses: 0,
        }
    }

    pub fn action(&self) -> &PeriodicAction {
        &self.action
    }

    pub fn action_mut(&mut self) -> &mut PeriodicAction {
        &mut self.action
    }

    pub fn last_heard(&self) -> SimTime {
        self.last_heard
    }

    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    fn timer_from(&mut self, last_heard: SimTime, rng: &mut dyn RngCore) -> SimTime {
        let u = if self.randomize { rng.gen::<f64>() } else { 1.0 };
        self.last_heard = last_heard;
        last_heard + self.psi + u * self.alpha + self.action.penalty()
    }

    /// Records a poll at `now` and returns the time of the next one
    pub fn on_access(&mut self, now: SimTime, rng: &mut dyn RngCore) -> SimTime {
        self.accesses += 1;
        self.timer_from(now, rng)
    }

    /// Reacts to a first reception of a NUP. Returns the postponed poll
    /// time, or `None` when the marker is older than what the node knows.
    pub fn on_nup(&mut self, nup: &Message, now: SimTime, rng: &mut dyn RngCore) -> Option<SimTime> {
        if nup.timestamp < self.last_heard {
            return None;
        }
        Some(self.timer_from(now, rng))
    }
}
