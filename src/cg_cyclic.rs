//! Cycle drivers
//!
//! [`PausingCyclicRunner`] fires protocol rounds at multiples of a fixed
//! period, pausing when nothing is active and resuming when a node logs in.
//! Two cycles are always at least one period apart, so every hop costs a
//! full period.
//! [`PeriodicAction`] performs a timed action at one node, but only while
//! that node is online.
//!
//! Both are components of an engine observer: they schedule timers owned by
//! it and get called back through its `timer_fired`.

use crate::cg_engine::{CancelToken, ObserverId, SimulationEngine};
use crate::cg_error::SimError;
use crate::cg_interface::{
    NetworkChange, NodeId, SimTime, CYCLE_SCHEDULABLE_TYPE, PERIODIC_SCHEDULABLE_TYPE,
};
use log::{debug, warn};

// ============================================================================
// Pausing Cyclic Runner
// ============================================================================

#[derive(Debug)]
pub struct PausingCyclicRunner {
    period: SimTime,
    tag: u64,
    paused: bool,
    pending: Option<CancelToken>,
    cycles: u64,
    last_cycle: Option<SimTime>,
}

impl PausingCyclicRunner {
    /// Creates a paused runner. `tag` identifies its timers to the owner.
    pub fn new(period: SimTime, tag: u64) -> Result<Self, SimError> {
        if !(period > 0.0 && period.is_finite()) {
            return Err(SimError::InvalidConfig(format!("cycle period {}", period)));
        }
        Ok(Self {
            period,
            tag,
            paused: true,
            pending: None,
            cycles: 0,
            last_cycle: None,
        })
    }

    pub fn period(&self) -> SimTime {
        self.period
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Cycles executed so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_cycle(&self) -> Option<SimTime> {
        self.last_cycle
    }

    /// Schedules the next cycle at the first period boundary strictly after
    /// now, and no sooner than a period after the last cycle. No-op when
    /// already running.
    pub fn resume(&mut self, engine: &mut SimulationEngine, owner: ObserverId) -> Result<(), SimError> {
        if !self.paused {
            return Ok(());
        }
        self.paused = false;
        let now = engine.clock().raw_time();
        let mut at = ((now / self.period).floor() + 1.0) * self.period;
        if let Some(last) = self.last_cycle {
            at = at.max(last + self.period);
        }
        debug!("cyclic runner resumed at {}, next cycle at {}", now, at);
        self.pending = Some(engine.schedule_timer(owner, CYCLE_SCHEDULABLE_TYPE, at, self.tag)?);
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    /// Wakes the runner on logins
    pub fn on_network_change(
        &mut self,
        engine: &mut SimulationEngine,
        owner: ObserverId,
        change: &NetworkChange,
    ) -> Result<(), SimError> {
        if change.state.is_up() {
            self.resume(engine, owner)?;
        }
        Ok(())
    }

    /// To be called once a cycle has run. Pauses when `active == 0`,
    /// otherwise schedules the next cycle one period later.
    pub fn cycle_done(
        &mut self,
        engine: &mut SimulationEngine,
        owner: ObserverId,
        active: usize,
    ) -> Result<(), SimError> {
        self.cycles += 1;
        self.pending = None;
        self.last_cycle = Some(engine.clock().raw_time());
        if self.paused {
            return Ok(());
        }
        if active == 0 {
            debug!("cyclic runner paused at {}", engine.clock().raw_time());
            self.pause();
            return Ok(());
        }
        let at = engine.clock().raw_time() + self.period;
        self.pending = Some(engine.schedule_timer(owner, CYCLE_SCHEDULABLE_TYPE, at, self.tag)?);
        Ok(())
    }
}

// ============================================================================
// Periodic Action
// ============================================================================

/// Offset separating actions that would otherwise fire at the same instant
pub const TIEBREAK_DELTA: f64 = 1.0 / 3.6e9;

/// Timer of a per-node action that runs only while the node is online.
///
/// If the timer expires while the node is offline, the action runs right
/// after the next login (after `grace`, plus the tie-break penalty).
#[derive(Debug)]
pub struct PeriodicAction {
    node: NodeId,
    priority: u32,
    tag: u64,
    grace: SimTime,
    next_access: SimTime,
    pending: Option<(SimTime, CancelToken)>,
}

impl PeriodicAction {
    pub fn new(node: NodeId, priority: u32, initial: SimTime, grace: SimTime, tag: u64) -> Self {
        let mut action = Self {
            node,
            priority,
            tag,
            grace,
            next_access: 0.0,
            pending: None,
        };
        action.next_access = initial + action.penalty();
        action
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn next_access(&self) -> SimTime {
        self.next_access
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending
            .as_ref()
            .map_or(false, |(_, token)| !token.is_cancelled())
    }

    pub fn penalty(&self) -> SimTime {
        self.priority as f64 * TIEBREAK_DELTA
    }

    // the next access falls within the current session
    fn should_access(&self, engine: &SimulationEngine) -> bool {
        self.next_access < engine.network().process(self.node).next_event()
    }

    fn schedule(&mut self, engine: &mut SimulationEngine, owner: ObserverId) -> Result<(), SimError> {
        let token = engine.schedule_timer(owner, PERIODIC_SCHEDULABLE_TYPE, self.next_access, self.tag)?;
        self.pending = Some((self.next_access, token));
        Ok(())
    }

    /// Reacts to a login of this action's node: nudges an expired timer
    /// and schedules it if it falls within the new session.
    pub fn on_login(
        &mut self,
        engine: &mut SimulationEngine,
        owner: ObserverId,
        next_shift: SimTime,
    ) -> Result<(), SimError> {
        let now = engine.clock().raw_time();
        if self.next_access < now {
            let target = now + self.grace + self.penalty();
            if next_shift > target {
                self.next_access = target;
            } else {
                warn!(
                    "node {}: nudge to {} aborted, session ends at {}",
                    self.node, target, next_shift
                );
            }
        }
        if !self.is_scheduled() && self.next_access >= now && self.should_access(engine) {
            self.schedule(engine, owner)?;
        }
        Ok(())
    }

    pub fn on_network_change(
        &mut self,
        engine: &mut SimulationEngine,
        owner: ObserverId,
        change: &NetworkChange,
    ) -> Result<(), SimError> {
        if change.node != self.node || !change.state.is_up() {
            return Ok(());
        }
        self.on_login(engine, owner, change.next_shift)
    }

    /// Must be called when this action's timer fires, before the action runs
    pub fn fired(&mut self, engine: &SimulationEngine) -> Result<(), SimError> {
        self.pending = None;
        if !engine.network().process(self.node).is_up() {
            return Err(SimError::Invariant(format!(
                "periodic action fired at down node {}",
                self.node
            )));
        }
        Ok(())
    }

    /// Moves the next access to `time`. Only valid while the node is up.
    pub fn new_timer(
        &mut self,
        engine: &mut SimulationEngine,
        owner: ObserverId,
        time: SimTime,
    ) -> Result<(), SimError> {
        if !engine.network().process(self.node).is_up() {
            return Err(SimError::Invariant(format!(
                "timer changed for offline node {}",
                self.node
            )));
        }
        self.next_access = time;

        if self.is_scheduled() {
            if !self.should_access(engine) {
                // quench: next access lies beyond this session
                if let Some((_, token)) = self.pending.take() {
                    token.cancel();
                }
            } else if self.pending.as_ref().map_or(false, |(at, _)| *at != time) {
                if let Some((_, token)) = self.pending.take() {
                    token.cancel();
                }
                self.schedule(engine, owner)?;
            }
        } else if self.should_access(engine) {
            self.schedule(engine, owner)?;
        }
        Ok(())
    }
}
