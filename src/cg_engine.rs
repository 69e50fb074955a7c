//! Discrete-event simulation engine
//!
//! ## Dispatch Loop
//!
//! The engine keeps a min-heap of [`Schedulable`]s ordered by
//! (time, insertion sequence, type). Each step pops the earliest entry,
//! skips it if expired, advances the clock, dispatches it, and then, unless
//! the run is still burning in, notifies every bound observer whose type
//! filter matches, in binding order.
//!
//! ## Termination
//!
//! Every *binding* observer contributes one stop permit, plus any extra
//! permits configured on the builder. A binding observer that reports
//! `is_done()` is unbound and its permit consumed; `stop(n)` consumes `n`
//! permits explicitly. The run ends when permits reach zero or the queue
//! drains. An [`Anchor`] ends it at a fixed simulated instant by consuming
//! every outstanding permit.
//!
//! ## Ownership
//!
//! Observers are boxed trait objects owned by the engine. During a callback
//! the observer is moved out of its slot so it can receive `&mut` access to
//! the engine; it may schedule, bind, unbind or stop freely. Callers that
//! need results after the run bind an `Rc<RefCell<T>>` and keep a clone.

use crate::cg_error::SimError;
use crate::cg_interface::{
    NetworkChange, NodeId, SchedulableType, SimTime, ANCHOR_SCHEDULABLE_TYPE,
    PROCESS_SCHEDULABLE_TYPE,
};
use crate::cg_network::Network;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

// ============================================================================
// Clock
// ============================================================================

/// Simulated clock of one run. Only the engine advances it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimClock {
    raw: SimTime,
    burnin: SimTime,
}

impl SimClock {
    pub(crate) fn new(burnin: SimTime) -> Self {
        Self { raw: 0.0, burnin }
    }

    /// Time elapsed since the end of burn-in, zero while burning in
    pub fn time(&self) -> SimTime {
        (self.raw - self.burnin).max(0.0)
    }

    pub fn raw_time(&self) -> SimTime {
        self.raw
    }

    pub fn burnin(&self) -> SimTime {
        self.burnin
    }

    pub fn is_burning_in(&self) -> bool {
        self.raw < self.burnin
    }

    pub(crate) fn advance(&mut self, to: SimTime) -> Result<(), SimError> {
        if to < self.raw || to.is_nan() {
            return Err(SimError::TimeReversal {
                from: self.raw,
                to,
            });
        }
        self.raw = to;
        Ok(())
    }
}

// ============================================================================
// Schedulables
// ============================================================================

/// Shared cancellation flag of a scheduled timer
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(usize);

impl ObserverId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Unit of future work held by the engine's queue
#[derive(Debug, Clone)]
pub enum Schedulable {
    /// Next availability change of `node`'s renewal process
    Process(NodeId),
    /// Wake-up delivered to `owner` through `timer_fired(tag)`
    Timer {
        owner: ObserverId,
        kind: SchedulableType,
        tag: u64,
        cancel: CancelToken,
    },
}

impl Schedulable {
    pub fn kind(&self) -> SchedulableType {
        match self {
            Schedulable::Process(_) => PROCESS_SCHEDULABLE_TYPE,
            Schedulable::Timer { kind, .. } => *kind,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self {
            Schedulable::Process(_) => false,
            Schedulable::Timer { cancel, .. } => cancel.is_cancelled(),
        }
    }
}

struct Pending {
    time: SimTime,
    seq: u64,
    kind: SchedulableType,
    item: Schedulable,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

/// What an observer is told about a dispatch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    NetworkChanged(NetworkChange),
    Timer {
        owner: ObserverId,
        kind: SchedulableType,
        tag: u64,
    },
}

impl Dispatch {
    pub fn kind(&self) -> SchedulableType {
        match self {
            Dispatch::NetworkChanged(_) => PROCESS_SCHEDULABLE_TYPE,
            Dispatch::Timer { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// Observers
// ============================================================================

pub trait EventObserver {
    /// Called once before the first dispatch, or at bind time for observers
    /// bound while the run is in progress.
    fn started(&mut self, _engine: &mut SimulationEngine, _me: ObserverId) -> Result<(), SimError> {
        Ok(())
    }

    /// Called after a dispatch matching this observer's filter
    fn event_performed(
        &mut self,
        engine: &mut SimulationEngine,
        dispatch: &Dispatch,
    ) -> Result<(), SimError>;

    /// Called when a timer owned by this observer fires
    fn timer_fired(&mut self, _engine: &mut SimulationEngine, _tag: u64) -> Result<(), SimError> {
        Ok(())
    }

    /// Binding observers are unbound (and release their permit) once done
    fn is_done(&self) -> bool {
        false
    }
}

impl<T: EventObserver + ?Sized> EventObserver for Rc<RefCell<T>> {
    fn started(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        self.borrow_mut().started(engine, me)
    }

    fn event_performed(
        &mut self,
        engine: &mut SimulationEngine,
        dispatch: &Dispatch,
    ) -> Result<(), SimError> {
        self.borrow_mut().event_performed(engine, dispatch)
    }

    fn timer_fired(&mut self, engine: &mut SimulationEngine, tag: u64) -> Result<(), SimError> {
        self.borrow_mut().timer_fired(engine, tag)
    }

    fn is_done(&self) -> bool {
        self.borrow().is_done()
    }
}

struct ObserverSlot {
    observer: Option<Box<dyn EventObserver>>,
    /// `None` listens to every type
    filter: Option<SchedulableType>,
    binding: bool,
    listening: bool,
    bound: bool,
}

impl ObserverSlot {
    fn wants(&self, kind: SchedulableType) -> bool {
        self.bound && self.listening && self.filter.map_or(true, |f| f == kind)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct SimulationEngine {
    clock: SimClock,
    queue: BinaryHeap<Pending>,
    seq: u64,
    network: Network,
    rng: StdRng,
    observers: Vec<ObserverSlot>,
    permits: usize,
    stopped: bool,
    started: bool,
    dispatched: u64,
}

impl SimulationEngine {
    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Number of schedulables dispatched so far (expired ones excluded)
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Inserts `item` at raw time `time`. Scheduling in the past is an error.
    pub fn schedule(&mut self, time: SimTime, item: Schedulable) -> Result<(), SimError> {
        if time.is_nan() || time < self.clock.raw_time() {
            return Err(SimError::ScheduledInPast {
                at: time,
                now: self.clock.raw_time(),
            });
        }
        self.seq += 1;
        self.queue.push(Pending {
            time,
            seq: self.seq,
            kind: item.kind(),
            item,
        });
        Ok(())
    }

    /// Schedules a timer owned by `owner` and returns its cancellation token
    pub fn schedule_timer(
        &mut self,
        owner: ObserverId,
        kind: SchedulableType,
        time: SimTime,
        tag: u64,
    ) -> Result<CancelToken, SimError> {
        let cancel = CancelToken::new();
        self.schedule(
            time,
            Schedulable::Timer {
                owner,
                kind,
                tag,
                cancel: cancel.clone(),
            },
        )?;
        Ok(cancel)
    }

    /// Binds an observer while the run is in progress
    pub fn bind(
        &mut self,
        observer: Box<dyn EventObserver>,
        filter: Option<SchedulableType>,
        binding: bool,
    ) -> Result<ObserverId, SimError> {
        let id = ObserverId(self.observers.len());
        self.observers.push(ObserverSlot {
            observer: Some(observer),
            filter,
            binding,
            listening: true,
            bound: true,
        });
        if binding {
            self.permits += 1;
        }
        if self.started {
            self.call(id.0, |observer, engine| observer.started(engine, id))?;
        }
        Ok(id)
    }

    pub fn unbind(&mut self, id: ObserverId) {
        self.release(id.0);
    }

    pub fn is_bound(&self, id: ObserverId) -> bool {
        self.observers.get(id.0).map_or(false, |slot| slot.bound)
    }

    /// Consumes `permits` stop permits; the run ends when none are left
    pub fn stop(&mut self, permits: usize) {
        self.permits = self.permits.saturating_sub(permits);
        if self.permits == 0 {
            self.stopped = true;
        }
    }

    /// Permits still outstanding
    pub fn stop_permits(&self) -> usize {
        self.permits
    }

    pub fn is_done(&self) -> bool {
        self.stopped || self.queue.is_empty()
    }

    /// Runs the dispatch loop to completion
    pub fn run(&mut self) -> Result<(), SimError> {
        self.start()?;
        while !self.is_done() {
            self.step()?;
        }
        self.finish();
        Ok(())
    }

    /// Dispatches the next schedulable. Returns false when nothing was left.
    pub fn step(&mut self) -> Result<bool, SimError> {
        self.start()?;
        let Some(pending) = self.queue.pop() else {
            return Ok(false);
        };
        if pending.item.is_expired() {
            return Ok(true);
        }

        self.clock.advance(pending.time)?;
        self.dispatched += 1;
        trace!("dispatch {:?} at {}", pending.item, pending.time);

        let dispatch = match pending.item {
            Schedulable::Process(node) => {
                let change = self
                    .network
                    .transition(node, &mut self.rng, pending.time)?;
                self.schedule(change.next_shift, Schedulable::Process(node))?;
                Dispatch::NetworkChanged(change)
            }
            Schedulable::Timer { owner, kind, tag, .. } => {
                if self.observers.get(owner.0).map_or(false, |slot| slot.bound) {
                    self.call(owner.0, |observer, engine| observer.timer_fired(engine, tag))?;
                }
                Dispatch::Timer { owner, kind, tag }
            }
        };

        if !self.clock.is_burning_in() {
            self.notify(&dispatch)?;
        }
        Ok(true)
    }

    fn start(&mut self) -> Result<(), SimError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        for index in 0..self.observers.len() {
            let id = ObserverId(index);
            self.call(index, |observer, engine| observer.started(engine, id))?;
        }
        Ok(())
    }

    fn notify(&mut self, dispatch: &Dispatch) -> Result<(), SimError> {
        let kind = dispatch.kind();
        // observers bound during the loop are notified too
        let mut index = 0;
        while index < self.observers.len() {
            if self.observers[index].wants(kind) {
                self.call(index, |observer, engine| {
                    observer.event_performed(engine, dispatch)
                })?;
            }
            index += 1;
        }
        Ok(())
    }

    // Moves the observer out of its slot for the duration of the callback,
    // then unbinds it if it is a binding observer that reports done.
    fn call<F>(&mut self, index: usize, f: F) -> Result<(), SimError>
    where
        F: FnOnce(&mut dyn EventObserver, &mut SimulationEngine) -> Result<(), SimError>,
    {
        let Some(mut observer) = self.observers[index].observer.take() else {
            // re-entrant call into an observer already on the stack
            return Ok(());
        };
        let result = f(observer.as_mut(), self);
        let done = observer.is_done();
        self.observers[index].observer = Some(observer);

        if done && self.observers[index].binding {
            self.release(index);
        }
        result
    }

    fn release(&mut self, index: usize) {
        let Some(slot) = self.observers.get_mut(index) else {
            return;
        };
        if !slot.bound {
            return;
        }
        slot.bound = false;
        if slot.binding {
            debug!("binding observer {} released at {}", index, self.clock.raw_time());
            self.stop(1);
        }
    }

    fn finish(&mut self) {
        for slot in self.observers.iter_mut() {
            slot.bound = false;
        }
        info!(
            "run finished at raw time {:.4} after {} dispatches ({} pending)",
            self.clock.raw_time(),
            self.dispatched,
            self.queue.len()
        );
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`SimulationEngine`] from a network and its observers
pub struct EngineBuilder {
    network: Network,
    burnin: SimTime,
    extra_permits: usize,
    seed: u64,
    observers: Vec<ObserverSlot>,
}

impl EngineBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            burnin: 0.0,
            extra_permits: 0,
            seed: 0,
            observers: Vec::new(),
        }
    }

    pub fn with_burnin(mut self, burnin: SimTime) -> Self {
        self.burnin = burnin;
        self
    }

    pub fn with_extra_permits(mut self, permits: usize) -> Self {
        self.extra_permits = permits;
        self
    }

    /// Seed of the RNG driving churn transitions
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Registers an observer. `filter` restricts notifications to one
    /// schedulable type; `listening == false` registers it for timers only.
    pub fn add_observer(
        &mut self,
        observer: Box<dyn EventObserver>,
        filter: Option<SchedulableType>,
        binding: bool,
        listening: bool,
    ) -> ObserverId {
        let id = ObserverId(self.observers.len());
        self.observers.push(ObserverSlot {
            observer: Some(observer),
            filter,
            binding,
            listening,
            bound: true,
        });
        id
    }

    /// Permits needed for the run to stop before the queue drains
    pub fn permits(&self) -> usize {
        self.extra_permits + self.observers.iter().filter(|slot| slot.binding).count()
    }

    pub fn build(self) -> Result<SimulationEngine, SimError> {
        if !(self.burnin >= 0.0 && self.burnin.is_finite()) {
            return Err(SimError::InvalidConfig(format!("burn-in {}", self.burnin)));
        }
        let permits = self.permits();
        let mut engine = SimulationEngine {
            clock: SimClock::new(self.burnin),
            queue: BinaryHeap::new(),
            seq: 0,
            network: self.network,
            rng: StdRng::seed_from_u64(self.seed),
            observers: self.observers,
            permits,
            stopped: false,
            started: false,
            dispatched: 0,
        };

        let first: Vec<(NodeId, SimTime)> = engine
            .network
            .processes()
            .iter()
            .filter(|p| p.next_event().is_finite())
            .map(|p| (p.id(), p.next_event()))
            .collect();
        for (node, time) in first {
            engine.schedule(time, Schedulable::Process(node))?;
        }

        debug!(
            "engine built: {} nodes, {} observers, {} permits, burn-in {}",
            engine.network.size(),
            engine.observers.len(),
            permits,
            engine.clock.burnin()
        );
        Ok(engine)
    }
}

// ============================================================================
// Anchor
// ============================================================================

const ANCHOR_ARM: u64 = 0;
const ANCHOR_DROP: u64 = 1;

/// Halts the run at a fixed simulated instant.
///
/// Arms at the end of burn-in and drops `anchor_time` later (clock time),
/// consuming every outstanding stop permit. The arm and drop instants
/// delimit the measurement window.
#[derive(Debug, Clone)]
pub struct Anchor {
    anchor_time: SimTime,
    me: Option<ObserverId>,
    armed_at: Option<SimTime>,
    dropped_at: Option<SimTime>,
}

impl Anchor {
    pub fn new(anchor_time: SimTime) -> Result<Self, SimError> {
        if !(anchor_time > 0.0 && anchor_time.is_finite()) {
            return Err(SimError::InvalidConfig(format!("anchor time {}", anchor_time)));
        }
        Ok(Self {
            anchor_time,
            me: None,
            armed_at: None,
            dropped_at: None,
        })
    }

    /// Raw times of arming and dropping, once both happened
    pub fn measurement_window(&self) -> Option<(SimTime, SimTime)> {
        self.armed_at.zip(self.dropped_at)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped_at.is_some()
    }
}

impl EventObserver for Anchor {
    fn started(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        self.me = Some(me);
        let burnin = engine.clock().burnin();
        engine.schedule_timer(me, ANCHOR_SCHEDULABLE_TYPE, burnin, ANCHOR_ARM)?;
        Ok(())
    }

    fn event_performed(&mut self, _engine: &mut SimulationEngine, _dispatch: &Dispatch) -> Result<(), SimError> {
        Ok(())
    }

    fn timer_fired(&mut self, engine: &mut SimulationEngine, tag: u64) -> Result<(), SimError> {
        let now = engine.clock().raw_time();
        match tag {
            ANCHOR_ARM => {
                debug!("anchor armed at {}", now);
                self.armed_at = Some(now);
                let me = self
                    .me
                    .ok_or_else(|| SimError::Invariant("anchor fired before start".into()))?;
                engine.schedule_timer(me, ANCHOR_SCHEDULABLE_TYPE, now + self.anchor_time, ANCHOR_DROP)?;
                Ok(())
            }
            ANCHOR_DROP => {
                info!("anchor dropped at {}", now);
                self.dropped_at = Some(now);
                let permits = engine.stop_permits();
                engine.stop(permits);
                Ok(())
            }
            other => Err(SimError::Invariant(format!("unknown anchor timer {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg_distributions::{Constant, Exponential};
    use crate::cg_graph::IndexedNeighborGraph;
    use crate::cg_interface::State;
    use crate::cg_process::{FixedProcess, Process, RenewalProcess};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn static_network(size: usize) -> Network {
        let graph = Arc::new(IndexedNeighborGraph::ring(size));
        let processes = (0..size)
            .map(|i| Process::Fixed(FixedProcess::new(i, State::Up)))
            .collect();
        Network::new(graph, processes).unwrap()
    }

    fn churn_network(size: usize, seed: u64) -> Network {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = Arc::new(IndexedNeighborGraph::ring(size));
        let processes = (0..size)
            .map(|i| {
                Process::Renewal(RenewalProcess::new(
                    i,
                    Box::new(Exponential::with_mean(1.0).unwrap()),
                    Box::new(Exponential::with_mean(2.0).unwrap()),
                    State::Down,
                    &mut rng,
                ))
            })
            .collect();
        Network::new(graph, processes).unwrap()
    }

    /// Records every dispatch; done after `limit` of them
    #[derive(Default)]
    struct Recorder {
        times: Vec<SimTime>,
        kinds: Vec<SchedulableType>,
        limit: Option<usize>,
    }

    impl EventObserver for Recorder {
        fn event_performed(&mut self, engine: &mut SimulationEngine, dispatch: &Dispatch) -> Result<(), SimError> {
            self.times.push(engine.clock().raw_time());
            self.kinds.push(dispatch.kind());
            Ok(())
        }

        fn is_done(&self) -> bool {
            self.limit.map_or(false, |limit| self.times.len() >= limit)
        }
    }

    /// Schedules a chain of timers; each firing schedules the next one
    /// re-entrantly at the same instant until `remaining` reaches zero.
    struct Chain {
        me: Option<ObserverId>,
        remaining: u32,
        fired: Vec<SimTime>,
    }

    impl EventObserver for Chain {
        fn started(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
            self.me = Some(me);
            engine.schedule_timer(me, 7, 1.0, 0)?;
            Ok(())
        }

        fn event_performed(&mut self, _engine: &mut SimulationEngine, _dispatch: &Dispatch) -> Result<(), SimError> {
            Ok(())
        }

        fn timer_fired(&mut self, engine: &mut SimulationEngine, _tag: u64) -> Result<(), SimError> {
            self.fired.push(engine.clock().raw_time());
            if self.remaining > 0 {
                self.remaining -= 1;
                let now = engine.clock().raw_time();
                if let Some(me) = self.me {
                    engine.schedule_timer(me, 7, now, 0)?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_clock_burnin() {
        let mut clock = SimClock::new(5.0);
        assert!(clock.is_burning_in());
        clock.advance(3.0).unwrap();
        assert_eq!(clock.time(), 0.0);
        clock.advance(7.5).unwrap();
        assert!(!clock.is_burning_in());
        assert_eq!(clock.time(), 2.5);
        assert_eq!(
            clock.advance(1.0),
            Err(SimError::TimeReversal { from: 7.5, to: 1.0 })
        );
    }

    #[test]
    fn test_queue_orders_by_time_then_insertion() {
        let mut builder = EngineBuilder::new(static_network(3));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let id = builder.add_observer(Box::new(recorder.clone()), None, false, true);
        let mut engine = builder.build().unwrap();

        engine.schedule_timer(id, 5, 2.0, 0).unwrap();
        engine.schedule_timer(id, 9, 1.0, 1).unwrap();
        engine.schedule_timer(id, 4, 1.0, 2).unwrap();
        engine.run().unwrap();

        let r = recorder.borrow();
        assert_eq!(r.times, vec![1.0, 1.0, 2.0]);
        // insertion order decides ties, not type
        assert_eq!(r.kinds, vec![9, 4, 5]);
    }

    #[test]
    fn test_reentrant_scheduling_same_instant() {
        let mut builder = EngineBuilder::new(static_network(3));
        let chain = Rc::new(RefCell::new(Chain { me: None, remaining: 3, fired: Vec::new() }));
        builder.add_observer(Box::new(chain.clone()), Some(7), false, false);
        let mut engine = builder.build().unwrap();
        engine.run().unwrap();
        assert_eq!(chain.borrow().fired, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_schedule_in_past_rejected() {
        let mut builder = EngineBuilder::new(static_network(3));
        let id = builder.add_observer(Box::new(Recorder::default()), None, false, true);
        let mut engine = builder.build().unwrap();
        engine.schedule_timer(id, 1, 5.0, 0).unwrap();
        engine.step().unwrap();
        assert_eq!(
            engine.schedule_timer(id, 1, 4.0, 0).err(),
            Some(SimError::ScheduledInPast { at: 4.0, now: 5.0 })
        );
    }

    #[test]
    fn test_cancelled_timer_skipped() {
        let mut builder = EngineBuilder::new(static_network(3));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let id = builder.add_observer(Box::new(recorder.clone()), None, false, true);
        let mut engine = builder.build().unwrap();
        let token = engine.schedule_timer(id, 1, 1.0, 0).unwrap();
        engine.schedule_timer(id, 1, 2.0, 0).unwrap();
        token.cancel();
        engine.run().unwrap();
        assert_eq!(recorder.borrow().times, vec![2.0]);
        assert_eq!(engine.dispatched(), 1);
    }

    #[test]
    fn test_binding_observers_vote_for_termination() {
        let mut builder = EngineBuilder::new(churn_network(6, 42));
        let short = Rc::new(RefCell::new(Recorder { limit: Some(5), ..Default::default() }));
        let long = Rc::new(RefCell::new(Recorder { limit: Some(20), ..Default::default() }));
        let short_id = builder.add_observer(Box::new(short.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
        builder.add_observer(Box::new(long.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
        assert_eq!(builder.permits(), 2);

        let mut engine = builder.build().unwrap();
        engine.run().unwrap();

        // the short observer was released early; the run continued
        assert_eq!(short.borrow().times.len(), 5);
        assert_eq!(long.borrow().times.len(), 20);
        assert!(!engine.is_bound(short_id));
        assert_eq!(engine.stop_permits(), 0);
    }

    #[test]
    fn test_extra_permits_require_explicit_stop() {
        let mut builder = EngineBuilder::new(churn_network(4, 3)).with_extra_permits(1);
        let recorder = Rc::new(RefCell::new(Recorder { limit: Some(10), ..Default::default() }));
        builder.add_observer(Box::new(recorder.clone()), None, true, true);
        let mut engine = builder.build().unwrap();

        for _ in 0..10 {
            engine.step().unwrap();
        }
        assert!(!engine.is_done());
        assert_eq!(engine.stop_permits(), 1);
        engine.stop(1);
        assert!(engine.is_done());
    }

    #[test]
    fn test_observers_silent_during_burnin() {
        let mut builder = EngineBuilder::new(churn_network(4, 9)).with_burnin(10.0);
        let recorder = Rc::new(RefCell::new(Recorder { limit: Some(3), ..Default::default() }));
        builder.add_observer(Box::new(recorder.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
        let mut engine = builder.build().unwrap();
        engine.run().unwrap();
        assert!(recorder.borrow().times.iter().all(|t| *t >= 10.0));
    }

    #[test]
    fn test_anchor_stops_at_fixed_time() {
        let mut builder = EngineBuilder::new(churn_network(5, 11)).with_burnin(2.0);
        let anchor = Rc::new(RefCell::new(Anchor::new(3.0).unwrap()));
        builder.add_observer(Box::new(anchor.clone()), Some(ANCHOR_SCHEDULABLE_TYPE), false, false);
        // never done on its own: only the anchor can end the run
        builder.add_observer(Box::new(Recorder::default()), None, true, true);
        let mut engine = builder.build().unwrap();
        engine.run().unwrap();

        assert_eq!(anchor.borrow().measurement_window(), Some((2.0, 5.0)));
        assert_eq!(engine.clock().raw_time(), 5.0);
        assert_eq!(engine.clock().time(), 3.0);
    }

    #[test]
    fn test_static_network_drains_immediately() {
        let mut engine = EngineBuilder::new(static_network(4)).build().unwrap();
        assert!(engine.is_done());
        engine.run().unwrap();
        assert_eq!(engine.dispatched(), 0);
    }

    proptest! {
        #[test]
        fn prop_dispatch_times_non_decreasing(seed in 0u64..10_000) {
            let mut builder = EngineBuilder::new(churn_network(8, seed)).with_seed(seed);
            let recorder = Rc::new(RefCell::new(Recorder { limit: Some(200), ..Default::default() }));
            builder.add_observer(Box::new(recorder.clone()), None, true, true);
            let mut engine = builder.build().unwrap();
            engine.run().unwrap();

            let times = recorder.borrow().times.clone();
            prop_assert_eq!(times.len(), 200);
            prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn prop_renewal_conservation(seed in 0u64..10_000) {
            let mut builder = EngineBuilder::new(churn_network(5, seed)).with_seed(seed);
            builder.add_observer(Box::new(Recorder { limit: Some(100), ..Default::default() }), None, true, true);
            let mut engine = builder.build().unwrap();
            engine.run().unwrap();

            let clock = engine.clock().clone();
            for process in engine.network().processes() {
                let total = process.uptime(&clock) + process.downtime(&clock);
                prop_assert!((total - clock.raw_time()).abs() < 1e-6 * clock.raw_time().max(1.0));
            }
        }
    }

    #[test]
    fn test_constant_churn_schedule() {
        let mut rng = StdRng::seed_from_u64(0);
        let graph = Arc::new(IndexedNeighborGraph::line(1));
        let process = RenewalProcess::new(0, Box::new(Constant(1.0)), Box::new(Constant(1.0)), State::Down, &mut rng);
        let network = Network::new(graph, vec![Process::Renewal(process)]).unwrap();
        let mut builder = EngineBuilder::new(network);
        let recorder = Rc::new(RefCell::new(Recorder { limit: Some(4), ..Default::default() }));
        builder.add_observer(Box::new(recorder.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
        let mut engine = builder.build().unwrap();
        engine.run().unwrap();
        assert_eq!(recorder.borrow().times, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(!engine.network().process(0).is_up());
    }
}
