//! Dissemination service
//!
//! The engine observer that drives one dissemination run: it publishes the
//! update at the source once burn-in is over, fires protocol rounds through
//! a [`PausingCyclicRunner`], optionally runs anti-entropy and cloud
//! polling, and collects traffic statistics.
//!
//! Timer tags carry the timer kind in the upper 32 bits and a node id (for
//! per-node timers) in the lower 32.

use crate::cg_cloud::{Cloud, CloudAccessor, CloudConfig};
use crate::cg_cyclic::PausingCyclicRunner;
use crate::cg_dissemination::{Context, FloodChannel, Message};
use crate::cg_engine::{Dispatch, EventObserver, ObserverId, SimulationEngine};
use crate::cg_error::SimError;
use crate::cg_graph::{IndexedNeighborGraph, Liveness};
use crate::cg_interface::{
    Event, EventSink, MessageFlags, MessageKind, NodeId, SchedulableType, SimTime,
    CYCLE_SCHEDULABLE_TYPE, PERIODIC_SCHEDULABLE_TYPE, START_SCHEDULABLE_TYPE,
};
use crate::cg_selectors::SelectorKind;
use crate::cg_statistics::{MessageStatistics, RunMetrics};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

fn tag(kind: SchedulableType, index: usize) -> u64 {
    ((kind as u64) << 32) | index as u64
}

fn untag(tag: u64) -> (SchedulableType, usize) {
    ((tag >> 32) as SchedulableType, (tag & 0xFFFF_FFFF) as usize)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Node that publishes the update
    pub source: NodeId,

    pub selector: SelectorKind,

    /// Length of a protocol round
    pub period: SimTime,

    /// Inactivity after which a node stops pushing
    pub timeout: Option<SimTime>,

    /// Run anti-entropy every this many rounds, never when zero
    pub antientropy_interval: u32,

    /// Cloud polling, disabled when absent
    pub cloud: Option<CloudConfig>,

    pub seed: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            source: 0,
            selector: SelectorKind::Random,
            period: 1.0,
            timeout: None,
            antientropy_interval: 0,
            cloud: None,
            seed: 0,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

struct Sinks {
    stats: MessageStatistics,
    extra: Option<Box<dyn EventSink>>,
}

impl EventSink for Sinks {
    fn log(&mut self, raw_time: SimTime, burning_in: bool, node: NodeId, event: Event) {
        if let Some(extra) = self.extra.as_mut() {
            extra.log(raw_time, burning_in, node, event.clone());
        }
        self.stats.log(raw_time, burning_in, node, event);
    }
}

struct CloudState {
    config: CloudConfig,
    store: Cloud,
    accessors: Vec<CloudAccessor>,
    /// Anti-entropy is off for the rest of a session that polled the cloud
    suppressed_until: Vec<SimTime>,
}

// ============================================================================
// Service
// ============================================================================

pub struct DisseminationService {
    config: ServiceConfig,
    update: FloodChannel,
    nup: FloodChannel,
    runner: PausingCyclicRunner,
    cloud: Option<CloudState>,
    sinks: Sinks,
    rng: StdRng,
    me: Option<ObserverId>,
    published_at: Option<SimTime>,
    baseline_uptime: Vec<f64>,
}

impl DisseminationService {
    pub fn new(graph: Arc<IndexedNeighborGraph>, config: ServiceConfig) -> Result<Self, SimError> {
        let size = graph.size();
        if config.source >= size {
            return Err(SimError::UnknownNode {
                node: config.source,
                size,
            });
        }
        let cloud = match &config.cloud {
            Some(cloud) => {
                cloud.validate()?;
                Some(CloudState {
                    config: cloud.clone(),
                    store: Cloud::default(),
                    accessors: Vec::new(),
                    suppressed_until: vec![SimTime::NEG_INFINITY; size],
                })
            }
            None => None,
        };

        Ok(Self {
            update: FloodChannel::new(
                MessageKind::Update,
                Arc::clone(&graph),
                config.selector.build(config.seed),
                config.timeout,
            )?,
            nup: FloodChannel::new(
                MessageKind::NoUpdate,
                graph,
                config.selector.build(config.seed.wrapping_add(1)),
                config.timeout,
            )?,
            runner: PausingCyclicRunner::new(config.period, tag(CYCLE_SCHEDULABLE_TYPE, 0))?,
            cloud,
            sinks: Sinks {
                stats: MessageStatistics::new(size),
                extra: None,
            },
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(2)),
            me: None,
            published_at: None,
            baseline_uptime: Vec::new(),
            config,
        })
    }

    /// Also reports every protocol event to `sink`
    pub fn with_event_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sinks.extra = Some(sink);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn update_channel(&self) -> &FloodChannel {
        &self.update
    }

    pub fn nup_channel(&self) -> &FloodChannel {
        &self.nup
    }

    pub fn statistics(&self) -> &MessageStatistics {
        &self.sinks.stats
    }

    pub fn runner(&self) -> &PausingCyclicRunner {
        &self.runner
    }

    /// Raw time at which the source published, if it did
    pub fn published_at(&self) -> Option<SimTime> {
        self.published_at
    }

    /// Per-node delay and traffic metrics of the run so far
    pub fn metrics(&self) -> RunMetrics {
        let protocols = self.update.protocols();
        let source_time = protocols[self.config.source].reached_at();
        let per_node = |f: &dyn Fn(usize) -> f64| (0..protocols.len()).map(f).collect::<Vec<f64>>();

        let mut metrics = RunMetrics::new();
        metrics.insert(
            "e2e_delay".into(),
            per_node(&|i| match (protocols[i].reached_at(), source_time) {
                (Some(t), Some(s)) => t - s,
                _ => f64::NAN,
            }),
        );
        metrics.insert(
            "receiver_delay".into(),
            per_node(&|i| match (protocols[i].uptime_at_reach(), self.baseline_uptime.get(i)) {
                (Some(u), Some(b)) => u - b,
                _ => f64::NAN,
            }),
        );
        metrics.insert(
            "reached".into(),
            per_node(&|i| if protocols[i].is_reached() { 1.0 } else { 0.0 }),
        );
        metrics.insert("duplicates".into(), per_node(&|i| protocols[i].duplicates() as f64));
        metrics.insert(
            "contacts_initiated".into(),
            per_node(&|i| protocols[i].contacts_initiated() as f64),
        );
        metrics.insert(
            "contacts_received".into(),
            per_node(&|i| protocols[i].contacts_received() as f64),
        );
        for (id, values) in self.sinks.stats.metrics(self.cloud.is_some()) {
            metrics.insert(id.to_string(), values);
        }
        metrics
    }

    fn me(&self) -> Result<ObserverId, SimError> {
        self.me
            .ok_or_else(|| SimError::Invariant("dissemination service not started".into()))
    }

    fn publish(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        let source = self.config.source;
        if self.published_at.is_some() || !engine.network().is_up(source) {
            return Ok(());
        }
        let clock = engine.clock();
        let now = clock.raw_time();
        self.published_at = Some(now);
        self.baseline_uptime = engine
            .network()
            .processes()
            .iter()
            .map(|p| p.uptime(clock))
            .collect();

        let message = Message::update(source, now);
        {
            let mut ctx = Context {
                clock: engine.clock(),
                network: engine.network(),
                sink: &mut self.sinks,
            };
            self.update.publish(source, message, &mut ctx)?;
        }
        if let Some(cloud) = self.cloud.as_mut() {
            cloud.store.publish(message);
        }
        info!("update published by node {} at raw time {:.4}", source, now);
        self.runner.resume(engine, me)
    }

    fn on_start(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        debug!("measurement starts at raw time {}", engine.clock().raw_time());
        self.publish(engine, me)?;
        if let Some(cloud) = self.cloud.as_mut() {
            for accessor in cloud.accessors.iter_mut() {
                let process = engine.network().process(accessor.action().node());
                if process.is_up() {
                    let next_shift = process.next_event();
                    accessor.action_mut().on_login(engine, me, next_shift)?;
                }
            }
        }
        Ok(())
    }

    fn run_cycle(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        let round = {
            let mut ctx = Context {
                clock: engine.clock(),
                network: engine.network(),
                sink: &mut self.sinks,
            };
            self.update.begin_round();
            self.nup.begin_round();
            for node in 0..self.update.size() {
                self.update.next_cycle(node, &mut ctx)?;
                if self.cloud.is_some() {
                    self.nup.next_cycle(node, &mut ctx)?;
                }
            }

            let round = self.update.round();
            let interval = u64::from(self.config.antientropy_interval);
            if interval > 0 && round % interval == 0 {
                let now = ctx.clock.raw_time();
                for node in 0..self.update.size() {
                    let suppressed = self
                        .cloud
                        .as_ref()
                        .map_or(false, |cloud| now < cloud.suppressed_until[node]);
                    if ctx.network.is_up(node) && !suppressed {
                        self.update.antientropy(node, &mut self.rng, &mut ctx)?;
                    }
                }
            }
            round
        };

        self.replan_cloud(engine, me)?;
        let active = self.update.active_count() + self.nup.active_count();
        if active == 0 {
            debug!("round {} left nothing active", round);
        }
        self.runner.cycle_done(engine, me, active)
    }

    // NUP receptions postpone the receiver's own poll
    fn replan_cloud(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        self.update.take_deliveries();
        let deliveries = self.nup.take_deliveries();
        let Some(cloud) = self.cloud.as_mut() else {
            return Ok(());
        };
        let now = engine.clock().raw_time();
        for (node, nup) in deliveries {
            if nup.origin == node {
                continue;
            }
            let accessor = &mut cloud.accessors[node];
            if let Some(next) = accessor.on_nup(&nup, now, &mut self.rng) {
                accessor.action_mut().new_timer(engine, me, next)?;
            }
        }
        Ok(())
    }

    fn cloud_access(
        &mut self,
        node: NodeId,
        engine: &mut SimulationEngine,
        me: ObserverId,
    ) -> Result<(), SimError> {
        let Some(cloud) = self.cloud.as_mut() else {
            return Err(SimError::Invariant("cloud access without a cloud".into()));
        };
        let accessor = cloud
            .accessors
            .get_mut(node)
            .ok_or(SimError::UnknownNode { node, size: self.update.size() })?;
        accessor.action_mut().fired(engine)?;

        let now = engine.clock().raw_time();
        let productive = cloud.store.has_update() && !self.update.protocol(node).is_reached();
        {
            let mut ctx = Context {
                clock: engine.clock(),
                network: engine.network(),
                sink: &mut self.sinks,
            };
            ctx.sink
                .log(now, ctx.clock.is_burning_in(), node, Event::CloudAccess { productive });
            if productive {
                self.update.mark_reached(node, node, MessageFlags::NO_MESSAGE, &mut ctx)?;
            } else {
                self.nup.post(node, Message::no_update(node, now), &mut ctx)?;
            }
        }

        cloud.suppressed_until[node] = engine.network().process(node).next_event();
        let next = accessor.on_access(now, &mut self.rng);
        accessor.action_mut().new_timer(engine, me, next)?;
        self.replan_cloud(engine, me)?;
        self.runner.resume(engine, me)
    }
}

impl EventObserver for DisseminationService {
    fn started(&mut self, engine: &mut SimulationEngine, me: ObserverId) -> Result<(), SimError> {
        self.me = Some(me);
        let burnin = engine.clock().burnin();
        if let Some(cloud) = self.cloud.as_mut() {
            cloud.accessors = (0..self.update.size())
                .map(|node| {
                    CloudAccessor::new(
                        node,
                        node as u32,
                        &cloud.config,
                        burnin,
                        tag(PERIODIC_SCHEDULABLE_TYPE, node),
                    )
                })
                .collect();
        }
        engine.schedule_timer(me, START_SCHEDULABLE_TYPE, burnin, tag(START_SCHEDULABLE_TYPE, 0))?;
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
        let me = self.me()?;
        if change.node == self.config.source {
            self.publish(engine, me)?;
        }
        self.runner.on_network_change(engine, me, change)?;
        if let Some(cloud) = self.cloud.as_mut() {
            cloud.accessors[change.node]
                .action_mut()
                .on_network_change(engine, me, change)?;
        }
        Ok(())
    }

    fn timer_fired(&mut self, engine: &mut SimulationEngine, tag: u64) -> Result<(), SimError> {
        let me = self.me()?;
        match untag(tag) {
            (START_SCHEDULABLE_TYPE, _) => self.on_start(engine, me),
            (CYCLE_SCHEDULABLE_TYPE, _) => self.run_cycle(engine, me),
            (PERIODIC_SCHEDULABLE_TYPE, node) => self.cloud_access(node, engine, me),
            (kind, _) => Err(SimError::Invariant(format!("unexpected timer kind {}", kind))),
        }
    }

    /// Done once every node holds the update
    fn is_done(&self) -> bool {
        self.update.all_reached()
    }
}
