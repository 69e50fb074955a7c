use crate::cg_distributions::Distribution;
use crate::cg_engine::SimClock;
use crate::cg_interface::{NodeId, SimTime, State};
use rand::RngCore;

// ============================================================================
// Process
// ============================================================================

/// Availability of a single node
#[derive(Debug)]
pub enum Process {
    Renewal(RenewalProcess),
    Fixed(FixedProcess),
}

impl Process {
    pub fn id(&self) -> NodeId {
        match self {
            Process::Renewal(p) => p.id,
            Process::Fixed(p) => p.id,
        }
    }

    pub fn state(&self) -> State {
        match self {
            Process::Renewal(p) => p.state,
            Process::Fixed(p) => p.state,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state().is_up()
    }

    /// Raw time of the next availability change, infinite for fixed processes
    pub fn next_event(&self) -> SimTime {
        match self {
            Process::Renewal(p) => p.next_event,
            Process::Fixed(_) => SimTime::INFINITY,
        }
    }

    /// Time spent up since raw time zero
    pub fn uptime(&self, clock: &SimClock) -> f64 {
        match self {
            Process::Renewal(p) => p.uptime(clock),
            Process::Fixed(p) if p.state.is_up() => clock.raw_time(),
            Process::Fixed(_) => 0.0,
        }
    }

    /// Time spent down since raw time zero
    pub fn downtime(&self, clock: &SimClock) -> f64 {
        match self {
            Process::Renewal(p) => p.downtime(clock),
            Process::Fixed(p) if p.state.is_up() => 0.0,
            Process::Fixed(_) => clock.raw_time(),
        }
    }

    /// Long-run fraction of time spent up
    pub fn asymptotic_availability(&self) -> f64 {
        match self {
            Process::Renewal(p) => {
                let up = p.up.expectation();
                up / (up + p.down.expectation())
            }
            Process::Fixed(p) if p.state.is_up() => 1.0,
            Process::Fixed(_) => 0.0,
        }
    }
}

// ============================================================================
// Renewal Process
// ============================================================================

/// Alternating renewal process. Sojourn times in each state are i.i.d.
/// samples from the uptime or downtime distribution.
///
/// Accumulated up and down time are tracked lazily: at each transition the
/// full sampled sojourn is added to the counter of the state being entered,
/// and queries subtract the part of the current sojourn that lies in the
/// future.
#[derive(Debug)]
pub struct RenewalProcess {
    id: NodeId,
    state: State,
    up: Box<dyn Distribution>,
    down: Box<dyn Distribution>,
    next_event: SimTime,
    uptime: f64,
    downtime: f64,
    transitions: u64,
}

impl RenewalProcess {
    /// Creates a process in `initial` state at raw time zero and samples the
    /// length of that first sojourn.
    pub fn new(
        id: NodeId,
        up: Box<dyn Distribution>,
        down: Box<dyn Distribution>,
        initial: State,
        rng: &mut dyn RngCore,
    ) -> Self {
        let mut process = Self {
            id,
            state: initial,
            up,
            down,
            next_event: 0.0,
            uptime: 0.0,
            downtime: 0.0,
            transitions: 0,
        };
        process.enter(initial, rng);
        process
    }

    fn enter(&mut self, state: State, rng: &mut dyn RngCore) {
        let sojourn = match state {
            State::Up => {
                let s = self.up.sample(rng);
                self.uptime += s;
                s
            }
            State::Down => {
                let s = self.down.sample(rng);
                self.downtime += s;
                s
            }
        };
        self.state = state;
        self.next_event += sojourn;
    }

    /// Flips availability and samples the next sojourn. Returns the new
    /// state and the raw time of the next transition.
    pub(crate) fn transition(&mut self, rng: &mut dyn RngCore) -> (State, SimTime) {
        self.transitions += 1;
        self.enter(self.state.flip(), rng);
        (self.state, self.next_event)
    }

    pub fn uptime(&self, clock: &SimClock) -> f64 {
        let ahead = if self.state.is_up() {
            self.next_event - clock.raw_time()
        } else {
            0.0
        };
        debug_assert!(self.uptime - ahead >= -1e-9, "negative uptime for node {}", self.id);
        (self.uptime - ahead).max(0.0)
    }

    pub fn downtime(&self, clock: &SimClock) -> f64 {
        let ahead = if self.state.is_up() {
            0.0
        } else {
            self.next_event - clock.raw_time()
        };
        (self.downtime - ahead).max(0.0)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

// ============================================================================
// Fixed Process
// ============================================================================

/// Process that never changes state. Used for cloud and control nodes, and
/// for static experiments.
#[derive(Debug, Clone)]
pub struct FixedProcess {
    id: NodeId,
    state: State,
}

impl FixedProcess {
    pub fn new(id: NodeId, state: State) -> Self {
        Self { id, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg_distributions::{Constant, Exponential};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn constant_process(initial: State) -> RenewalProcess {
        let mut rng = StdRng::seed_from_u64(42);
        RenewalProcess::new(
            0,
            Box::new(Constant(2.0)),
            Box::new(Constant(3.0)),
            initial,
            &mut rng,
        )
    }

    #[test]
    fn test_starts_down_and_alternates() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut process = constant_process(State::Down);
        assert_eq!(process.state, State::Down);
        assert_eq!(process.next_event, 3.0);

        assert_eq!(process.transition(&mut rng), (State::Up, 5.0));
        assert_eq!(process.transition(&mut rng), (State::Down, 8.0));
        assert_eq!(process.transitions(), 2);
    }

    #[test]
    fn test_lazy_uptime_accounting() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut process = constant_process(State::Down);
        let mut clock = SimClock::new(0.0);

        clock.advance(3.0).unwrap();
        process.transition(&mut rng); // up until 5
        clock.advance(4.0).unwrap();
        assert!((process.uptime(&clock) - 1.0).abs() < 1e-12);
        assert!((process.downtime(&clock) - 3.0).abs() < 1e-12);

        clock.advance(5.0).unwrap();
        process.transition(&mut rng); // down until 8
        clock.advance(6.5).unwrap();
        assert!((process.uptime(&clock) - 2.0).abs() < 1e-12);
        assert!((process.downtime(&clock) - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_availability() {
        let process = Process::Renewal(constant_process(State::Up));
        assert!((process.asymptotic_availability() - 0.4).abs() < 1e-12);
        assert_eq!(Process::Fixed(FixedProcess::new(1, State::Up)).asymptotic_availability(), 1.0);

        let mut rng = StdRng::seed_from_u64(1);
        let exp = RenewalProcess::new(
            3,
            Box::new(Exponential::with_mean(1.0).unwrap()),
            Box::new(Exponential::with_mean(3.0).unwrap()),
            State::Down,
            &mut rng,
        );
        assert!((Process::Renewal(exp).asymptotic_availability() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_process_accounting() {
        let mut clock = SimClock::new(0.0);
        clock.advance(10.0).unwrap();
        let up = Process::Fixed(FixedProcess::new(0, State::Up));
        let down = Process::Fixed(FixedProcess::new(1, State::Down));
        assert_eq!(up.uptime(&clock), 10.0);
        assert_eq!(down.downtime(&clock), 10.0);
        assert_eq!(up.next_event(), SimTime::INFINITY);
    }
}
