//! Sojourn-time distributions and churn presets
//!
//! The churn model only sees the [`Distribution`] trait. [`DistributionSpec`]
//! and [`ChurnMode`] are the serializable descriptors that build concrete
//! distributions for each node.

use crate::cg_error::SimError;
use rand::distributions::Uniform as UniformSampler;
use rand::RngCore;
use rand_distr::{Distribution as _, Exp, Pareto};
use std::str::FromStr;

/// A sojourn-time distribution
pub trait Distribution: std::fmt::Debug {
    fn sample(&self, rng: &mut dyn RngCore) -> f64;

    fn expectation(&self) -> f64;
}

// ============================================================================
// Distributions
// ============================================================================

#[derive(Debug, Clone)]
pub struct Exponential {
    rate: f64,
    sampler: Exp<f64>,
}

impl Exponential {
    pub fn new(rate: f64) -> Result<Self, SimError> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(SimError::InvalidConfig(format!("exponential rate {}", rate)));
        }
        let sampler = Exp::new(rate)
            .map_err(|e| SimError::InvalidConfig(format!("exponential rate {}: {}", rate, e)))?;
        Ok(Self { rate, sampler })
    }

    pub fn with_mean(mean: f64) -> Result<Self, SimError> {
        Self::new(1.0 / mean)
    }
}

impl Distribution for Exponential {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.sampler.sample(rng)
    }

    fn expectation(&self) -> f64 {
        1.0 / self.rate
    }
}

/// Pareto type II (Lomax) with shape `alpha`, scale `beta`, shifted by `mu`.
/// Mean is `mu + beta / (alpha - 1)`.
///
/// Drawn as a classic Pareto with minimum `beta`, moved down to start at `mu`.
#[derive(Debug, Clone)]
pub struct GeneralizedPareto {
    alpha: f64,
    beta: f64,
    mu: f64,
    sampler: Pareto<f64>,
}

impl GeneralizedPareto {
    pub fn new(alpha: f64, beta: f64, mu: f64) -> Result<Self, SimError> {
        let invalid = || {
            SimError::InvalidConfig(format!(
                "pareto parameters alpha={} beta={} mu={}",
                alpha, beta, mu
            ))
        };
        // alpha <= 1 has no finite mean
        if !(alpha > 1.0 && beta > 0.0 && mu >= 0.0) {
            return Err(invalid());
        }
        let sampler = Pareto::new(beta, alpha).map_err(|_| invalid())?;
        Ok(Self { alpha, beta, mu, sampler })
    }

    /// Shape `alpha` with the scale chosen so the mean is `mean`
    pub fn with_mean(alpha: f64, mean: f64) -> Result<Self, SimError> {
        Self::new(alpha, mean * (alpha - 1.0), 0.0)
    }
}

impl Distribution for GeneralizedPareto {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        // clamp guards the last ulp of rounding below the minimum
        (self.mu + self.sampler.sample(rng) - self.beta).max(self.mu)
    }

    fn expectation(&self) -> f64 {
        self.mu + self.beta / (self.alpha - 1.0)
    }
}

/// Exponential conditioned on exceeding `cut`
#[derive(Debug, Clone)]
pub struct LeftTruncatedExponential {
    cut: f64,
    excess: Exponential,
}

impl LeftTruncatedExponential {
    pub fn new(rate: f64, cut: f64) -> Result<Self, SimError> {
        if !(rate > 0.0 && rate.is_finite() && cut >= 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "truncated exponential rate={} cut={}",
                rate, cut
            )));
        }
        Ok(Self { cut, excess: Exponential::new(rate)? })
    }
}

impl Distribution for LeftTruncatedExponential {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        // memorylessness: the excess over the cut is exponential again
        self.cut + self.excess.sample(rng)
    }

    fn expectation(&self) -> f64 {
        self.cut + self.excess.expectation()
    }
}

#[derive(Debug, Clone)]
pub struct Uniform {
    low: f64,
    high: f64,
    sampler: UniformSampler<f64>,
}

impl Uniform {
    pub fn new(low: f64, high: f64) -> Result<Self, SimError> {
        if !(low >= 0.0 && high > low && high.is_finite()) {
            return Err(SimError::InvalidConfig(format!("uniform range [{}, {})", low, high)));
        }
        Ok(Self { low, high, sampler: UniformSampler::new(low, high) })
    }
}

impl Distribution for Uniform {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.sampler.sample(rng)
    }

    fn expectation(&self) -> f64 {
        (self.low + self.high) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant(pub f64);

impl Distribution for Constant {
    fn sample(&self, _rng: &mut dyn RngCore) -> f64 {
        self.0
    }

    fn expectation(&self) -> f64 {
        self.0
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Serializable description of a distribution
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistributionSpec {
    Exponential { mean: f64 },
    Pareto { alpha: f64, beta: f64, #[serde(default)] mu: f64 },
    TruncatedExponential { mean: f64, cut: f64 },
    Uniform { low: f64, high: f64 },
    Constant { value: f64 },
}

impl DistributionSpec {
    pub fn build(&self) -> Result<Box<dyn Distribution>, SimError> {
        Ok(match *self {
            DistributionSpec::Exponential { mean } => Box::new(Exponential::with_mean(mean)?),
            DistributionSpec::Pareto { alpha, beta, mu } => {
                Box::new(GeneralizedPareto::new(alpha, beta, mu)?)
            }
            DistributionSpec::TruncatedExponential { mean, cut } => {
                Box::new(LeftTruncatedExponential::new(1.0 / mean, cut)?)
            }
            DistributionSpec::Uniform { low, high } => Box::new(Uniform::new(low, high)?),
            DistributionSpec::Constant { value } => {
                if !(value > 0.0 && value.is_finite()) {
                    return Err(SimError::InvalidConfig(format!("constant sojourn {}", value)));
                }
                Box::new(Constant(value))
            }
        })
    }
}

// ============================================================================
// Yao Churn Presets
// ============================================================================

/// Truncation point of the LTE mode, five seconds in hours
pub const LTE_CUT: f64 = 5.0 / 3600.0;

const YAO_ALPHA: f64 = 3.0;
const YAO_BETA_UPTIME: f64 = 1.0;
const YAO_BETA_DOWNTIME: f64 = 2.0;

/// Preset system modes mapping a node's average session length `li` and
/// average inter-session length `di` to concrete distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChurnMode {
    /// Heavy tailed: Pareto sojourns with shape 3
    H,
    /// Very heavy tailed: Pareto sojourns with shape 1.5
    VH,
    /// Exponential sessions, Pareto(3, 2 di) inter-sessions
    E,
    /// Totally exponential
    TE,
    /// Left-truncated exponential on both sides
    LTE,
}

impl ChurnMode {
    pub fn uptime(&self, li: f64) -> Result<Box<dyn Distribution>, SimError> {
        Ok(match self {
            ChurnMode::H => Box::new(GeneralizedPareto::with_mean(3.0, li)?),
            ChurnMode::VH => Box::new(GeneralizedPareto::with_mean(1.5, li)?),
            ChurnMode::E | ChurnMode::TE => Box::new(Exponential::with_mean(li)?),
            ChurnMode::LTE => Box::new(LeftTruncatedExponential::new(1.0 / li, LTE_CUT)?),
        })
    }

    pub fn downtime(&self, di: f64) -> Result<Box<dyn Distribution>, SimError> {
        Ok(match self {
            ChurnMode::H => Box::new(GeneralizedPareto::with_mean(3.0, di)?),
            ChurnMode::VH => Box::new(GeneralizedPareto::with_mean(1.5, di)?),
            ChurnMode::E => Box::new(GeneralizedPareto::new(3.0, 2.0 * di, 0.0)?),
            ChurnMode::TE => Box::new(Exponential::with_mean(di)?),
            ChurnMode::LTE => Box::new(LeftTruncatedExponential::new(1.0 / di, LTE_CUT)?),
        })
    }
}

impl FromStr for ChurnMode {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "H" => Ok(ChurnMode::H),
            "VH" => Ok(ChurnMode::VH),
            "E" => Ok(ChurnMode::E),
            "TE" => Ok(ChurnMode::TE),
            "LTE" => Ok(ChurnMode::LTE),
            _ => Err(SimError::UnknownChurnMode(s.to_string())),
        }
    }
}

/// The "yao" average generator: per-node mean session and inter-session
/// lengths drawn from Pareto distributions.
#[derive(Debug, Clone)]
pub struct YaoAverages {
    uptime: GeneralizedPareto,
    downtime: GeneralizedPareto,
}

impl YaoAverages {
    pub fn new() -> Result<Self, SimError> {
        Ok(Self {
            uptime: GeneralizedPareto::new(YAO_ALPHA, YAO_BETA_UPTIME, 0.0)?,
            downtime: GeneralizedPareto::new(YAO_ALPHA, YAO_BETA_DOWNTIME, 0.0)?,
        })
    }

    /// Draws `(li, di)` for one node
    pub fn draw(&self, rng: &mut dyn RngCore) -> (f64, f64) {
        (self.uptime.sample(rng), self.downtime.sample(rng))
    }
}
