// Diffusion Simulator Module

pub mod config;
pub mod event_sink;
pub mod runner;
pub mod stats;

// Re-export commonly used types
pub use config::{
    DiffusionConfig,
    PrecisionConfig,
    TopologyConfig,
};

pub use stats::{
    DiffusionResult,
    MetricSummary,
};

pub use event_sink::LoggingEventSink;
pub use runner::DiffusionRunner;
