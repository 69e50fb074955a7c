// Diffusion Simulator Runner

use super::config::DiffusionConfig;
use super::event_sink::LoggingEventSink;
use super::stats::DiffusionResult;
use cg_rust::{Experiment, ProcessSpec, SimError};
use log::info;
use std::sync::Arc;

/// Runs a batch of dissemination experiments described by a [`DiffusionConfig`]
pub struct DiffusionRunner {
    config: DiffusionConfig,
}

impl DiffusionRunner {
    pub fn new(config: DiffusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn run(&self) -> Result<DiffusionResult, SimError> {
        let graph = Arc::new(self.config.topology.build()?);
        let experiment = &self.config.experiment;
        experiment.validate(&graph)?;

        let summary = describe(&self.config);
        info!("running {} repetitions: {}", self.config.repetitions, summary);

        if self.config.trace_first_run {
            let metrics = experiment.run_once_with_sink(
                Arc::clone(&graph),
                experiment.seed,
                Some(Box::new(LoggingEventSink::new(false))),
            )?;
            let reached = metrics
                .get("reached")
                .map_or(0.0, |r| r.iter().sum::<f64>());
            info!("traced run reached {} of {} nodes", reached, graph.size());
        }

        let aggregate = experiment.run_many(
            graph,
            self.config.repetitions,
            self.config.cores(),
            self.config.evaluator(),
        )?;

        Ok(DiffusionResult::from_aggregate(summary, experiment.seed, &aggregate))
    }
}

fn describe(config: &DiffusionConfig) -> String {
    let experiment: &Experiment = &config.experiment;
    let churn = match &experiment.process {
        ProcessSpec::Static => "static".to_string(),
        ProcessSpec::Renewal { mode, li, di } => format!("{:?} churn (li={}, di={})", mode, li, di),
        ProcessSpec::Yao { mode } => format!("{:?} churn (yao averages)", mode),
        ProcessSpec::Custom { .. } => "custom churn".to_string(),
    };
    let mut summary = format!(
        "{}, {}, {} selector, period {}",
        config.topology.describe(),
        churn,
        experiment.selector,
        experiment.period
    );
    if let Some(timeout) = experiment.timeout {
        summary.push_str(&format!(", timeout {}", timeout));
    }
    if experiment.antientropy_interval > 0 {
        summary.push_str(&format!(", anti-entropy every {}", experiment.antientropy_interval));
    }
    if let Some(cloud) = &experiment.cloud {
        summary.push_str(&format!(", cloud period {}", cloud.period));
    }
    summary
}
