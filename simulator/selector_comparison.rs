// Peer Selector Comparison
//
// Runs the same churn scenario once per selector and compares dissemination
// delay, overhead and the stretch over the connectivity lower bound.

mod diffusion;

use cg_rust::cg_distributions::ChurnMode;
use cg_rust::{Experiment, ProcessSpec, SelectorKind};
use diffusion::{DiffusionConfig, DiffusionResult, DiffusionRunner, PrecisionConfig, TopologyConfig};
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║    Peer Selector Comparison                            ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let topology = TopologyConfig::Random { size: 100, probability: 0.05, seed: 11 };
    let mut results: Vec<(SelectorKind, DiffusionResult)> = Vec::new();

    for selector in [
        SelectorKind::Random,
        SelectorKind::Centrality,
        SelectorKind::AntiCentrality,
        SelectorKind::Component,
    ] {
        let config = DiffusionConfig {
            topology: topology.clone(),
            experiment: Experiment {
                process: ProcessSpec::Renewal { mode: ChurnMode::E, li: 4.0, di: 2.0 },
                selector,
                burnin: 20.0,
                period: 0.25,
                anchor: Some(200.0),
                connectivity: true,
                seed: 1000,
                ..Experiment::default()
            },
            repetitions: 200,
            precision: Some(PrecisionConfig { relative: 0.03, ..PrecisionConfig::default() }),
            ..DiffusionConfig::default()
        };

        match DiffusionRunner::new(config).run() {
            Ok(result) => results.push((selector, result)),
            Err(e) => eprintln!("{} failed: {}", selector, e),
        }
    }

    println!("{:<16} {:>6} {:>10} {:>10} {:>10} {:>9}",
        "selector", "runs", "e2e", "bound", "duplicates", "reached");
    for (selector, result) in &results {
        let mean = |id: &str| result.metric(id).map_or(f64::NAN, |m| m.mean);
        println!("{:<16} {:>6} {:>10.3} {:>10.3} {:>10.3} {:>8.1}%",
            selector.to_string(),
            result.runs,
            mean("e2e_delay"),
            mean("tce_delay"),
            mean("duplicates"),
            mean("reached") * 100.0);
    }

    if let Some((best, _)) = results.iter().min_by(|a, b| {
        let stretch = |r: &DiffusionResult| r.delay_stretch().unwrap_or(f64::INFINITY);
        stretch(&a.1).total_cmp(&stretch(&b.1))
    }) {
        println!("\nClosest to the connectivity bound: {}", best);
    }
}
