// Line Graph Dissemination Example
//
// Floods an update along a static line and prints when each node got it,
// first for a single traced run and then averaged over a batch.

mod diffusion;

use cg_rust::{Experiment, IndexedNeighborGraph};
use diffusion::{DiffusionConfig, DiffusionRunner, LoggingEventSink, TopologyConfig};
use simple_logger::SimpleLogger;
use std::sync::Arc;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║    Line Graph Dissemination                            ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let size = 10;
    let graph = Arc::new(IndexedNeighborGraph::line(size));
    let experiment = Experiment {
        burnin: 5.0,
        ..Experiment::default()
    };

    // Single traced run: on a line every node has one fresh neighbor, so
    // the update advances one hop per round.
    let metrics = experiment
        .run_once_with_sink(Arc::clone(&graph), 42, Some(Box::new(LoggingEventSink::new(true))))
        .unwrap();

    println!("\n═══ Single Run ═══");
    for (node, delay) in metrics["e2e_delay"].iter().enumerate() {
        println!("  node {:>2}: delay {:>5.1}, received {} update(s)",
            node, delay, metrics["updates_received"][node]);
    }

    // Batch with the source in the middle of the line
    let config = DiffusionConfig {
        topology: TopologyConfig::Line { size },
        experiment: Experiment {
            source: size / 2,
            ..experiment
        },
        repetitions: 20,
        ..DiffusionConfig::default()
    };
    let result = DiffusionRunner::new(config).run().unwrap();
    result.print_summary();

    println!("\n═══ Mean Delay per Node ═══");
    for (node, delay) in result.per_node_delay.iter().enumerate() {
        println!("  node {:>2}: {:.2}", node, delay);
    }
}
