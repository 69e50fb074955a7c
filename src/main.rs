use std::sync::Arc;

use log::{error, info};
use rand::Rng;
use simple_logger::SimpleLogger;

use cg_rust::cg_distributions::ChurnMode;
use cg_rust::{AvgEvaluator, Experiment, IndexedNeighborGraph, ProcessSpec, SelectorKind};

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    info!("starting");

    let size = 200;
    let graph = Arc::new(IndexedNeighborGraph::ring(size));
    let seed = rand::thread_rng().gen();
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());

    for selector in [SelectorKind::Random, SelectorKind::AntiCentrality] {
        let experiment = Experiment {
            process: ProcessSpec::Renewal {
                mode: ChurnMode::TE,
                li: 1.0,
                di: 1.0,
            },
            selector,
            burnin: 10.0,
            period: 0.1,
            connectivity: true,
            seed,
            ..Experiment::default()
        };

        let aggregate = match experiment.run_many(
            Arc::clone(&graph),
            500,
            cores,
            Some(AvgEvaluator::new(0.02, 0.0, 50)),
        ) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                error!("{} failed: {}", selector, e);
                continue;
            }
        };

        let mean = |id: &str| aggregate.run_mean(id).map_or(f64::NAN, |s| s.mean());
        info!(
            "{}: {} runs, e2e delay {:.3}, connectivity bound {:.3}, duplicates {:.2}",
            selector,
            aggregate.runs(),
            mean("e2e_delay"),
            mean("tce_delay"),
            mean("duplicates")
        );
    }

    info!("done");
}
