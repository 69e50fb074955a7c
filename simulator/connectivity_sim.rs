// Temporal Connectivity Example
//
// Drives the engine directly with only the connectivity estimator bound,
// then prints the earliest-arrival tree over a churning ring.

use cg_rust::cg_bitset::NodeSet;
use cg_rust::cg_connectivity::TemporalConnectivityEstimator;
use cg_rust::cg_distributions::ChurnMode;
use cg_rust::cg_interface::PROCESS_SCHEDULABLE_TYPE;
use cg_rust::cg_network::Network;
use cg_rust::{Anchor, EngineBuilder, IndexedNeighborGraph, ProcessSpec, State};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simple_logger::SimpleLogger;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║    Temporal Connectivity on a Churning Ring            ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let size = 24;
    let source = 0;
    let graph = Arc::new(IndexedNeighborGraph::ring(size));
    let mut rng = StdRng::seed_from_u64(7);

    let process = ProcessSpec::Renewal { mode: ChurnMode::H, li: 2.0, di: 1.0 };
    let processes = process
        .build(size, State::Down, &NodeSet::new(), &mut rng)
        .unwrap();
    let network = Network::new(Arc::clone(&graph), processes).unwrap();

    let estimator = Rc::new(RefCell::new(
        TemporalConnectivityEstimator::new(Arc::clone(&graph), source, NodeSet::new()).unwrap(),
    ));

    let mut builder = EngineBuilder::new(network).with_burnin(20.0).with_seed(7);
    builder.add_observer(Box::new(estimator.clone()), Some(PROCESS_SCHEDULABLE_TYPE), true, true);
    builder.add_observer(Box::new(Anchor::new(500.0).unwrap()), None, false, false);

    let mut engine = builder.build().unwrap();
    engine.run().unwrap();
    info!(
        "stopped at {:.3} after {} dispatches",
        engine.clock().time(),
        engine.dispatched()
    );

    let estimator = estimator.borrow();
    println!("\nReached {} of {} nodes\n", estimator.reached_count(), size);
    println!("═══ Earliest-Arrival Tree ═══");
    for node in 0..size {
        if !estimator.is_reached(node) {
            println!("  node {:>2}: never reachable", node);
            continue;
        }
        match estimator.parent(node) {
            Some(parent) => println!(
                "  node {:>2}: delay {:>8.3} via {}",
                node,
                estimator.end_to_end_delay(node),
                parent
            ),
            None => println!("  node {:>2}: source", node),
        }
    }
}
