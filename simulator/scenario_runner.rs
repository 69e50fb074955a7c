// Scenario Runner - Load and execute dissemination scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/line_static.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/ring_churn.yaml --seed 0x1234 --trace
//   cargo run --bin scenario_runner scenarios/ --output results.yaml

mod diffusion;

use diffusion::{DiffusionConfig, DiffusionResult, DiffusionRunner};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Topology, protocol and batch settings
    config: DiffusionConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

/// Command line overrides applied to every scenario
#[derive(Debug, Default)]
struct Options {
    seed: Option<u64>,
    repetitions: Option<usize>,
    trace: bool,
    output: Option<PathBuf>,
}

/// Entry of the `--output` file
#[derive(Debug, serde::Serialize)]
struct ScenarioOutcome {
    scenario: String,
    result: DiffusionResult,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "Usage: {} <scenario.yaml | directory/> [--seed SEED] [--repetitions N] [--trace] [--output FILE]",
            args[0]
        );
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/line_static.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/ring_churn.yaml --seed 0x1234 --trace", args[0]);
        std::process::exit(1);
    }

    let options = parse_options(&args[2..]).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    let level = if options.trace { log::LevelFilter::Info } else { log::LevelFilter::Warn };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let path = Path::new(&args[1]);
    let outcomes = if path.is_file() {
        vec![run_scenario_file(path, &options)]
    } else if path.is_dir() {
        run_scenario_directory(path, &options)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if let Some(ref output) = options.output {
        write_outcomes(output, &outcomes);
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seed" => {
                let value = iter.next().ok_or("--seed needs a value")?;
                options.seed = Some(parse_seed(value)?);
            }
            "--repetitions" => {
                let value = iter.next().ok_or("--repetitions needs a value")?;
                let n = value
                    .parse()
                    .map_err(|e| format!("invalid repetitions {}: {}", value, e))?;
                options.repetitions = Some(n);
            }
            "--trace" => options.trace = true,
            "--output" => {
                let value = iter.next().ok_or("--output needs a value")?;
                options.output = Some(PathBuf::from(value));
            }
            other => return Err(format!("unknown option {}", other)),
        }
    }
    Ok(options)
}

fn parse_seed(value: &str) -> Result<u64, String> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|e| format!("invalid seed {}: {}", value, e))
}

fn run_scenario_directory(dir: &Path, options: &Options) -> Vec<ScenarioOutcome> {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                  ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    let mut outcomes = Vec::with_capacity(scenarios.len());
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        outcomes.push(run_scenario_file(scenario_path, options));
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete!                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    outcomes
}

fn run_scenario_file(path: &Path, options: &Options) -> ScenarioOutcome {
    println!("Loading scenario from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let name = scenario.meta.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scenario")
            .to_string()
    });

    // Print scenario header
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.chars().count())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    // Apply command line overrides
    let mut config = scenario.config;
    if let Some(seed) = options.seed {
        config.experiment.seed = seed;
    }
    if let Some(repetitions) = options.repetitions {
        config.repetitions = repetitions;
    }
    config.trace_first_run |= options.trace;

    println!("Configuration:");
    println!("  Topology: {}", config.topology.describe());
    println!("  Process: {:?}", config.experiment.process);
    println!("  Selector: {}", config.experiment.selector);
    println!("  Repetitions: {} on {} cores", config.repetitions, config.cores());
    println!("\nStarting simulation...\n");

    let runner = DiffusionRunner::new(config);
    let result = runner.run().unwrap_or_else(|e| {
        eprintln!("Scenario {} failed: {}", name, e);
        std::process::exit(1);
    });

    result.print_summary();

    println!("\n✓ Scenario complete!\n");

    ScenarioOutcome { scenario: name, result }
}

fn write_outcomes(path: &Path, outcomes: &[ScenarioOutcome]) {
    let yaml = serde_yaml::to_string(outcomes).unwrap_or_else(|e| {
        eprintln!("Failed to serialize results: {}", e);
        std::process::exit(1);
    });
    if let Err(e) = fs::write(path, yaml) {
        eprintln!("Failed to write {}: {}", path.display(), e);
        std::process::exit(1);
    }
    println!("Results written to {}", path.display());
}
