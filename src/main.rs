// Earthquake Locator - Main Entry Point
// Licensed under AGPL v3

use clap::Parser;
use quake_locator::batch::{self, BatchConfig, SweepConfig};
use quake_locator::config::{Command, Config, ScenarioArgs};
use quake_locator::locate::Locator;
use quake_locator::output::{self, ConsoleOutput, CsvOutput, JsonOutput, OutputHandler};
use quake_locator::simulation::{generate_stations, generate_true_source, Scenario, TrialReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    match config.command {
        Command::Simulate(args) => simulate(&args),
        Command::Batch(args) => {
            let seed = resolve_seed(&args.scenario);
            let batch_config = BatchConfig {
                scenario: args.scenario.scenario_config()?,
                trials: args.trials,
                seed,
                jacobian: args.scenario.jacobian,
                options: args.scenario.solver_options(),
            };

            let mut outputs: Vec<Box<dyn OutputHandler>> = Vec::new();
            if let Some(path) = &args.write_csv {
                info!("Writing CSV results to {}", path);
                outputs.push(Box::new(CsvOutput::new(path)?));
            }
            if let Some(path) = &args.write_json {
                info!("Writing JSON results to {}", path);
                outputs.push(Box::new(JsonOutput::new(path)?));
            }

            let summary = batch::run_batch(batch_config).await?;
            for report in &summary.reports {
                for out in outputs.iter_mut() {
                    out.handle_report(report)?;
                }
            }
            for out in outputs.iter_mut() {
                out.finish()?;
            }

            for failure in &summary.failures {
                error!("trial {} (seed {}): {}", failure.trial, failure.seed, failure.error);
            }
            println!(
                "{} trials: {} converged, {} failed, mean error {:.2} m, max error {:.2} m",
                args.trials,
                summary.converged(),
                summary.failures.len(),
                summary.mean_error().unwrap_or(f64::NAN),
                summary.max_error().unwrap_or(f64::NAN)
            );
            Ok(())
        }
        Command::Sweep(args) => {
            let seed = resolve_seed(&args.scenario);
            let scenario_config = args.scenario.scenario_config()?;

            // One geometry for every level
            let mut rng = StdRng::seed_from_u64(seed);
            let stations = generate_stations(&mut rng, scenario_config.station_count, scenario_config.radius)?;
            let true_source = generate_true_source(
                &mut rng,
                scenario_config.radius,
                scenario_config.min_depth,
                scenario_config.max_depth,
            );
            info!(
                "Sweep geometry: {} stations, source at ({:.2}, {:.2}, {:.2})",
                stations.len(),
                true_source.x,
                true_source.y,
                true_source.z
            );

            let sweep_config = SweepConfig {
                velocity: scenario_config.velocity,
                levels: args.levels.clone(),
                trials_per_level: args.trials_per_level,
                seed,
                target: args.scenario.noise_target,
                jacobian: args.scenario.jacobian,
                options: args.scenario.solver_options(),
            };
            let points = batch::noise_sweep(stations, true_source, sweep_config).await?;
            output::write_sweep_table(std::io::stdout(), &points)?;
            Ok(())
        }
    }
}

fn simulate(args: &ScenarioArgs) -> Result<(), Box<dyn std::error::Error>> {
    let seed = resolve_seed(args);
    let scenario_config = args.scenario_config()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let scenario = Scenario::generate(&scenario_config, &mut rng)?;

    let locator = Locator::new()
        .with_options(args.solver_options())
        .with_jacobian(args.jacobian);
    let localization = scenario.localize(&locator)?;
    if !localization.converged {
        warn!(
            "Solver stopped without converging ({:?}); reporting best estimate",
            localization.termination
        );
    }

    let report = TrialReport::new(0, seed, &scenario, &localization);
    ConsoleOutput::stdout().handle_report(&report)?;
    Ok(())
}

/// Seed from the command line, or a fresh one that is logged for replay
fn resolve_seed(args: &ScenarioArgs) -> u64 {
    match args.seed {
        Some(seed) => seed,
        None => {
            let seed: u64 = rand::thread_rng().gen();
            info!("Using random seed {} (pass --seed {} to reproduce)", seed, seed);
            seed
        }
    }
}

/// Initialize logging subsystem.
///
/// `RUST_LOG` takes precedence; otherwise this crate logs at DEBUG with
/// `--verbose` and at INFO without. Logs go to stderr so reports on stdout
/// stay clean.
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_directive = if verbose {
        "quake_locator=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let span_events = if verbose {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_span_events(span_events),
        )
        .init();

    if verbose {
        info!("Verbose logging enabled");
    }
}
