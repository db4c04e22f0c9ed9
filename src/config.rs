use clap::{Args, Parser, Subcommand};

use crate::constants::{
    DEFAULT_MAX_DEPTH, DEFAULT_MIN_DEPTH, DEFAULT_NOISE_STD, DEFAULT_RADIUS,
    DEFAULT_STATION_COUNT, DEFAULT_SWEEP_LEVELS, DEFAULT_TRIALS_PER_LEVEL, DEFAULT_VELOCITY, SOLVER_MAX_ITERATIONS,
};
use crate::error::SimulationError;
use crate::jacobian::JacobianKind;
use crate::simulation::{NoiseModel, NoiseTarget, ScenarioConfig};
use crate::solver::SolverOptions;

/// Earthquake hypocenter locator
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Verbose logging (DEBUG level)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Locate one random synthetic earthquake and print the arrival report
    Simulate(ScenarioArgs),

    /// Run many independent random scenarios concurrently
    Batch(BatchArgs),

    /// Measure localization error against timing noise on one fixed geometry
    Sweep(SweepArgs),
}

/// Scenario and solver options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct ScenarioArgs {
    /// Number of stations
    #[arg(long, default_value_t = DEFAULT_STATION_COUNT)]
    pub stations: usize,

    /// Radius of the station footprint (m)
    #[arg(long, default_value_t = DEFAULT_RADIUS)]
    pub radius: f64,

    /// Minimum hypocenter depth (m, positive down)
    #[arg(long, default_value_t = DEFAULT_MIN_DEPTH)]
    pub min_depth: f64,

    /// Maximum hypocenter depth (m, positive down)
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_depth: f64,

    /// Wave velocity (m/s)
    #[arg(long, default_value_t = DEFAULT_VELOCITY)]
    pub velocity: f64,

    /// Standard deviation of arrival time noise (s)
    #[arg(long, default_value_t = DEFAULT_NOISE_STD)]
    pub noise_std: f64,

    /// Where noise is applied
    #[arg(long, value_enum, default_value_t = NoiseTarget::Relative)]
    pub noise_target: NoiseTarget,

    /// RNG seed; drawn from the OS when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Jacobian evaluation
    #[arg(long, value_enum, default_value_t = JacobianKind::Forward)]
    pub jacobian: JacobianKind,

    /// Solver iteration cap
    #[arg(long, default_value_t = SOLVER_MAX_ITERATIONS)]
    pub max_iterations: usize,
}

impl ScenarioArgs {
    pub fn scenario_config(&self) -> Result<ScenarioConfig, SimulationError> {
        let config = ScenarioConfig {
            station_count: self.stations,
            radius: self.radius,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            velocity: self.velocity,
            noise: NoiseModel::new(self.noise_std, self.noise_target)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iterations: self.max_iterations,
            ..SolverOptions::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Number of trials
    #[arg(long, default_value_t = 100)]
    pub trials: usize,

    /// Write per-trial results in CSV format to a file.
    #[arg(long, value_name = "FILE")]
    pub write_csv: Option<String>,

    /// Write per-trial results as JSON lines to a file.
    #[arg(long, value_name = "FILE")]
    pub write_json: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Noise levels to test (s), comma separated
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SWEEP_LEVELS.to_vec())]
    pub levels: Vec<f64>,

    /// Trials per noise level
    #[arg(long, default_value_t = DEFAULT_TRIALS_PER_LEVEL)]
    pub trials_per_level: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let config = Config::try_parse_from(["quake-locator", "simulate"]).unwrap();
        assert!(!config.verbose);
        let Command::Simulate(args) = config.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.stations, DEFAULT_STATION_COUNT);
        assert_eq!(args.velocity, DEFAULT_VELOCITY);
        assert_eq!(args.jacobian, JacobianKind::Forward);
        assert!(args.seed.is_none());
        assert!(args.scenario_config().is_ok());
    }

    #[test]
    fn test_batch_args() {
        let config = Config::try_parse_from([
            "quake-locator", "batch", "--trials", "20", "--seed", "42",
            "--noise-target", "absolute", "--jacobian", "analytic", "--write-csv", "out.csv", "-v",
        ])
        .unwrap();
        assert!(config.verbose);
        let Command::Batch(args) = config.command else {
            panic!("expected batch");
        };
        assert_eq!(args.trials, 20);
        assert_eq!(args.scenario.seed, Some(42));
        assert_eq!(args.scenario.noise_target, NoiseTarget::Absolute);
        assert_eq!(args.scenario.jacobian, JacobianKind::Analytic);
        assert_eq!(args.write_csv.as_deref(), Some("out.csv"));
    }

    #[test]
    fn test_sweep_levels() {
        let config = Config::try_parse_from(["quake-locator", "sweep", "--levels", "0,0.02,0.2"]).unwrap();
        let Command::Sweep(args) = config.command else {
            panic!("expected sweep");
        };
        assert_eq!(args.levels, vec![0.0, 0.02, 0.2]);
        assert_eq!(args.trials_per_level, DEFAULT_TRIALS_PER_LEVEL);
    }

    #[test]
    fn test_invalid_scenario_rejected() {
        let config = Config::try_parse_from(["quake-locator", "simulate", "--noise-std=-1"]).unwrap();
        let Command::Simulate(args) = config.command else {
            panic!("expected simulate");
        };
        // Negative values parse; validation rejects them
        assert_eq!(args.scenario_config().unwrap_err(), SimulationError::InvalidNoise(-1.0));
    }
}
