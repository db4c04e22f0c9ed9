// Batch runs of independent localization trials
//
// Trials share nothing: each owns an RNG seeded from the base seed and its
// trial index, so they run on tokio's blocking pool in any order and still
// reproduce exactly.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::SimulationError;
use crate::geometry::{Point3, StationSet};
use crate::jacobian::JacobianKind;
use crate::locate::Locator;
use crate::simulation::{NoiseModel, NoiseTarget, Scenario, ScenarioConfig, TrialReport};
use crate::solver::SolverOptions;

/// Settings for a batch of random scenarios
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub scenario: ScenarioConfig,
    pub trials: usize,
    pub seed: u64,
    pub jacobian: JacobianKind,
    pub options: SolverOptions,
}

/// A trial that could not produce an estimate
#[derive(Debug, Clone)]
pub struct TrialFailure {
    pub trial: usize,
    pub seed: u64,
    pub error: SimulationError,
}

/// Collected batch results, ordered by trial index
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub reports: Vec<TrialReport>,
    pub failures: Vec<TrialFailure>,
}

impl BatchSummary {
    pub fn converged(&self) -> usize {
        self.reports.iter().filter(|r| r.converged).count()
    }

    pub fn mean_error(&self) -> Option<f64> {
        mean(self.reports.iter().map(|r| r.error))
    }

    pub fn max_error(&self) -> Option<f64> {
        self.reports.iter().map(|r| r.error).reduce(f64::max)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Seed for trial `index` of a run seeded with `base`
pub fn trial_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add(index as u64)
}

fn run_trial(config: &BatchConfig, trial: usize) -> Result<TrialReport, SimulationError> {
    let seed = trial_seed(config.seed, trial);
    let mut rng = StdRng::seed_from_u64(seed);
    let scenario = Scenario::generate(&config.scenario, &mut rng)?;
    let locator = Locator::new()
        .with_options(config.options)
        .with_jacobian(config.jacobian);
    let localization = scenario.localize(&locator)?;
    Ok(TrialReport::new(trial, seed, &scenario, &localization))
}

/// Run `config.trials` random scenarios concurrently.
///
/// Degenerate or invalid trials are collected as failures instead of
/// aborting the batch.
pub async fn run_batch(config: BatchConfig) -> Result<BatchSummary, SimulationError> {
    config.scenario.validate()?;

    let mut tasks = JoinSet::new();
    for trial in 0..config.trials {
        tasks.spawn_blocking(move || (trial, run_trial(&config, trial)));
    }

    let mut summary = BatchSummary::default();
    while let Some(joined) = tasks.join_next().await {
        let (trial, result) = joined.map_err(|e| SimulationError::TaskFailed(e.to_string()))?;
        match result {
            Ok(report) => {
                if !report.converged {
                    warn!(
                        "trial {} did not converge ({:?}) after {} iterations",
                        trial, report.termination, report.iterations
                    );
                }
                debug!("trial {}: error {:.2} m", trial, report.error);
                summary.reports.push(report);
            }
            Err(error) => {
                warn!("trial {} failed: {}", trial, error);
                summary.failures.push(TrialFailure {
                    trial,
                    seed: trial_seed(config.seed, trial),
                    error,
                });
            }
        }
    }

    summary.reports.sort_by_key(|r| r.trial);
    summary.failures.sort_by_key(|f| f.trial);

    info!(
        "batch complete: {} trials, {} converged, {} failed",
        config.trials,
        summary.converged(),
        summary.failures.len()
    );
    Ok(summary)
}

/// Settings for a noise sweep over one fixed geometry
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub velocity: f64,
    pub levels: Vec<f64>,
    pub trials_per_level: usize,
    pub seed: u64,
    pub target: NoiseTarget,
    pub jacobian: JacobianKind,
    pub options: SolverOptions,
}

/// Error statistics at one noise level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPoint {
    pub noise_std: f64,
    pub trials: usize,
    pub converged: usize,
    pub failed: usize,
    pub mean_error: f64,
    pub rms_error: f64,
    pub max_error: f64,
}

/// Localization error as a function of timing noise.
///
/// Every level reuses the same trial seeds, so differences between levels
/// come from the noise amplitude rather than from different draws.
pub async fn noise_sweep(
    stations: StationSet,
    true_source: Point3,
    config: SweepConfig,
) -> Result<Vec<SweepPoint>, SimulationError> {
    let mut points = Vec::with_capacity(config.levels.len());

    for &level in &config.levels {
        let noise = NoiseModel::new(level, config.target)?;

        let mut tasks = JoinSet::new();
        for trial in 0..config.trials_per_level {
            let stations = stations.clone();
            let seed = trial_seed(config.seed, trial);
            let velocity = config.velocity;
            let locator = Locator::new()
                .with_options(config.options)
                .with_jacobian(config.jacobian);

            tasks.spawn_blocking(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let scenario = Scenario::with_geometry(stations, true_source, velocity, &noise, &mut rng)?;
                let localization = scenario.localize(&locator)?;
                Ok::<_, SimulationError>((localization.converged, localization.error_to(&true_source)))
            });
        }

        let mut errors = Vec::with_capacity(config.trials_per_level);
        let mut converged = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| SimulationError::TaskFailed(e.to_string()))? {
                Ok((ok, error)) => {
                    if ok {
                        converged += 1;
                    }
                    errors.push(error);
                }
                Err(error) => {
                    debug!("noise {} trial failed: {}", level, error);
                    failed += 1;
                }
            }
        }

        let point = SweepPoint {
            noise_std: level,
            trials: config.trials_per_level,
            converged,
            failed,
            mean_error: mean(errors.iter().cloned()).unwrap_or(f64::NAN),
            rms_error: mean(errors.iter().map(|e| e * e)).map_or(f64::NAN, f64::sqrt),
            max_error: errors.iter().cloned().reduce(f64::max).unwrap_or(f64::NAN),
        };
        info!(
            "noise {:.3} s: mean error {:.1} m, max {:.1} m, {}/{} converged",
            point.noise_std, point.mean_error, point.max_error, point.converged, point.trials
        );
        points.push(point);
    }

    Ok(points)
}
