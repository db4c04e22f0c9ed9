// Synthetic earthquake scenarios
//
// Places stations and a hypocenter, computes arrival times, adds timing noise
// and stamps arrivals with wall-clock times. All randomness comes from the
// RNG the caller passes in, so seeded runs are reproducible and independent
// runs can proceed in parallel.

use std::f64::consts::PI;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_DEPTH, DEFAULT_MIN_DEPTH, DEFAULT_NOISE_STD, DEFAULT_RADIUS,
    DEFAULT_STATION_COUNT, DEFAULT_VELOCITY, STATION_ELEVATION_JITTER,
};
use crate::error::{InvalidInput, LocateResult, SimulationError};
use crate::geometry::{reference_index, relative_times, travel_times, Point3, StationSet};
use crate::jacobian::JacobianProvider;
use crate::locate::{default_initial_guess, Localization, Locator};
use crate::residual::ArrivalResiduals;
use crate::solver::Termination;

/// Place `count` stations uniformly over a disc of `radius`, each with a
/// small random elevation.
pub fn generate_stations<R: Rng + ?Sized>(
    rng: &mut R,
    count: usize,
    radius: f64,
) -> Result<StationSet, InvalidInput> {
    let positions = (0..count)
        .map(|_| {
            let (x, y) = sample_disc(rng, radius);
            let z = rng.gen_range(-STATION_ELEVATION_JITTER..=STATION_ELEVATION_JITTER);
            Point3::new(x, y, z)
        })
        .collect();
    StationSet::new(positions)
}

/// Place a hypocenter under the disc at a depth in `[min_depth, max_depth]`
/// (positive meters below datum).
pub fn generate_true_source<R: Rng + ?Sized>(
    rng: &mut R,
    radius: f64,
    min_depth: f64,
    max_depth: f64,
) -> Point3 {
    let (x, y) = sample_disc(rng, radius);
    let depth = if max_depth > min_depth {
        rng.gen_range(min_depth..max_depth)
    } else {
        min_depth
    };
    Point3::new(x, y, -depth)
}

fn sample_disc<R: Rng + ?Sized>(rng: &mut R, radius: f64) -> (f64, f64) {
    let r = rng.gen::<f64>().sqrt() * radius;
    let theta = rng.gen::<f64>() * 2.0 * PI;
    (r * theta.cos(), r * theta.sin())
}

/// Where timing noise enters the measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseTarget {
    /// Perturb each non-reference relative time independently
    #[default]
    Relative,
    /// Perturb absolute arrival times, then re-reference
    Absolute,
}

/// Zero-mean Gaussian timing noise.
///
/// In both targets the reference station's relative time stays exactly zero.
#[derive(Debug, Clone, Copy)]
pub struct NoiseModel {
    std_dev: f64,
    target: NoiseTarget,
    distribution: Option<Normal<f64>>,
}

impl NoiseModel {
    pub fn new(std_dev: f64, target: NoiseTarget) -> Result<Self, SimulationError> {
        if !(std_dev.is_finite() && std_dev >= 0.0) {
            return Err(SimulationError::InvalidNoise(std_dev));
        }
        let distribution = if std_dev > 0.0 {
            Some(Normal::new(0.0, std_dev).map_err(|_| SimulationError::InvalidNoise(std_dev))?)
        } else {
            None
        };
        Ok(NoiseModel {
            std_dev,
            target,
            distribution,
        })
    }

    pub fn none() -> Self {
        NoiseModel {
            std_dev: 0.0,
            target: NoiseTarget::Relative,
            distribution: None,
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn target(&self) -> NoiseTarget {
        self.target
    }

    /// Measured relative times from true absolute times.
    ///
    /// Returns `None` if `reference` is out of bounds; no randomness is
    /// consumed in that case.
    pub fn measure<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        absolute: &[f64],
        reference: usize,
    ) -> Option<Vec<f64>> {
        let mut measured = relative_times(absolute, reference)?;
        let Some(normal) = self.distribution else {
            return Some(measured);
        };

        match self.target {
            NoiseTarget::Relative => {
                for (i, t) in measured.iter_mut().enumerate() {
                    if i != reference {
                        *t += normal.sample(rng);
                    }
                }
                Some(measured)
            }
            NoiseTarget::Absolute => {
                let noisy: Vec<f64> = absolute.iter().map(|t| t + normal.sample(rng)).collect();
                relative_times(&noisy, reference)
            }
        }
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self::none()
    }
}

/// Random wall-clock time for the first arrival, between 2000 and 2029
pub fn random_base_datetime<R: Rng + ?Sized>(rng: &mut R) -> NaiveDateTime {
    let year = rng.gen_range(2000..2030);
    let month = rng.gen_range(1..=12);
    // Day 28 exists in every month
    let day = rng.gen_range(1..=28);
    let hour = rng.gen_range(0..24);
    let minute = rng.gen_range(0..60);
    let second = rng.gen_range(0..60);

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .unwrap_or_default()
}

/// Arrival wall-clock times, microsecond resolution.
///
/// Fails when an arrival falls outside the range `NaiveDateTime` can
/// represent.
pub fn arrival_timestamps(
    base: NaiveDateTime,
    relative: &[f64],
) -> Result<Vec<NaiveDateTime>, SimulationError> {
    relative
        .iter()
        .enumerate()
        .map(|(station, &t)| {
            // `as` saturates, so out-of-range offsets surface in checked_add_signed
            let offset = Duration::microseconds((t * 1e6).round() as i64);
            base.checked_add_signed(offset)
                .ok_or(SimulationError::TimestampOverflow { station, offset: t })
        })
        .collect()
}

/// Millisecond precision, e.g. `2021-06-14 08:03:27.412`
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Parameters for random scenarios
#[derive(Debug, Clone, Copy)]
pub struct ScenarioConfig {
    pub station_count: usize,
    pub radius: f64,
    pub min_depth: f64,
    pub max_depth: f64,
    pub velocity: f64,
    pub noise: NoiseModel,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            station_count: DEFAULT_STATION_COUNT,
            radius: DEFAULT_RADIUS,
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            velocity: DEFAULT_VELOCITY,
            noise: NoiseModel {
                std_dev: DEFAULT_NOISE_STD,
                target: NoiseTarget::Relative,
                distribution: Normal::new(0.0, DEFAULT_NOISE_STD).ok(),
            },
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(SimulationError::InvalidRadius(self.radius));
        }
        if !(self.min_depth.is_finite() && self.max_depth.is_finite())
            || self.min_depth < 0.0
            || self.max_depth < self.min_depth
        {
            return Err(SimulationError::InvalidDepthRange {
                min: self.min_depth,
                max: self.max_depth,
            });
        }
        if !(self.velocity.is_finite() && self.velocity > 0.0) {
            return Err(InvalidInput::InvalidVelocity(self.velocity).into());
        }
        Ok(())
    }
}

/// One synthetic event: geometry, ground truth and noisy measurements
#[derive(Debug, Clone)]
pub struct Scenario {
    pub stations: StationSet,
    pub true_source: Point3,
    pub velocity: f64,
    pub noise_std: f64,
    /// Noise-free absolute travel times
    pub true_times: Vec<f64>,
    /// First station to receive the signal
    pub reference: usize,
    /// Noisy relative times, exactly zero at `reference`
    pub measured: Vec<f64>,
    /// Wall-clock time of the first arrival
    pub base_time: NaiveDateTime,
    /// Wall-clock arrival time per station
    pub arrivals: Vec<NaiveDateTime>,
}

impl Scenario {
    /// Random geometry and measurements
    pub fn generate<R: Rng + ?Sized>(config: &ScenarioConfig, rng: &mut R) -> Result<Self, SimulationError> {
        config.validate()?;
        let stations = generate_stations(rng, config.station_count, config.radius)?;
        let true_source = generate_true_source(rng, config.radius, config.min_depth, config.max_depth);
        Self::with_geometry(stations, true_source, config.velocity, &config.noise, rng)
    }

    /// Fixed geometry, random measurements
    pub fn with_geometry<R: Rng + ?Sized>(
        stations: StationSet,
        true_source: Point3,
        velocity: f64,
        noise: &NoiseModel,
        rng: &mut R,
    ) -> Result<Self, SimulationError> {
        if !(velocity.is_finite() && velocity > 0.0) {
            return Err(InvalidInput::InvalidVelocity(velocity).into());
        }

        let true_times = travel_times(&true_source, &stations, velocity);
        let reference = reference_index(&true_times).ok_or(InvalidInput::NoStations)?;
        let measured = noise
            .measure(rng, &true_times, reference)
            .ok_or(InvalidInput::ReferenceOutOfBounds {
                index: reference,
                stations: stations.len(),
            })?;
        let base_time = random_base_datetime(rng);
        let arrivals = arrival_timestamps(base_time, &measured)?;

        Ok(Scenario {
            stations,
            true_source,
            velocity,
            noise_std: noise.std_dev(),
            true_times,
            reference,
            measured,
            base_time,
            arrivals,
        })
    }

    /// Run the locator from the default initial guess
    pub fn localize<J>(&self, locator: &Locator<J>) -> LocateResult<Localization>
    where
        J: for<'a> JacobianProvider<ArrivalResiduals<'a>>,
    {
        locator.localize(
            &self.stations,
            &self.measured,
            self.velocity,
            self.reference,
            default_initial_guess(&self.stations),
        )
    }
}

/// Serializable record of one localization trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial: usize,
    pub seed: u64,
    pub noise_std: f64,
    pub reference: usize,
    pub stations: Vec<[f64; 3]>,
    pub true_source: [f64; 3],
    pub estimate: [f64; 3],
    /// Distance between estimate and truth (m)
    pub error: f64,
    pub converged: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub residual_norm: f64,
    pub termination: Termination,
    pub position_error: Option<f64>,
    /// Arrival wall-clock times, station order
    pub arrivals: Vec<String>,
}

impl TrialReport {
    pub fn new(trial: usize, seed: u64, scenario: &Scenario, localization: &Localization) -> Self {
        TrialReport {
            trial,
            seed,
            noise_std: scenario.noise_std,
            reference: scenario.reference,
            stations: scenario.stations.iter().map(to_array).collect(),
            true_source: to_array(&scenario.true_source),
            estimate: to_array(&localization.point),
            error: localization.error_to(&scenario.true_source),
            converged: localization.converged,
            iterations: localization.iterations,
            final_cost: localization.final_cost,
            residual_norm: localization.residual_norm,
            termination: localization.termination,
            position_error: localization.position_error(),
            arrivals: scenario.arrivals.iter().map(format_timestamp).collect(),
        }
    }
}

fn to_array(p: &Point3) -> [f64; 3] {
    [p.x, p.y, p.z]
}
