// Hypocenter localization entry point
//
// Validates inputs, rejects geometries that cannot constrain a 3D location,
// runs the least-squares solver on relative arrival time residuals and
// packages the result.
//
// Stations lying close to a common plane see a source and its reflection
// through that plane almost alike, so the cost surface has a second basin on
// the far side of the network. Hypocenters sit below the stations; a solve
// that ends above them is restarted from the reflected point.

use nalgebra as na;
use na::{DMatrix, Matrix3, Vector3};
use tracing::{debug, warn};

use crate::constants::{COPLANAR_TOLERANCE, INITIAL_GUESS_DEPTH, MIN_STATIONS, RANK_TOLERANCE};
use crate::error::{Degeneracy, InvalidInput, LocateResult};
use crate::geometry::{distance, Point3, StationSet};
use crate::jacobian::{JacobianKind, JacobianProvider};
use crate::residual::ArrivalResiduals;
use crate::solver::{self, has_full_column_rank, SolverOptions, Termination};

/// Outcome of a localization run
#[derive(Debug, Clone)]
pub struct Localization {
    /// Best-fit hypocenter
    pub point: Point3,
    /// False when the solver stopped on its iteration cap or ran out of
    /// damping attempts, or when the best fit lies above the station
    /// network; `point` is then the best iterate found.
    pub converged: bool,
    pub iterations: usize,
    /// `0.5 * sum(r_i^2)` at `point` (s^2)
    pub final_cost: f64,
    /// `|r|` at `point` (s)
    pub residual_norm: f64,
    pub termination: Termination,
    /// Position covariance (m^2), scaled by the residual variance.
    /// `None` without redundant observations.
    pub covariance: Option<Matrix3<f64>>,
}

impl Localization {
    /// Distance from the estimate to `truth`
    pub fn error_to(&self, truth: &Point3) -> f64 {
        distance(&self.point, truth)
    }

    /// One-sigma 3D position uncertainty, `sqrt(trace(covariance))`
    pub fn position_error(&self) -> Option<f64> {
        self.covariance.map(|c| c.trace().max(0.0).sqrt())
    }
}

/// Initial guess: station centroid horizontally, fixed depth below it
pub fn default_initial_guess(stations: &StationSet) -> Point3 {
    let centroid = stations.centroid();
    Point3::new(centroid.x, centroid.y, INITIAL_GUESS_DEPTH)
}

/// Localizer with configurable solver options and Jacobian provider
#[derive(Debug, Clone, Default)]
pub struct Locator<J = JacobianKind> {
    options: SolverOptions,
    jacobian: J,
}

impl Locator<JacobianKind> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<J> Locator<J> {
    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_jacobian<K>(self, jacobian: K) -> Locator<K> {
        Locator {
            options: self.options,
            jacobian,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }
}

impl<J> Locator<J>
where
    J: for<'a> JacobianProvider<ArrivalResiduals<'a>>,
{
    /// Estimate the hypocenter from measured relative arrival times.
    ///
    /// `measured_rel_times[i]` is the arrival time at station `i` minus the
    /// arrival time at station `ref_index`, so `measured_rel_times[ref_index]`
    /// must be exactly zero. Other entries may be negative.
    pub fn localize(
        &self,
        stations: &StationSet,
        measured_rel_times: &[f64],
        velocity: f64,
        ref_index: usize,
        initial_guess: Point3,
    ) -> LocateResult<Localization> {
        validate_inputs(stations, measured_rel_times, velocity, ref_index, &initial_guess)?;
        let plane = check_geometry(stations)?;

        let model = ArrivalResiduals::new(stations, measured_rel_times, velocity, ref_index);
        let mut outcome = solver::solve(&model, &self.jacobian, initial_guess, &self.options);

        if plane.is_above(&outcome.point) {
            let restart = plane.reflect(&outcome.point);
            debug!(
                "solution ({:.2}, {:.2}, {:.2}) above the network, restarting from ({:.2}, {:.2}, {:.2})",
                outcome.point.x, outcome.point.y, outcome.point.z, restart.x, restart.y, restart.z
            );
            let mirrored = solver::solve(&model, &self.jacobian, restart, &self.options);
            if mirrored.cost <= outcome.cost {
                outcome = mirrored;
            }
        }

        let above = plane.is_above(&outcome.point);
        if above {
            warn!(
                "best fit ({:.2}, {:.2}, {:.2}) lies above the station network",
                outcome.point.x, outcome.point.y, outcome.point.z
            );
        }

        if !has_full_column_rank(&outcome.jacobian, RANK_TOLERANCE) {
            return Err(Degeneracy::RankDeficientJacobian {
                iteration: outcome.iterations,
            }
            .into());
        }

        let covariance = covariance(&outcome.jacobian, outcome.cost, stations.len());
        let residual_norm = outcome.residual_norm();

        debug!(
            "localized at ({:.2}, {:.2}, {:.2}) converged={} iterations={} |r|={:.3e}",
            outcome.point.x,
            outcome.point.y,
            outcome.point.z,
            outcome.converged,
            outcome.iterations,
            residual_norm
        );

        Ok(Localization {
            point: outcome.point,
            converged: outcome.converged && !above,
            iterations: outcome.iterations,
            final_cost: outcome.cost,
            residual_norm,
            termination: outcome.termination,
            covariance,
        })
    }
}

/// Estimate the hypocenter with default solver options and forward
/// difference Jacobians. See [`Locator::localize`].
pub fn localize(
    stations: &StationSet,
    measured_rel_times: &[f64],
    velocity: f64,
    ref_index: usize,
    initial_guess: Point3,
) -> LocateResult<Localization> {
    Locator::new().localize(stations, measured_rel_times, velocity, ref_index, initial_guess)
}

fn validate_inputs(
    stations: &StationSet,
    measured: &[f64],
    velocity: f64,
    ref_index: usize,
    initial_guess: &Point3,
) -> Result<(), InvalidInput> {
    if !(velocity.is_finite() && velocity > 0.0) {
        return Err(InvalidInput::InvalidVelocity(velocity));
    }
    if measured.len() != stations.len() {
        return Err(InvalidInput::LengthMismatch {
            stations: stations.len(),
            times: measured.len(),
        });
    }
    if ref_index >= stations.len() {
        return Err(InvalidInput::ReferenceOutOfBounds {
            index: ref_index,
            stations: stations.len(),
        });
    }
    if let Some(index) = measured.iter().position(|t| !t.is_finite()) {
        return Err(InvalidInput::NonFiniteTime { index });
    }
    if measured[ref_index] != 0.0 {
        return Err(InvalidInput::ReferenceNotZero {
            index: ref_index,
            value: measured[ref_index],
        });
    }
    if !initial_guess.iter().all(|c| c.is_finite()) {
        return Err(InvalidInput::NonFiniteGuess);
    }
    Ok(())
}

/// Best-fit plane through the stations, normal pointing up
#[derive(Debug, Clone, Copy)]
struct StationPlane {
    centroid: Point3,
    normal: Vector3<f64>,
    /// Largest height of any station above the plane
    ceiling: f64,
}

impl StationPlane {
    fn height(&self, p: &Point3) -> f64 {
        (p - self.centroid).dot(&self.normal)
    }

    /// Whether `p` lies above every station
    fn is_above(&self, p: &Point3) -> bool {
        self.height(p) > self.ceiling
    }

    /// Mirror image of `p` through the plane
    fn reflect(&self, p: &Point3) -> Point3 {
        p - self.normal * (2.0 * self.height(p))
    }
}

/// Reject station layouts that leave a direction unobservable and return the
/// plane the stations spread around.
fn check_geometry(stations: &StationSet) -> Result<StationPlane, Degeneracy> {
    if stations.len() < MIN_STATIONS {
        return Err(Degeneracy::Underdetermined {
            stations: stations.len(),
        });
    }

    let centroid = stations.centroid();
    let centered = DMatrix::from_fn(stations.len(), 3, |i, j| {
        stations.positions()[i][j] - centroid[j]
    });
    if !has_full_column_rank(&centered, COPLANAR_TOLERANCE) {
        return Err(Degeneracy::CoplanarStations);
    }

    // Normal is the right singular vector of the smallest singular value
    let svd = centered.svd(false, true);
    let v_t = svd.v_t.ok_or(Degeneracy::CoplanarStations)?;
    let weakest = svd.singular_values.imin();
    let mut normal = Vector3::new(v_t[(weakest, 0)], v_t[(weakest, 1)], v_t[(weakest, 2)]);
    if normal.z < 0.0 {
        normal = -normal;
    }

    let mut plane = StationPlane {
        centroid,
        normal,
        ceiling: 0.0,
    };
    plane.ceiling = stations
        .iter()
        .map(|s| plane.height(s))
        .fold(f64::NEG_INFINITY, f64::max);
    Ok(plane)
}

/// `s^2 (J^T J)^-1` with `s^2` the residual variance over the redundant
/// observations. The reference residual carries no information and is not
/// counted.
fn covariance(jacobian: &DMatrix<f64>, cost: f64, stations: usize) -> Option<Matrix3<f64>> {
    let informative = stations.checked_sub(1)?;
    let dof = informative.checked_sub(3).filter(|&d| d > 0)?;
    let variance = 2.0 * cost / dof as f64;

    let jtj = jacobian.transpose() * jacobian;
    let inv: Matrix3<f64> = jtj.fixed_view::<3, 3>(0, 0).into_owned().try_inverse()?;
    Some(inv * variance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LocateError;
    use crate::geometry::{reference_index, relative_times, travel_times};
    use crate::jacobian::{Analytic, ForwardDifference};
    use crate::residual::ResidualModel;
    use crate::simulation::{NoiseModel, Scenario, ScenarioConfig};
    use na::DVector;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const VELOCITY: f64 = 5000.0;

    fn concrete_stations() -> StationSet {
        StationSet::from_coords(&[
            [-9000.0, 10000.0, 150.0],
            [-16000.0, 4000.0, -220.0],
            [2000.0, 14000.0, 380.0],
            [12000.0, -3000.0, -60.0],
            [-25000.0, 16000.0, 410.0],
            [-3000.0, -22000.0, -350.0],
            [24000.0, 17000.0, 90.0],
        ])
        .unwrap()
    }

    fn concrete_truth() -> Point3 {
        Point3::new(-10456.23, 8694.12, -6700.56)
    }

    fn noiseless(stations: &StationSet, truth: &Point3, reference: usize) -> Vec<f64> {
        relative_times(&travel_times(truth, stations, VELOCITY), reference).unwrap()
    }

    #[test]
    fn test_concrete_scenario_noiseless() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let abs = travel_times(&truth, &stations, VELOCITY);
        let reference = reference_index(&abs).unwrap();
        let measured = relative_times(&abs, reference).unwrap();
        let guess = default_initial_guess(&stations);

        let result = localize(&stations, &measured, VELOCITY, reference, guess).unwrap();
        assert!(result.converged, "termination: {:?}", result.termination);
        assert!(result.error_to(&truth) < 1e-6, "error {} m", result.error_to(&truth));
        assert!(result.final_cost < 1e-12);

        let analytic = Locator::new()
            .with_jacobian(Analytic)
            .localize(&stations, &measured, VELOCITY, reference, guess)
            .unwrap();
        assert!(analytic.converged);
        assert!(analytic.error_to(&truth) < 1e-6);
    }

    #[test]
    fn test_exact_recovery_random_geometries() {
        // Default scenario distribution, depths from 500 m to 10 km
        let config = ScenarioConfig {
            noise: NoiseModel::none(),
            ..ScenarioConfig::default()
        };
        for seed in 0..400 {
            let mut rng = StdRng::seed_from_u64(seed);
            let scenario = Scenario::generate(&config, &mut rng).unwrap();
            let truth = scenario.true_source;

            let result = scenario.localize(&Locator::new()).unwrap();
            assert!(result.converged, "seed {}: {:?}", seed, result.termination);
            assert!(
                result.error_to(&truth) < 1e-6,
                "seed {}: truth {:?} estimate {:?} error {}",
                seed,
                truth,
                result.point,
                result.error_to(&truth)
            );
        }
    }

    #[test]
    fn test_recovery_from_mirrored_guess() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let measured = noiseless(&stations, &truth, 0);
        let above = Point3::new(truth.x, truth.y, -truth.z);

        for kind in [JacobianKind::Forward, JacobianKind::Analytic] {
            let result = Locator::new()
                .with_jacobian(kind)
                .localize(&stations, &measured, VELOCITY, 0, above)
                .unwrap();
            assert!(result.converged, "{:?}: {:?}", kind, result.termination);
            assert!(result.point.z < 0.0);
            assert!(result.error_to(&truth) < 1e-6, "{:?}: error {}", kind, result.error_to(&truth));
        }
    }

    #[test]
    fn test_station_plane() {
        let stations = concrete_stations();
        let plane = check_geometry(&stations).unwrap();
        assert!(plane.normal.z > 0.9);
        assert!((plane.normal.norm() - 1.0).abs() < 1e-12);

        let truth = concrete_truth();
        assert!(!plane.is_above(&truth));
        let mirrored = plane.reflect(&truth);
        assert!(plane.is_above(&mirrored));
        assert!((plane.reflect(&mirrored) - truth).norm() < 1e-9);
        assert!((plane.height(&mirrored) + plane.height(&truth)).abs() < 1e-9);

        for station in &stations {
            assert!(!plane.is_above(station));
        }
    }

    #[test]
    fn test_reference_invariance() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let guess = default_initial_guess(&stations);
        let abs = travel_times(&truth, &stations, VELOCITY);
        let first = reference_index(&abs).unwrap();

        let baseline = localize(&stations, &noiseless(&stations, &truth, first), VELOCITY, first, guess).unwrap();

        for reference in 0..stations.len() {
            let measured = noiseless(&stations, &truth, reference);
            let result = localize(&stations, &measured, VELOCITY, reference, guess).unwrap();
            assert!(result.converged);
            assert!(
                (result.point - baseline.point).norm() < 1e-6,
                "reference {} moved estimate by {}",
                reference,
                (result.point - baseline.point).norm()
            );
        }
    }

    /// Lead times: arrival at the reference station minus arrival at
    /// station `i`, the opposite of the convention `ArrivalResiduals` uses
    struct LeadResiduals<'a> {
        stations: &'a StationSet,
        lead: &'a [f64],
        reference: usize,
    }

    impl ResidualModel for LeadResiduals<'_> {
        fn residual_count(&self) -> usize {
            self.stations.len()
        }

        fn residuals_into(&self, x: &Point3, out: &mut DVector<f64>) {
            let positions = self.stations.positions();
            let first = distance(&positions[self.reference], x) / VELOCITY;
            for (i, station) in positions.iter().enumerate() {
                let predicted = if i == self.reference {
                    0.0
                } else {
                    first - distance(station, x) / VELOCITY
                };
                out[i] = predicted - self.lead[i];
            }
        }
    }

    #[test]
    fn test_sign_invariance() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let abs = travel_times(&truth, &stations, VELOCITY);
        let perturbation = [0.0, 0.012, -0.008, 0.02, -0.015, 0.005, -0.01];

        let lag: Vec<f64> = (0..abs.len())
            .map(|i| if i == 0 { 0.0 } else { abs[i] - abs[0] + perturbation[i] })
            .collect();
        let lead: Vec<f64> = (0..abs.len())
            .map(|i| if i == 0 { 0.0 } else { abs[0] - abs[i] - perturbation[i] })
            .collect();
        let clean_lead: Vec<f64> = (0..abs.len())
            .map(|i| if i == 0 { 0.0 } else { abs[0] - abs[i] })
            .collect();

        let guess = default_initial_guess(&stations);
        let forward = ForwardDifference::default();
        let options = SolverOptions::default();

        // Noiseless lead times recover the source
        let clean = LeadResiduals { stations: &stations, lead: &clean_lead, reference: 0 };
        assert!(clean.residuals(&truth).amax() < 1e-12);
        let recovered = solver::solve(&clean, &forward, guess, &options);
        assert!(recovered.converged);
        assert!((recovered.point - truth).norm() < 1e-6);

        // Noisy data gives the same minimizer under either convention
        let lagging = localize(&stations, &lag, VELOCITY, 0, guess).unwrap();
        let leading = solver::solve(
            &LeadResiduals { stations: &stations, lead: &lead, reference: 0 },
            &forward,
            guess,
            &options,
        );
        assert!(lagging.converged && leading.converged);
        assert!(
            (lagging.point - leading.point).norm() < 1e-6,
            "conventions disagree by {} m",
            (lagging.point - leading.point).norm()
        );
        assert!((lagging.final_cost - leading.cost).abs() < 1e-12);
    }

    #[test]
    fn test_three_stations_degenerate() {
        let stations = StationSet::from_coords(&[
            [0.0, 0.0, 0.0],
            [10000.0, 0.0, 100.0],
            [0.0, 10000.0, -100.0],
        ])
        .unwrap();
        let measured = noiseless(&stations, &Point3::new(2000.0, 3000.0, -5000.0), 0);

        let err = localize(&stations, &measured, VELOCITY, 0, default_initial_guess(&stations)).unwrap_err();
        assert_eq!(err, LocateError::NumericalDegeneracy(Degeneracy::Underdetermined { stations: 3 }));
    }

    #[test]
    fn test_coplanar_degenerate() {
        let flat = StationSet::from_coords(&[
            [0.0, 0.0, 0.0],
            [10000.0, 0.0, 0.0],
            [0.0, 10000.0, 0.0],
            [-8000.0, -3000.0, 0.0],
            [5000.0, -9000.0, 0.0],
        ])
        .unwrap();
        let measured = noiseless(&flat, &Point3::new(1000.0, 1000.0, -4000.0), 0);
        let err = localize(&flat, &measured, VELOCITY, 0, default_initial_guess(&flat)).unwrap_err();
        assert_eq!(err, LocateError::NumericalDegeneracy(Degeneracy::CoplanarStations));

        // Tilted plane z = 0.1 x - 0.05 y
        let tilted: Vec<[f64; 3]> = [[0.0, 0.0], [10000.0, 0.0], [0.0, 10000.0], [-8000.0, -3000.0]]
            .iter()
            .map(|&[x, y]| [x, y, 0.1 * x - 0.05 * y])
            .collect();
        let tilted = StationSet::from_coords(&tilted).unwrap();
        let measured = noiseless(&tilted, &Point3::new(1000.0, 1000.0, -4000.0), 0);
        let err = localize(&tilted, &measured, VELOCITY, 0, default_initial_guess(&tilted)).unwrap_err();
        assert!(err.is_degeneracy());
    }

    #[test]
    fn test_invalid_inputs() {
        let stations = concrete_stations();
        let measured = noiseless(&stations, &concrete_truth(), 0);
        let guess = default_initial_guess(&stations);

        let err = localize(&stations, &measured, 0.0, 0, guess).unwrap_err();
        assert_eq!(err, LocateError::InvalidInput(InvalidInput::InvalidVelocity(0.0)));

        let err = localize(&stations, &measured, VELOCITY, 7, guess).unwrap_err();
        assert_eq!(err, LocateError::InvalidInput(InvalidInput::ReferenceOutOfBounds { index: 7, stations: 7 }));

        let err = localize(&stations, &measured[..5], VELOCITY, 0, guess).unwrap_err();
        assert_eq!(err, LocateError::InvalidInput(InvalidInput::LengthMismatch { stations: 7, times: 5 }));

        // Reference entry must be exactly zero, not just small
        let mut shifted = measured.clone();
        shifted[0] = 1e-12;
        let err = localize(&stations, &shifted, VELOCITY, 0, guess).unwrap_err();
        assert!(matches!(err, LocateError::InvalidInput(InvalidInput::ReferenceNotZero { index: 0, .. })));

        let mut broken = measured.clone();
        broken[3] = f64::NAN;
        let err = localize(&stations, &broken, VELOCITY, 0, guess).unwrap_err();
        assert_eq!(err, LocateError::InvalidInput(InvalidInput::NonFiniteTime { index: 3 }));

        let err = localize(&stations, &measured, VELOCITY, 0, Point3::new(f64::NAN, 0.0, 0.0)).unwrap_err();
        assert_eq!(err, LocateError::InvalidInput(InvalidInput::NonFiniteGuess));
    }

    #[test]
    fn test_non_convergence_is_reported() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let measured = noiseless(&stations, &truth, 0);
        let locator = Locator::new().with_options(SolverOptions {
            max_iterations: 1,
            ..SolverOptions::default()
        });

        let result = locator
            .localize(&stations, &measured, VELOCITY, 0, default_initial_guess(&stations))
            .unwrap();
        assert!(!result.converged);
        assert_eq!(result.termination, Termination::MaxIterations);
        assert_eq!(result.iterations, 1);
        assert!(result.point.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_covariance_with_noise() {
        let stations = concrete_stations();
        let truth = concrete_truth();
        let mut measured = noiseless(&stations, &truth, 0);
        let perturbation = [0.0, 0.01, -0.02, 0.015, -0.005, 0.02, -0.01];
        for (t, p) in measured.iter_mut().zip(perturbation) {
            *t += p;
        }

        let result = localize(&stations, &measured, VELOCITY, 0, default_initial_guess(&stations)).unwrap();
        assert!(result.converged);
        let sigma = result.position_error().unwrap();
        assert!(sigma.is_finite() && sigma > 0.0);
        assert!(result.error_to(&truth) < 2000.0);
    }

    #[test]
    fn test_initial_guess_policy() {
        let stations = concrete_stations();
        let guess = default_initial_guess(&stations);
        let centroid = stations.centroid();
        assert_eq!(guess.x, centroid.x);
        assert_eq!(guess.y, centroid.y);
        assert_eq!(guess.z, INITIAL_GUESS_DEPTH);
    }
}
