// Levenberg-Marquardt least-squares solver
//
// Minimizes F(x) = 0.5 * |r(x)|^2 over a 3D point x. Damping follows
// Nielsen's update rule: the damping parameter mu shrinks smoothly after good
// steps and grows geometrically after rejected ones.

use nalgebra as na;
use na::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::constants::{
    SOLVER_FTOL, SOLVER_GTOL, SOLVER_MAX_DAMPING_ATTEMPTS, SOLVER_MAX_ITERATIONS, SOLVER_TAU,
    SOLVER_XTOL,
};
use crate::geometry::Point3;
use crate::jacobian::JacobianProvider;
use crate::residual::ResidualModel;

/// Tolerances and limits for the solver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Iteration cap; reaching it ends the run unconverged
    pub max_iterations: usize,
    /// Stop when `|h| <= xtol * (xtol + |x|)`
    pub xtol: f64,
    /// Stop when an accepted step reduces the cost by less than `ftol * F`
    pub ftol: f64,
    /// Stop when every Jacobian column is this close to orthogonal to `r`
    pub gtol: f64,
    /// Initial damping relative to the largest diagonal entry of J^T J
    pub tau: f64,
    /// Damping increases tried per iteration
    pub max_damping_attempts: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: SOLVER_MAX_ITERATIONS,
            xtol: SOLVER_XTOL,
            ftol: SOLVER_FTOL,
            gtol: SOLVER_GTOL,
            tau: SOLVER_TAU,
            max_damping_attempts: SOLVER_MAX_DAMPING_ATTEMPTS,
        }
    }
}

/// Why the solver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Residuals vanished exactly
    ZeroResidual,
    /// Step size fell below `xtol`
    StepTolerance,
    /// Relative cost reduction fell below `ftol`
    CostTolerance,
    /// Residual orthogonal to the Jacobian columns within `gtol`
    GradientOrthogonal,
    /// Iteration cap reached
    MaxIterations,
    /// No damping level produced a cost reduction
    DampingExhausted,
}

impl Termination {
    pub fn is_converged(self) -> bool {
        !matches!(self, Termination::MaxIterations | Termination::DampingExhausted)
    }
}

/// Final state of a solver run
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub point: Point3,
    pub converged: bool,
    pub iterations: usize,
    /// `0.5 * |r|^2` at `point`
    pub cost: f64,
    pub termination: Termination,
    /// Residuals at `point`
    pub residuals: DVector<f64>,
    /// Jacobian at `point`
    pub jacobian: DMatrix<f64>,
}

impl SolverOutcome {
    pub fn residual_norm(&self) -> f64 {
        self.residuals.norm()
    }
}

/// Working state of one solver run.
///
/// Residual and Jacobian buffers are allocated once and reused every
/// iteration.
#[derive(Debug, Clone)]
pub struct SolverState {
    point: Point3,
    residuals: DVector<f64>,
    trial: DVector<f64>,
    jacobian: DMatrix<f64>,
    cost: f64,
    mu: f64,
    nu: f64,
    iterations: usize,
}

enum StepResult {
    Accepted { reduction: f64, previous_cost: f64, rho: f64 },
    Converged(Termination),
    Exhausted,
}

impl SolverState {
    pub fn new<M: ResidualModel + ?Sized>(model: &M, initial: Point3) -> Self {
        let m = model.residual_count();
        let mut residuals = DVector::zeros(m);
        model.residuals_into(&initial, &mut residuals);
        let cost = 0.5 * residuals.norm_squared();

        SolverState {
            point: initial,
            residuals,
            trial: DVector::zeros(m),
            jacobian: DMatrix::zeros(m, 3),
            cost,
            mu: 0.0,
            nu: 2.0,
            iterations: 0,
        }
    }

    pub fn point(&self) -> &Point3 {
        &self.point
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn damping(&self) -> f64 {
        self.mu
    }

    /// Try damping levels until a step reduces the cost.
    fn step<M: ResidualModel + ?Sized>(
        &mut self,
        model: &M,
        a: &Matrix3<f64>,
        g: &Vector3<f64>,
        options: &SolverOptions,
    ) -> StepResult {
        for attempt in 0..options.max_damping_attempts {
            let mut damped = *a;
            for i in 0..3 {
                damped[(i, i)] += self.mu;
            }

            let h = match solve_normal_equations(&damped, &(-g)) {
                Some(h) => h,
                None => {
                    self.increase_damping();
                    continue;
                }
            };

            let step_norm = h.norm();
            let tiny_step = step_norm <= options.xtol * (options.xtol + self.point.coords.norm());

            let candidate = self.point + h;
            model.residuals_into(&candidate, &mut self.trial);
            let new_cost = 0.5 * self.trial.norm_squared();

            if tiny_step {
                // Keep the last step when it does not make things worse
                if new_cost.is_finite() && new_cost <= self.cost {
                    self.point = candidate;
                    std::mem::swap(&mut self.residuals, &mut self.trial);
                    self.cost = new_cost;
                }
                return StepResult::Converged(Termination::StepTolerance);
            }

            let predicted = 0.5 * h.dot(&(h * self.mu - g));
            let actual = self.cost - new_cost;
            let rho = if predicted > 0.0 { actual / predicted } else { -1.0 };

            trace!(
                "attempt {}: mu={:.3e} |h|={:.3e} cost={:.6e} rho={:.3}",
                attempt, self.mu, step_norm, new_cost, rho
            );

            if new_cost.is_finite() && rho > 0.0 {
                let previous_cost = self.cost;
                self.point = candidate;
                std::mem::swap(&mut self.residuals, &mut self.trial);
                self.cost = new_cost;
                self.mu *= (1.0 / 3.0_f64).max(1.0 - (2.0 * rho - 1.0).powi(3));
                self.nu = 2.0;
                return StepResult::Accepted {
                    reduction: actual,
                    previous_cost,
                    rho,
                };
            }

            self.increase_damping();
        }

        StepResult::Exhausted
    }

    fn increase_damping(&mut self) {
        self.mu *= self.nu;
        self.nu *= 2.0;
    }
}

/// Minimize `0.5 * |r(x)|^2` starting from `initial`.
///
/// Never fails: a run that hits the iteration cap or cannot reduce the cost
/// returns its best point with `converged = false`. Callers that need to
/// reject unobservable solutions should check the returned Jacobian with
/// [`has_full_column_rank`].
pub fn solve<M, J>(model: &M, jacobian: &J, initial: Point3, options: &SolverOptions) -> SolverOutcome
where
    M: ResidualModel + ?Sized,
    J: JacobianProvider<M> + ?Sized,
{
    let mut state = SolverState::new(model, initial);

    let termination = loop {
        if state.cost == 0.0 {
            break Termination::ZeroResidual;
        }
        if state.iterations >= options.max_iterations {
            break Termination::MaxIterations;
        }

        jacobian.jacobian_into(model, &state.point, &state.residuals, &mut state.jacobian);

        if orthogonality(&state.jacobian, &state.residuals) <= options.gtol {
            break Termination::GradientOrthogonal;
        }

        let jt = state.jacobian.transpose();
        let a: Matrix3<f64> = (&jt * &state.jacobian).fixed_view::<3, 3>(0, 0).into_owned();
        let g: Vector3<f64> = (&jt * &state.residuals).fixed_rows::<3>(0).into_owned();

        if state.iterations == 0 {
            let max_diag = a.diagonal().max();
            state.mu = if max_diag > 0.0 {
                options.tau * max_diag
            } else {
                options.tau
            };
        }

        state.iterations += 1;

        match state.step(model, &a, &g, options) {
            StepResult::Accepted {
                reduction,
                previous_cost,
                rho,
            } => {
                debug!(
                    "iteration {}: cost={:.6e} mu={:.3e} rho={:.3}",
                    state.iterations, state.cost, state.mu, rho
                );
                if reduction < options.ftol * previous_cost && rho > 0.25 {
                    break Termination::CostTolerance;
                }
            }
            StepResult::Converged(termination) => break termination,
            StepResult::Exhausted => break Termination::DampingExhausted,
        }
    };

    // The stored Jacobian may predate the last accepted step
    jacobian.jacobian_into(model, &state.point, &state.residuals, &mut state.jacobian);

    debug!(
        "solver stopped after {} iterations: {:?}, cost={:.6e}",
        state.iterations, termination, state.cost
    );

    SolverOutcome {
        point: state.point,
        converged: termination.is_converged(),
        iterations: state.iterations,
        cost: state.cost,
        termination,
        residuals: state.residuals,
        jacobian: state.jacobian,
    }
}

/// Solve the 3x3 damped normal equations, falling back to LU when the
/// matrix is not numerically positive definite.
fn solve_normal_equations(a: &Matrix3<f64>, b: &Vector3<f64>) -> Option<Vector3<f64>> {
    let h = match a.cholesky() {
        Some(chol) => chol.solve(b),
        None => a.lu().solve(b)?,
    };
    if h.iter().all(|v| v.is_finite()) {
        Some(h)
    } else {
        None
    }
}

/// Largest cosine between the residual vector and a Jacobian column.
///
/// Zero columns are skipped and a zero residual gives zero.
fn orthogonality(jacobian: &DMatrix<f64>, residuals: &DVector<f64>) -> f64 {
    let r_norm = residuals.norm();
    if r_norm == 0.0 {
        return 0.0;
    }

    jacobian
        .column_iter()
        .filter_map(|col| {
            let c_norm = col.norm();
            (c_norm > 0.0).then(|| col.dot(residuals).abs() / (c_norm * r_norm))
        })
        .fold(0.0, f64::max)
}

/// Whether `matrix` has full column rank, judged by the ratio of its
/// smallest to largest singular value.
pub fn has_full_column_rank(matrix: &DMatrix<f64>, tolerance: f64) -> bool {
    if matrix.nrows() < matrix.ncols() {
        return false;
    }
    if !matrix.iter().all(|v| v.is_finite()) {
        return false;
    }

    let singular_values = matrix.clone().svd(false, false).singular_values;
    let max = singular_values.iter().cloned().fold(0.0, f64::max);
    let min = singular_values.iter().cloned().fold(f64::INFINITY, f64::min);

    max > 0.0 && min > tolerance * max
}
