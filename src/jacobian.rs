// Jacobian providers for the least-squares solver
//
// The solver only needs d(residuals)/d(x, y, z). Forward differences work for
// any residual model; the analytic provider is specific to arrival residuals.

use nalgebra as na;
use na::{DMatrix, DVector};

use crate::geometry::Point3;
use crate::residual::{ArrivalResiduals, ResidualModel};

/// Computes the `m x 3` Jacobian of a residual model
pub trait JacobianProvider<M: ResidualModel + ?Sized> {
    /// Fill `out` with the Jacobian at `x`.
    ///
    /// `residuals` holds the model evaluated at `x`, so providers that
    /// difference against it don't need to re-evaluate.
    fn jacobian_into(
        &self,
        model: &M,
        x: &Point3,
        residuals: &DVector<f64>,
        out: &mut DMatrix<f64>,
    );
}

/// One-sided finite differences with a per-coordinate scaled step
#[derive(Debug, Clone, Copy)]
pub struct ForwardDifference {
    /// Step as a fraction of `max(|x_j|, 1)`
    pub relative_step: f64,
}

impl Default for ForwardDifference {
    fn default() -> Self {
        ForwardDifference {
            relative_step: f64::EPSILON.sqrt(),
        }
    }
}

impl<M: ResidualModel + ?Sized> JacobianProvider<M> for ForwardDifference {
    fn jacobian_into(
        &self,
        model: &M,
        x: &Point3,
        residuals: &DVector<f64>,
        out: &mut DMatrix<f64>,
    ) {
        let mut perturbed = DVector::zeros(residuals.len());

        for j in 0..3 {
            let mut x_plus = *x;
            let h = self.relative_step * x[j].abs().max(1.0);
            x_plus[j] += h;
            // Use the step actually representable in floating point
            let h = x_plus[j] - x[j];

            model.residuals_into(&x_plus, &mut perturbed);
            for i in 0..residuals.len() {
                out[(i, j)] = (perturbed[i] - residuals[i]) / h;
            }
        }
    }
}

/// Closed-form derivative of the relative travel time residuals.
///
/// Row `i` is `u_i / v - u_ref / v`, where `u_i` is the unit vector from
/// station `i` to the candidate. A candidate sitting exactly on a station has
/// no defined gradient for that station; its contribution is taken as zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Analytic;

fn unit_gradient(station: &Point3, x: &Point3, velocity: f64) -> na::Vector3<f64> {
    let diff = x - station;
    let d = diff.norm();
    if d > 0.0 {
        diff / (d * velocity)
    } else {
        na::Vector3::zeros()
    }
}

impl JacobianProvider<ArrivalResiduals<'_>> for Analytic {
    fn jacobian_into(
        &self,
        model: &ArrivalResiduals<'_>,
        x: &Point3,
        _residuals: &DVector<f64>,
        out: &mut DMatrix<f64>,
    ) {
        let positions = model.stations.positions();
        let reference = unit_gradient(&positions[model.reference], x, model.velocity);

        for (i, station) in positions.iter().enumerate() {
            let row = if i == model.reference {
                na::Vector3::zeros()
            } else {
                unit_gradient(station, x, model.velocity) - reference
            };
            for j in 0..3 {
                out[(i, j)] = row[j];
            }
        }
    }
}

/// Choice of Jacobian provider for arrival residuals, selectable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JacobianKind {
    /// Forward finite differences
    #[default]
    Forward,
    /// Closed-form gradient
    Analytic,
}

impl JacobianProvider<ArrivalResiduals<'_>> for JacobianKind {
    fn jacobian_into(
        &self,
        model: &ArrivalResiduals<'_>,
        x: &Point3,
        residuals: &DVector<f64>,
        out: &mut DMatrix<f64>,
    ) {
        match self {
            JacobianKind::Forward => {
                ForwardDifference::default().jacobian_into(model, x, residuals, out)
            }
            JacobianKind::Analytic => Analytic.jacobian_into(model, x, residuals, out),
        }
    }
}
