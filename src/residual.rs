// Relative arrival time residuals
//
// The solver minimizes the sum of squares of these residuals. Only time
// differences are observed, so the unknown origin time drops out and the
// problem has three unknowns: the hypocenter coordinates.

use nalgebra as na;
use na::DVector;

use crate::geometry::{distance, Point3, StationSet};

/// A residual vector function of a 3D point
pub trait ResidualModel {
    /// Number of residuals produced per evaluation
    fn residual_count(&self) -> usize;

    /// Write the residuals at `x` into `out` (length `residual_count()`).
    fn residuals_into(&self, x: &Point3, out: &mut DVector<f64>);

    /// Allocating convenience wrapper around `residuals_into`
    fn residuals(&self, x: &Point3) -> DVector<f64> {
        let mut out = DVector::zeros(self.residual_count());
        self.residuals_into(x, &mut out);
        out
    }
}

/// Measured relative arrival times against the constant-velocity model.
///
/// `measured[reference]` must be exactly zero; [`crate::locate::localize`]
/// validates this before building the model.
#[derive(Debug, Clone, Copy)]
pub struct ArrivalResiduals<'a> {
    pub stations: &'a StationSet,
    pub measured: &'a [f64],
    pub velocity: f64,
    pub reference: usize,
}

impl<'a> ArrivalResiduals<'a> {
    pub fn new(
        stations: &'a StationSet,
        measured: &'a [f64],
        velocity: f64,
        reference: usize,
    ) -> Self {
        ArrivalResiduals {
            stations,
            measured,
            velocity,
            reference,
        }
    }
}

impl ResidualModel for ArrivalResiduals<'_> {
    fn residual_count(&self) -> usize {
        self.stations.len()
    }

    fn residuals_into(&self, x: &Point3, out: &mut DVector<f64>) {
        let positions = self.stations.positions();
        let reference_time = distance(&positions[self.reference], x) / self.velocity;

        for (i, station) in positions.iter().enumerate() {
            let predicted = if i == self.reference {
                0.0
            } else {
                distance(station, x) / self.velocity - reference_time
            };
            out[i] = predicted - self.measured[i];
        }
    }
}

/// Residuals of `candidate` against measured relative times.
///
/// `r_i = (t_i - t_ref) - measured_i` with `t` the modelled travel times.
pub fn residuals(
    candidate: &Point3,
    stations: &StationSet,
    measured: &[f64],
    velocity: f64,
    reference: usize,
) -> DVector<f64> {
    ArrivalResiduals::new(stations, measured, velocity, reference).residuals(candidate)
}
