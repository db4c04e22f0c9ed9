// Geometry and travel time model
//
// Local Cartesian frame in meters: x east, y north, z up. Hypocenters have
// negative z. Travel times assume a single constant velocity (no attenuation,
// refraction or anisotropy).

use nalgebra as na;

use crate::error::InvalidInput;

/// A position in the local frame (m)
pub type Point3 = na::Point3<f64>;

/// Straight-line distance between two points in meters
#[inline]
pub fn distance(a: &Point3, b: &Point3) -> f64 {
    na::distance(a, b)
}

/// Ordered, immutable set of station positions.
///
/// Guarantees at least one station, finite coordinates and no two stations
/// at the same position. Whether the set is large and spread out enough to
/// locate a source is checked by [`crate::locate::localize`].
#[derive(Debug, Clone, PartialEq)]
pub struct StationSet {
    positions: Vec<Point3>,
}

impl StationSet {
    pub fn new(positions: Vec<Point3>) -> Result<Self, InvalidInput> {
        if positions.is_empty() {
            return Err(InvalidInput::NoStations);
        }

        for (index, p) in positions.iter().enumerate() {
            if !p.iter().all(|c| c.is_finite()) {
                return Err(InvalidInput::NonFiniteStation { index });
            }
        }

        for first in 0..positions.len() {
            for second in (first + 1)..positions.len() {
                if positions[first] == positions[second] {
                    return Err(InvalidInput::DuplicateStations { first, second });
                }
            }
        }

        Ok(StationSet { positions })
    }

    /// Build from plain `[x, y, z]` triples
    pub fn from_coords(coords: &[[f64; 3]]) -> Result<Self, InvalidInput> {
        Self::new(coords.iter().map(|c| Point3::new(c[0], c[1], c[2])).collect())
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Point3> {
        self.positions.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point3> {
        self.positions.iter()
    }

    pub fn positions(&self) -> &[Point3] {
        &self.positions
    }

    /// Mean station position
    pub fn centroid(&self) -> Point3 {
        let sum = self
            .positions
            .iter()
            .fold(na::Vector3::zeros(), |acc, p| acc + p.coords);
        Point3::from(sum / self.positions.len() as f64)
    }
}

impl<'a> IntoIterator for &'a StationSet {
    type Item = &'a Point3;
    type IntoIter = std::slice::Iter<'a, Point3>;

    fn into_iter(self) -> Self::IntoIter {
        self.positions.iter()
    }
}

/// Absolute travel time (s) from `source` to every station.
///
/// `t_i = |station_i - source| / velocity`. The caller guarantees
/// `velocity > 0`; [`crate::locate::localize`] validates it.
pub fn travel_times(source: &Point3, stations: &StationSet, velocity: f64) -> Vec<f64> {
    stations
        .iter()
        .map(|station| distance(station, source) / velocity)
        .collect()
}

/// Index of the first station reached by the signal.
///
/// Returns `None` for an empty slice or when every entry is NaN. Ties go to
/// the lowest index.
pub fn reference_index(times: &[f64]) -> Option<usize> {
    times
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &t)| match best {
            Some((_, best_t)) if best_t <= t => best,
            _ => Some((i, t)),
        })
        .map(|(i, _)| i)
}

/// Times relative to the station at `reference`.
///
/// The reference entry is exactly zero. Returns `None` if `reference` is out
/// of bounds.
pub fn relative_times(times: &[f64], reference: usize) -> Option<Vec<f64>> {
    let base = *times.get(reference)?;
    Some(
        times
            .iter()
            .enumerate()
            .map(|(i, &t)| if i == reference { 0.0 } else { t - base })
            .collect(),
    )
}
