// Error types for hypocenter localization

use thiserror::Error;

/// Result type for localization operations
pub type LocateResult<T> = Result<T, LocateError>;

/// Fatal outcomes of a localization run.
///
/// Non-convergence is not an error: it is reported through
/// [`crate::locate::Localization::converged`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocateError {
    /// Inputs violate the localization contract
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),

    /// The geometry leaves the location unobservable
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(#[from] Degeneracy),
}

/// Contract violations detected before solving
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidInput {
    #[error("station set is empty")]
    NoStations,

    #[error("station {index} has a non-finite coordinate")]
    NonFiniteStation { index: usize },

    #[error("stations {first} and {second} share the same coordinates")]
    DuplicateStations { first: usize, second: usize },

    #[error("velocity must be positive and finite, got {0}")]
    InvalidVelocity(f64),

    #[error("{times} measured times for {stations} stations")]
    LengthMismatch { stations: usize, times: usize },

    #[error("reference index {index} out of bounds for {stations} stations")]
    ReferenceOutOfBounds { index: usize, stations: usize },

    #[error("measured time at reference station {index} must be exactly 0, got {value}")]
    ReferenceNotZero { index: usize, value: f64 },

    #[error("measured time for station {index} is not finite")]
    NonFiniteTime { index: usize },

    #[error("initial guess is not finite")]
    NonFiniteGuess,
}

/// Geometries for which no damping makes the location observable
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Degeneracy {
    #[error("{stations} stations cannot constrain 3 unknowns from relative times (need at least 4)")]
    Underdetermined { stations: usize },

    #[error("stations are coplanar, depth is ambiguous")]
    CoplanarStations,

    #[error("Jacobian lost full column rank at iteration {iteration}")]
    RankDeficientJacobian { iteration: usize },
}

/// Errors from the scenario generator and batch runner
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("noise standard deviation must be finite and non-negative, got {0}")]
    InvalidNoise(f64),

    #[error("radius must be positive and finite, got {0}")]
    InvalidRadius(f64),

    #[error("depth range {min}..{max} is invalid")]
    InvalidDepthRange { min: f64, max: f64 },

    #[error("arrival at station {station} is {offset} s from the first arrival, outside the calendar range")]
    TimestampOverflow { station: usize, offset: f64 },

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("trial task failed: {0}")]
    TaskFailed(String),
}

impl From<InvalidInput> for SimulationError {
    fn from(err: InvalidInput) -> Self {
        SimulationError::Locate(err.into())
    }
}

impl LocateError {
    /// Whether the error comes from unobservable geometry rather than bad input.
    pub fn is_degeneracy(&self) -> bool {
        matches!(self, LocateError::NumericalDegeneracy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: LocateError = InvalidInput::InvalidVelocity(-1.0).into();
        assert_eq!(err.to_string(), "invalid input: velocity must be positive and finite, got -1");
        assert!(!err.is_degeneracy());

        let err: LocateError = Degeneracy::Underdetermined { stations: 3 }.into();
        assert!(err.is_degeneracy());
        assert!(err.to_string().contains("3 stations"));
    }

    #[test]
    fn test_simulation_error_wraps_locate() {
        let err: SimulationError = InvalidInput::NoStations.into();
        assert_eq!(err.to_string(), "invalid input: station set is empty");
    }
}
