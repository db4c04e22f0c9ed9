pub mod constants;
pub mod error;
pub mod geometry;
pub mod residual;
pub mod jacobian;
pub mod solver;
pub mod locate;
pub mod simulation;
pub mod batch;
pub mod output;
pub mod config;

pub use error::{Degeneracy, InvalidInput, LocateError, SimulationError};
pub use geometry::{travel_times as compute_travel_times, Point3, StationSet};
pub use locate::{default_initial_guess, localize, Localization, Locator};
pub use solver::{SolverOptions, Termination};
