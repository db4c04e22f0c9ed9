// Shared constants for hypocenter localization and the simulation driver

// --- Scenario defaults ---

/// Number of stations in a generated network.
pub const DEFAULT_STATION_COUNT: usize = 7;

/// Horizontal radius of the station footprint (m).
pub const DEFAULT_RADIUS: f64 = 30_000.0;

/// Stations get a uniform elevation in [-jitter, +jitter] (m).
pub const STATION_ELEVATION_JITTER: f64 = 500.0;

/// Minimum hypocenter depth below datum (m, positive down).
pub const DEFAULT_MIN_DEPTH: f64 = 500.0;

/// Maximum hypocenter depth below datum (m, positive down).
pub const DEFAULT_MAX_DEPTH: f64 = 10_000.0;

/// Wave velocity (m/s).
pub const DEFAULT_VELOCITY: f64 = 5_000.0;

/// Standard deviation of arrival time noise (s).
pub const DEFAULT_NOISE_STD: f64 = 0.01;

/// Depth used for the initial guess (m, z axis points up).
pub const INITIAL_GUESS_DEPTH: f64 = -5_000.0;

/// Fewest stations giving a well-posed 3D solve from relative times.
pub const MIN_STATIONS: usize = 4;

// --- Solver defaults ---

/// Maximum solver iterations.
pub const SOLVER_MAX_ITERATIONS: usize = 100;

/// Relative step tolerance.
pub const SOLVER_XTOL: f64 = 1e-10;

/// Relative cost reduction tolerance.
pub const SOLVER_FTOL: f64 = 1e-10;

/// Orthogonality tolerance between residual and Jacobian columns.
pub const SOLVER_GTOL: f64 = 1e-10;

/// Initial damping scale relative to the largest diagonal of J^T J.
pub const SOLVER_TAU: f64 = 1e-3;

/// Damping increases tried per iteration before giving up.
pub const SOLVER_MAX_DAMPING_ATTEMPTS: usize = 10;

/// Singular value ratio below which the Jacobian is treated as rank deficient.
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Singular value ratio below which the station geometry is treated as planar.
pub const COPLANAR_TOLERANCE: f64 = 1e-9;

// --- Noise sweep defaults ---

/// Noise levels (s) swept by default.
pub const DEFAULT_SWEEP_LEVELS: [f64; 4] = [0.0, 0.01, 0.05, 0.1];

/// Trials run per noise level by default.
pub const DEFAULT_TRIALS_PER_LEVEL: usize = 50;
