pub mod estimator;
pub mod orientation;
pub mod smooth;

pub use estimator::{CycleOutput, Estimator, EstimatorState};
pub use orientation::rotation_from_corners;
pub use smooth::WindowSmoother;
