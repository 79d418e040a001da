pub mod curve;
pub mod function;

pub use curve::{CalibrationCurve, EnergyCalibration, ResolutionCurve, calibrate_energy};
pub use function::CalibrationFunction;
