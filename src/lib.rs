#![warn(clippy::all, rust_2018_idioms)]

//! Energy and pulse-shape calibration of HPGe detector spectra.
//!
//! Binned maximum-likelihood peak fits, chi-square curve fits with full covariance,
//! goodness-of-fit tests, calibration curves built from a reference line list, and the
//! sweeps and correction fitters used to tune the processing chain.

pub mod calibration;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fitter;
pub mod histoer;
pub mod optimize;
pub mod util;

pub use config::{CalibrationConfig, CtcConfig, PeakFitConfig, SurvivalFractionConfig, SweepConfig};
pub use diagnostics::Diagnostics;
pub use error::{CalError, Result};
pub use util::measurement::Measurement;
