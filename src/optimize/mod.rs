//! Processing-parameter optimization: filter sweeps and charge-trapping corrections.

pub mod ctc;
pub mod enc;
pub mod fwhm;
pub mod sg_window;
pub mod sweep;

pub use ctc::{
    ChargeTrappingCorrection, DtCutoffPolicy, LqCorrection, optimize_energy_ctc, optimize_lq_ctc,
};
pub use enc::enc_sweep;
pub use fwhm::fwhm_sweep;
pub use sg_window::{SurvivalInput, sg_window_sweep, survival_fraction};
pub use sweep::{SweepPoint, SweepResult, sweep};
