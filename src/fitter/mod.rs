pub mod binned;
pub mod chi2;
pub mod common;
pub mod goodness;
pub mod models;
pub mod optimizer;
