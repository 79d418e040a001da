pub mod cuts;
pub mod histogram1d;
pub mod peak_finder;
pub mod peak_stats;
