pub mod dual;
pub mod measurement;
pub mod statistics;
