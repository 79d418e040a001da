use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalError {
    /// The caller broke an API contract (length mismatch, unsupported option, empty input).
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("optimizer failure: {0}")]
    Optimizer(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl CalError {
    pub fn contract(message: impl Into<String>) -> Self {
        CalError::Contract(message.into())
    }

    pub fn is_contract(&self) -> bool {
        matches!(self, CalError::Contract(_))
    }
}

impl From<argmin::core::Error> for CalError {
    fn from(err: argmin::core::Error) -> CalError {
        CalError::Optimizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CalError>;

/// Checks that two parallel arrays have the same length.
pub fn ensure_same_len(what: &str, a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(CalError::Contract(format!(
            "{what}: length mismatch ({a} != {b})"
        )));
    }
    Ok(())
}
