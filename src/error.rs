use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The configuration can never produce a working filter.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// A partition could not be filled within the retry budget.
    #[error("partition {partition} could not be constructed after {attempts} attempts")]
    ConstructionFailure { partition: usize, attempts: usize },

    #[error("partition {partition} cannot address {requested} buckets")]
    CapacityExhausted { partition: usize, requested: usize },

    #[error("{operation} is not supported by this filter configuration")]
    UnsupportedOperation { operation: &'static str },

    #[error("bit range {offset}+{width} is out of bounds for length {len}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        len: usize,
    },
}

impl FilterError {
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        FilterError::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
