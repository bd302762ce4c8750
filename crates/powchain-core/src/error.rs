use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The worker pool could not be brought up.
    #[error("could not start {requested} mining workers: {reason}")]
    ResourceExhaustion { requested: usize, reason: String },

    #[error("nonce space exhausted at difficulty {difficulty} after {attempts} attempts")]
    SearchExhausted { difficulty: u32, attempts: u64 },

    #[error("invalid chain at block {index}: {reason}")]
    InvalidChain { index: u64, reason: String },
}

impl Error {
    pub(crate) fn invalid_difficulty(difficulty: u32) -> Self {
        Error::InvalidConfiguration(format!(
            "difficulty {difficulty} exceeds the maximum of {}",
            crate::constants::MAX_DIFFICULTY
        ))
    }
}
