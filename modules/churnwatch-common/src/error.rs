use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChurnWatchError {
    #[error("Store write failed after {attempts} attempts: {last_error}")]
    StoreExhausted { attempts: u32, last_error: String },

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
