use soundpay_core::{BackendError, EncodingError, SoundPayError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] SoundPayError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
