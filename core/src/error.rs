use thiserror::Error;

use crate::backend::BackendError;

/// Rejections raised before any audio is produced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Character {character:?} at position {position} is not in the symbol alphabet")]
    InvalidCharacter { character: char, position: usize },

    #[error("Token is {len} characters, minimum is {min}")]
    TooShort { len: usize, min: usize },

    #[error("Token is {len} characters, maximum is {max}")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum SoundPayError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Audio permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio device busy")]
    DeviceBusy,

    #[error("No signal detected")]
    NoSignalDetected,

    #[error("Payment not confirmed after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },

    #[error("Payment status poll failed: {0}")]
    TransientPollError(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("FFT error: {0}")]
    Fft(String),
}

impl SoundPayError {
    /// Errors the user has to act on (fix the input, grant access, plug in a device).
    ///
    /// Everything else is either benign or recovered automatically.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            SoundPayError::Encoding(_)
                | SoundPayError::PermissionDenied(_)
                | SoundPayError::DeviceUnavailable(_)
        )
    }

    /// `NoSignalDetected` only means nothing has arrived yet
    pub fn is_benign(&self) -> bool {
        matches!(self, SoundPayError::NoSignalDetected | SoundPayError::TransientPollError(_))
    }
}

pub type Result<T> = std::result::Result<T, SoundPayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actionable_classification() {
        let encoding = SoundPayError::from(EncodingError::TooShort { len: 3, min: 8 });
        assert!(encoding.is_user_actionable());
        assert!(SoundPayError::PermissionDenied("mic".into()).is_user_actionable());
        assert!(!SoundPayError::NoSignalDetected.is_user_actionable());
        assert!(!SoundPayError::AttemptsExhausted { attempts: 3 }.is_user_actionable());
    }

    #[test]
    fn test_benign_classification() {
        assert!(SoundPayError::NoSignalDetected.is_benign());
        assert!(SoundPayError::TransientPollError("timeout".into()).is_benign());
        assert!(!SoundPayError::DeviceBusy.is_benign());
    }

    #[test]
    fn test_invalid_character_message() {
        let err = EncodingError::InvalidCharacter { character: '#', position: 4 };
        assert_eq!(
            err.to_string(),
            "Character '#' at position 4 is not in the symbol alphabet"
        );
    }
}
