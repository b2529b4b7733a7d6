//! `--config` file loading
//!
//! The file is JSON with optional `decoder` and `escalation` sections; any
//! field left out keeps its built-in default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use soundpay_core::{AttemptProfile, DecoderConfig, EscalationConfig};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub decoder: DecoderConfig,
    pub escalation: EscalationConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.decoder.validate()?;
        settings.escalation.validate()?;
        Ok(settings)
    }

    /// Profile for a 1-based attempt number
    pub fn attempt(&self, attempt: usize) -> Result<AttemptProfile> {
        let profiles = &self.escalation.profiles;
        attempt
            .checked_sub(1)
            .and_then(|index| profiles.get(index))
            .copied()
            .ok_or_else(|| {
                CliError::Usage(format!("attempt must be between 1 and {}", profiles.len()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_means_defaults() {
        assert_eq!(Settings::load(None).unwrap(), Settings::default());
    }

    #[test]
    fn test_partial_sections() {
        let settings = Settings::from_json(
            r#"{ "decoder": { "noise_threshold": 0.05 }, "escalation": { "poll_interval_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(settings.decoder.noise_threshold, 0.05);
        assert_eq!(settings.decoder.fft_size, DecoderConfig::default().fft_size);
        assert_eq!(settings.escalation.poll_interval_ms, 250);
        assert_eq!(settings.escalation.profiles.len(), 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = Settings::from_json(r#"{ "escalation": { "profiles": [] } }"#);
        assert!(matches!(result, Err(CliError::Core(_))));
        assert!(matches!(Settings::from_json("{ nope"), Err(CliError::Config(_))));
    }

    #[test]
    fn test_attempt_lookup() {
        let settings = Settings::default();
        assert_eq!(settings.attempt(1).unwrap(), AttemptProfile::default_ladder()[0]);
        assert_eq!(settings.attempt(3).unwrap().volume, 1.0);
        assert!(settings.attempt(0).is_err());
        assert!(settings.attempt(4).is_err());
    }
}
