use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EncodingError;
use crate::symbols::{char_to_frequency, symbol_index};
use crate::{MAX_TOKEN_LEN, MIN_TOKEN_LEN, TOKEN_PREFIX};

/// Opaque payment reference carried over the acoustic channel
///
/// Always upper-case, drawn entirely from the symbol alphabet, and between
/// `MIN_TOKEN_LEN` and `MAX_TOKEN_LEN` characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

impl Token {
    /// Validate a token against the alphabet and length limits.
    /// Lower-case letters are folded to upper case first, so backend ids
    /// written as `pay_…` are accepted.
    pub fn parse(raw: &str) -> Result<Self, EncodingError> {
        let normalized = raw.to_ascii_uppercase();

        for (position, character) in normalized.chars().enumerate() {
            if symbol_index(character).is_none() {
                return Err(EncodingError::InvalidCharacter { character, position });
            }
        }

        let len = normalized.chars().count();
        if len < MIN_TOKEN_LEN {
            return Err(EncodingError::TooShort { len, min: MIN_TOKEN_LEN });
        }
        if len > MAX_TOKEN_LEN {
            return Err(EncodingError::TooLong { len, max: MAX_TOKEN_LEN });
        }

        Ok(Self(normalized))
    }

    /// Derive the transmitted token from a backend payment identifier:
    /// `PAY_` followed by the last `hex_chars` hex digits of the id.
    /// Non-hex characters (UUID hyphens and the like) are skipped.
    pub fn from_payment_id(payment_id: &str, hex_chars: usize) -> Result<Self, EncodingError> {
        let hex: Vec<char> = payment_id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let start = hex.len().saturating_sub(hex_chars);
        let suffix: String = hex[start..].iter().collect();
        Self::parse(&format!("{}{}", TOKEN_PREFIX, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_payment_prefix(&self) -> bool {
        self.0.starts_with(TOKEN_PREFIX)
    }

    /// Tone frequency for each character, in transmission order
    pub fn frequencies(&self) -> Vec<f32> {
        // Every character was validated in parse()
        self.0.chars().filter_map(char_to_frequency).collect()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Token {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Token {
    type Error = EncodingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
