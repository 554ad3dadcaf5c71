//! Session token type

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a generated session token
const TOKEN_LEN: usize = 16;

/// Opaque identifier for one logical shell session.
///
/// Generated by the client at first connect and kept stable across any
/// number of transport reconnections. Also used as the session directory
/// suffix on the remote host, so it is restricted to alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Parse a token from its string form.
    ///
    /// Rejects anything that could escape a path component, since the
    /// daemon derives its runtime directory from the token.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > 64 || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    /// The token's string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_alphanumeric() {
        let token = SessionToken::generate();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_is_unique() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_rejects_path_escapes() {
        assert!(SessionToken::parse("../../etc").is_none());
        assert!(SessionToken::parse("").is_none());
        assert!(SessionToken::parse("has space").is_none());
        assert!(SessionToken::parse("Abc123XYZ").is_some());
    }
}
