//! Routing tokens: client-visible room names that also pick a backend

use rand::Rng;
use std::fmt;

use crate::util::hash::stable_hash;

pub const TOKEN_MAX_LEN: usize = 32;

/// Length of tokens minted by the server
pub const GENERATED_TOKEN_LEN: usize = 6;

const GENERATED_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room token must be 1-32 characters of A-Z, a-z, 0-9, '_' or '-'")]
pub struct InvalidToken;

/// Validated room token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingToken(String);

impl RoutingToken {
    pub fn parse(raw: &str) -> Result<Self, InvalidToken> {
        let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
        if raw.is_empty() || raw.len() > TOKEN_MAX_LEN || !raw.chars().all(valid_char) {
            return Err(InvalidToken);
        }
        Ok(Self(raw.to_string()))
    }

    /// Mint a fresh short token (unambiguous uppercase letters and digits)
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..GENERATED_TOKEN_LEN)
            .map(|_| GENERATED_CHARSET[rng.gen_range(0..GENERATED_CHARSET.len())] as char)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Maze seed shared by every process that hosts this token
    pub fn seed(&self) -> u64 {
        stable_hash(&self.0)
    }
}

impl fmt::Display for RoutingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
