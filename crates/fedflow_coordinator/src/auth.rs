//! Capability tokens for registered clients.
//!
//! Tokens are opaque 16-byte random values, hex-encoded to 32
//! characters. They gate availability, not confidentiality, so plain
//! comparison is sufficient. The token<->client mapping is injective
//! and stable until explicit revocation.

use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;

const TOKEN_BYTES: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("client {0} is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct AuthStore {
    client_tokens: HashMap<String, String>,
    token_clients: HashMap<String, String>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh capability token for `client_id`.
    ///
    /// Regenerates on the (astronomically unlikely) collision with an
    /// existing token so the mapping stays injective.
    pub fn issue(&mut self, client_id: &str) -> Result<String, AuthError> {
        if self.client_tokens.contains_key(client_id) {
            return Err(AuthError::AlreadyRegistered(client_id.to_string()));
        }

        let mut token = generate_token();
        while self.token_clients.contains_key(&token) {
            token = generate_token();
        }

        self.client_tokens
            .insert(client_id.to_string(), token.clone());
        self.token_clients
            .insert(token.clone(), client_id.to_string());
        Ok(token)
    }

    /// Validate a token, optionally pinning it to a specific client.
    pub fn validate(&self, token: Option<&str>, client_id: Option<&str>) -> bool {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return false;
        };
        match self.token_clients.get(token) {
            Some(owner) => client_id.map_or(true, |id| owner == id),
            None => false,
        }
    }

    /// The client a token belongs to, if it is live.
    pub fn client_for_token(&self, token: &str) -> Option<&str> {
        self.token_clients.get(token).map(String::as_str)
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.client_tokens.contains_key(client_id)
    }

    /// Remove both directions of the mapping for `client_id`.
    pub fn revoke(&mut self, client_id: &str) -> bool {
        match self.client_tokens.remove(client_id) {
            Some(token) => {
                self.token_clients.remove(&token);
                true
            }
            None => false,
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
