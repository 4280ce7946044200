// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token verification at the WebSocket handshake. Token *issuance* is the
//! job of the surrounding application; we only check what it signed.

use crate::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who is on the other end of a connection, according to their token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token has an empty subject")]
    EmptySubject,
}

/// Called once per connection, before the client gets anywhere near a
/// session.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// The user id.
    sub: String,
    /// Display name shown to collaborators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Expiry as a Unix timestamp.
    exp: u64,
}

/// Validates HS256-signed JWTs against a shared secret.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        let display_name = data.claims.name.unwrap_or_else(|| data.claims.sub.clone());
        Ok(Identity {
            user_id: UserId::from(data.claims.sub),
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use pretty_assertions::assert_eq;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unix_time(offset: i64) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs();
        now.saturating_add_signed(offset)
    }

    fn token(secret: &str, sub: &str, name: Option<&str>, exp: u64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            name: name.map(str::to_string),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("should sign token")
    }

    #[test]
    fn accepts_a_valid_token() {
        let verifier = JwtVerifier::new("sesame");
        let identity = verifier
            .verify(&token("sesame", "alice", Some("Alice"), unix_time(3600)))
            .expect("token should verify");
        assert_eq!(
            identity,
            Identity {
                user_id: UserId::from("alice"),
                display_name: "Alice".to_string(),
            }
        );
    }

    #[test]
    fn display_name_falls_back_to_user_id() {
        let verifier = JwtVerifier::new("sesame");
        let identity = verifier
            .verify(&token("sesame", "alice", None, unix_time(3600)))
            .expect("token should verify");
        assert_eq!(identity.display_name, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("sesame");
        assert!(verifier
            .verify(&token("other", "alice", None, unix_time(3600)))
            .is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = JwtVerifier::new("sesame");
        assert!(verifier
            .verify(&token("sesame", "alice", None, unix_time(-3600)))
            .is_err());
    }

    #[test]
    fn rejects_garbage() {
        let verifier = JwtVerifier::new("sesame");
        assert!(verifier.verify("not-a-token").is_err());
        assert!(verifier.verify("").is_err());
    }
}
