//! Bearer-token authentication.
//!
//! Clients present an HMAC-signed JWT at upgrade time. Validation collapses
//! every failure mode into a single `Unauthorized` kind; callers are never
//! told which check failed.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The presented credential is missing or invalid
    #[error("unauthorized")]
    Unauthorized,

    /// The configured signing secret is empty
    #[error("authentication secret must not be empty")]
    EmptySecret,

    /// Token signing failed
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// The claim subset this service reads and mints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Validates bearer tokens presented by WebSocket clients.
pub struct Authenticator {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Creates an authenticator from the shared HMAC secret.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::EmptySecret`] if the secret is blank.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }

        // HMAC family only; a token signed with any other algorithm is
        // rejected before signature verification.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Validates the supplied token and returns its subject.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthorized`] for every failure mode.
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthorized);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::Unauthorized)?;

        let subject = data.claims.sub.trim();
        if subject.is_empty() {
            return Err(AuthError::Unauthorized);
        }

        Ok(subject.to_string())
    }

    /// Mints a short-lived HS256 token for the given subject.
    ///
    /// Used by operational tooling and tests; the service itself only
    /// validates.
    pub fn issue(&self, subject: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
            iat: Some(now.timestamp()),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}
