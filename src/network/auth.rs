//! Player Authentication
//!
//! Turns the first message of a connection into a [`PlayerId`]. Tokens are
//! JWTs issued by an external provider; the server only validates them.
//! Anonymous sessions get a random id when the server allows them.

use std::collections::HashSet;

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::ids::PlayerId;
use crate::network::protocol::AuthRequest;

const PLAYER_ID_DOMAIN: &[u8] = b"shared-components-player:";

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Skip expiry validation (tests only).
    pub skip_expiry: bool,
    /// Admit players without a token.
    pub allow_anonymous: bool,
}

impl AuthConfig {
    /// Create config from `SHARED_COMPONENTS_AUTH_*` environment variables.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };
        Self {
            issuer: std::env::var("SHARED_COMPONENTS_AUTH_ISSUER").ok(),
            audience: std::env::var("SHARED_COMPONENTS_AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("SHARED_COMPONENTS_AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("SHARED_COMPONENTS_AUTH_SECRET").ok(),
            skip_expiry: flag("SHARED_COMPONENTS_AUTH_SKIP_EXPIRY"),
            allow_anonymous: flag("SHARED_COMPONENTS_AUTH_ALLOW_ANONYMOUS"),
        }
    }

    /// True if a verification key is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    fn validation(&self) -> Validation {
        let algorithm = if self.public_key_pem.is_some() {
            Algorithm::RS256
        } else {
            Algorithm::HS256
        };

        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims = HashSet::new();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if self.skip_expiry {
            validation.validate_exp = false;
        }
        validation
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match (&self.public_key_pem, &self.secret) {
            (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e))),
            (None, Some(secret)) => Ok(DecodingKey::from_secret(secret.as_bytes())),
            (None, None) => Err(AuthError::NotConfigured),
        }
    }
}

/// Claims expected from the auth provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the provider's user id.
    pub sub: String,
    /// Expiry (Unix seconds). Zero means none.
    #[serde(default)]
    pub exp: u64,
    /// Issued at.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Stable player id derived from the subject.
    pub fn player_id(&self) -> PlayerId {
        let mut hasher = Sha256::new();
        hasher.update(PLAYER_ID_DOMAIN);
        hasher.update(self.sub.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        PlayerId::new(id)
    }

    fn is_expired(&self) -> bool {
        self.exp > 0 && Utc::now().timestamp() > self.exp as i64
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No verification key and anonymous sessions are off.
    #[error("authentication not configured")]
    NotConfigured,
    /// No token and anonymous sessions are off.
    #[error("token required")]
    TokenRequired,
    /// Malformed token.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature check failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token expired.
    #[error("token expired")]
    Expired,
    /// Wrong issuer.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Wrong audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// A required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Other decoding failure.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a JWT and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let key = config.decoding_key()?;
    let claims = decode::<TokenClaims>(token, &key, &config.validation())
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    if !config.skip_expiry && claims.is_expired() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Player id for an auth request.
pub fn authenticate(request: &AuthRequest, config: &AuthConfig) -> Result<PlayerId, AuthError> {
    if request.token.is_empty() {
        return if config.allow_anonymous {
            Ok(PlayerId::random())
        } else {
            Err(AuthError::TokenRequired)
        };
    }
    if !config.is_configured() && config.allow_anonymous {
        return Ok(PlayerId::random());
    }
    validate_token(&request.token, config).map(|claims| claims.player_id())
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
