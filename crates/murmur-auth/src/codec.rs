use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use murmur_types::api::{Claims, TokenKind};
use murmur_types::models::Identity;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("credential expired")]
    Expired,

    #[error("credential malformed")]
    Malformed,

    #[error("failed to sign credential: {0}")]
    Signing(String),
}

/// Secrets and lifetimes for both token kinds. The two secrets are
/// independent; a token signed with one never verifies under the other.
#[derive(Clone)]
pub struct TokenConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

/// A freshly signed token together with the expiry baked into it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SigningKey {
    fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

/// Stateless signer/verifier for access and refresh bearer tokens (HS256).
pub struct TokenCodec {
    access: SigningKey,
    refresh: SigningKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(config: &TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // No grace period: an expired token is expired.
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            access: SigningKey::new(&config.access_secret, config.access_ttl),
            refresh: SigningKey::new(&config.refresh_secret, config.refresh_ttl),
            validation,
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh.ttl
    }

    pub fn issue_access(&self, identity: &Identity) -> Result<IssuedToken, TokenError> {
        issue(&self.access, TokenKind::Access, identity)
    }

    pub fn issue_refresh(&self, identity: &Identity) -> Result<IssuedToken, TokenError> {
        issue(&self.refresh, TokenKind::Refresh, identity)
    }

    pub fn verify_access(&self, token: &str) -> Result<Identity, TokenError> {
        self.verify(&self.access, TokenKind::Access, token)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Identity, TokenError> {
        self.verify(&self.refresh, TokenKind::Refresh, token)
    }

    fn verify(&self, key: &SigningKey, kind: TokenKind, token: &str) -> Result<Identity, TokenError> {
        let data = decode::<Claims>(token, &key.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Malformed,
            }
        })?;

        if data.claims.typ != kind {
            return Err(TokenError::Malformed);
        }

        Ok(data.claims.identity())
    }
}

fn issue(key: &SigningKey, kind: TokenKind, identity: &Identity) -> Result<IssuedToken, TokenError> {
    let now = Utc::now();
    let expires_at = now + key.ttl;

    let claims = Claims {
        sub: identity.user_id,
        username: identity.username.clone(),
        email: identity.email.clone(),
        typ: kind,
        jti: Uuid::new_v4(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    let token = encode(&Header::new(Algorithm::HS256), &claims, &key.encoding)
        .map_err(|e| TokenError::Signing(e.to_string()))?;

    Ok(IssuedToken { token, expires_at })
}
