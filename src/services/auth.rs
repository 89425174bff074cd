//! Bearer token verification
//!
//! Tokens are RS256 JWTs issued by Clerk. The `kid` in the header selects
//! the verification key from the [`SigningKeyCache`]; a signature mismatch on
//! a known `kid` invalidates the cache and is retried once against a freshly
//! fetched key set, which covers key material rotated under the same `kid`.

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::services::jwks::{KeyError, SigningKeyCache};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token has expired")]
    Expired,
    #[error("token issuer is not trusted")]
    UntrustedIssuer,
    #[error("token not signed by a known key ({0})")]
    UnknownKey(String),
    #[error("authentication service unavailable")]
    ServiceUnavailable,
}

impl From<KeyError> for AuthError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::UnknownKey(kid) => AuthError::UnknownKey(kid),
            KeyError::ServiceUnavailable => AuthError::ServiceUnavailable,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

#[derive(Clone)]
pub struct Authenticator {
    keys: SigningKeyCache,
    validation: Validation,
}

impl Authenticator {
    pub fn new(keys: SigningKeyCache, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;

        Self { keys, validation }
    }

    /// Verify `token` and return the user id from its `sub` claim
    pub async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Malformed(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("token header has no kid".to_string()))?;

        let key = self.keys.get_key(&kid).await?;

        let claims = match self.verify(token, &key) {
            Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => {
                tracing::warn!("Signature mismatch for kid {}, refreshing signing keys", kid);
                self.keys.invalidate();
                let key = self.keys.get_key(&kid).await?;
                self.verify(token, &key)
            }
            verified => verified,
        }
        .map_err(|e| classify(e, &kid))?;

        claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AuthError::Malformed("token missing user ID (sub claim)".to_string()))
    }

    fn verify(&self, token: &str, key: &DecodingKey) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, key, &self.validation).map(|data| data.claims)
    }
}

fn classify(e: jsonwebtoken::errors::Error, kid: &str) -> AuthError {
    let error = match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::UntrustedIssuer,
        ErrorKind::InvalidSignature => AuthError::UnknownKey(kid.to_string()),
        _ => AuthError::Malformed(e.to_string()),
    };

    tracing::warn!("Rejected token: {}", error);
    error
}
