//! HS256 JWT verifier.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use pulse_core::UserId;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::AuthFailure;
use crate::verifier::{CredentialVerifier, VerifiedIdentity};

/// Claims the verifier reads. Everything else is passed through.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn default_active() -> bool {
    true
}

/// Verifies HS256-signed JWTs issued by the account service.
///
/// The `sub` claim is the user id. An optional boolean `active` claim marks
/// disabled accounts; it defaults to `true`.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .field("leeway", &self.validation.leeway)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require the `aud` claim to contain `audience`.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Clock skew tolerated on `exp`, in seconds.
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.validation.leeway = secs;
        self
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, raw_token: &str) -> Result<VerifiedIdentity, AuthFailure> {
        let data = jsonwebtoken::decode::<TokenClaims>(raw_token, &self.key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "jwt rejected");
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthFailure::Expired,
                    _ => AuthFailure::Invalid(e.to_string()),
                }
            })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthFailure::Invalid("empty subject".into()));
        }

        Ok(VerifiedIdentity {
            user_id: UserId::from(claims.sub),
            is_active: claims.active,
            claims: Value::Object(claims.rest),
        })
    }
}
