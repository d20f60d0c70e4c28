//! The credential verifier seam.
//!
//! Token issuance and account storage live outside this workspace; the
//! handshake only needs something that turns a raw token into an identity.

use std::collections::HashMap;

use async_trait::async_trait;
use pulse_core::UserId;
use serde_json::Value;

use crate::errors::AuthFailure;

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    /// Account the token belongs to.
    pub user_id: UserId,
    /// Whether the account may connect.
    pub is_active: bool,
    /// Remaining token claims, passed through to the principal.
    pub claims: Value,
}

/// Verifies raw bearer tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify `raw_token` (already stripped of any `Bearer ` prefix).
    async fn verify(&self, raw_token: &str) -> Result<VerifiedIdentity, AuthFailure>;
}

/// Verifier backed by a fixed token table. Intended for development setups
/// and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl StaticVerifier {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as an active account for `user_id`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        let _ = self.tokens.insert(
            token.into(),
            VerifiedIdentity {
                user_id: user_id.into(),
                is_active: true,
                claims: Value::Null,
            },
        );
        self
    }

    /// Accept `token` but report the account as inactive.
    #[must_use]
    pub fn with_inactive_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<UserId>,
    ) -> Self {
        let _ = self.tokens.insert(
            token.into(),
            VerifiedIdentity {
                user_id: user_id.into(),
                is_active: false,
                claims: Value::Null,
            },
        );
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn verify(&self, raw_token: &str) -> Result<VerifiedIdentity, AuthFailure> {
        self.tokens
            .get(raw_token)
            .cloned()
            .ok_or_else(|| AuthFailure::Invalid("unknown token".into()))
    }
}
