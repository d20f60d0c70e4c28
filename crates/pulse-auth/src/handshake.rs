//! Connection admission check.

use std::sync::Arc;

use pulse_core::UserId;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::AuthFailure;
use crate::verifier::CredentialVerifier;

/// An authenticated caller, ready to be registered.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// Account the connection belongs to.
    pub user_id: UserId,
    /// Claims carried by the credential.
    pub claims: Value,
}

/// Validates a bearer credential before a connection is admitted.
///
/// Holds no state of its own and persists nothing.
#[derive(Clone)]
pub struct AuthHandshake {
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthHandshake {
    /// Create a handshake backed by `verifier`.
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    /// Accept or refuse a raw credential.
    ///
    /// A leading `Bearer ` scheme and surrounding whitespace are ignored.
    #[instrument(skip_all)]
    pub async fn accept(&self, raw_credential: Option<&str>) -> Result<Principal, AuthFailure> {
        let token = raw_credential
            .map(strip_bearer)
            .filter(|t| !t.is_empty())
            .ok_or(AuthFailure::Missing)?;

        let identity = self.verifier.verify(token).await?;
        if !identity.is_active {
            debug!(user_id = %identity.user_id, "refusing inactive account");
            return Err(AuthFailure::InactiveAccount);
        }

        Ok(Principal {
            user_id: identity.user_id,
            claims: identity.claims,
        })
    }
}

fn strip_bearer(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(scheme) = trimmed.get(..6) else {
        return trimmed;
    };
    let rest = &trimmed[6..];
    if scheme.eq_ignore_ascii_case("bearer")
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        rest.trim_start()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{MockCredentialVerifier, StaticVerifier, VerifiedIdentity};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn handshake() -> AuthHandshake {
        AuthHandshake::new(Arc::new(
            StaticVerifier::new()
                .with_token("good", "alice")
                .with_inactive_token("frozen", "bob"),
        ))
    }

    #[tokio::test]
    async fn missing_credential() {
        assert_matches!(handshake().accept(None).await, Err(AuthFailure::Missing));
    }

    #[tokio::test]
    async fn blank_credential_is_missing() {
        assert_matches!(handshake().accept(Some("   ")).await, Err(AuthFailure::Missing));
        assert_matches!(
            handshake().accept(Some("Bearer ")).await,
            Err(AuthFailure::Missing)
        );
    }

    #[tokio::test]
    async fn bearer_prefix_is_stripped() {
        let principal = handshake().accept(Some("Bearer good")).await.unwrap();
        assert_eq!(principal.user_id, UserId::from("alice"));
        let principal = handshake().accept(Some("bearer   good ")).await.unwrap();
        assert_eq!(principal.user_id, UserId::from("alice"));
    }

    #[tokio::test]
    async fn bare_token_accepted() {
        let principal = handshake().accept(Some("good")).await.unwrap();
        assert_eq!(principal.user_id, UserId::from("alice"));
    }

    #[tokio::test]
    async fn inactive_account_refused() {
        assert_matches!(
            handshake().accept(Some("frozen")).await,
            Err(AuthFailure::InactiveAccount)
        );
    }

    #[tokio::test]
    async fn verifier_failure_propagates() {
        let mut mock = MockCredentialVerifier::new();
        let _ = mock
            .expect_verify()
            .withf(|token| token == "stale")
            .times(1)
            .returning(|_| Err(AuthFailure::Expired));
        let handshake = AuthHandshake::new(Arc::new(mock));
        assert_matches!(
            handshake.accept(Some("Bearer stale")).await,
            Err(AuthFailure::Expired)
        );
    }

    #[tokio::test]
    async fn claims_pass_through() {
        let mut mock = MockCredentialVerifier::new();
        let _ = mock.expect_verify().returning(|_| {
            Ok(VerifiedIdentity {
                user_id: UserId::from("carol"),
                is_active: true,
                claims: json!({"plan": "pro"}),
            })
        });
        let principal = AuthHandshake::new(Arc::new(mock))
            .accept(Some("anything"))
            .await
            .unwrap();
        assert_eq!(principal.claims["plan"], "pro");
    }

    #[test]
    fn strip_bearer_leaves_other_schemes() {
        assert_eq!(strip_bearer("Basic abc"), "Basic abc");
        assert_eq!(strip_bearer("tok"), "tok");
    }
}
