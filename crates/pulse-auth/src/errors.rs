//! Handshake failure reasons.

use serde::Serialize;

/// Why a connection was refused before admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum AuthFailure {
    /// No credential was presented.
    #[error("authentication token missing")]
    Missing,

    /// The credential could not be verified.
    #[error("invalid authentication token: {0}")]
    Invalid(String),

    /// The credential was valid but has expired.
    #[error("authentication token expired")]
    Expired,

    /// The credential names an account that is not active.
    #[error("account is inactive")]
    InactiveAccount,
}

impl AuthFailure {
    /// Machine-readable reason sent to the transport.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid(_) => "invalid",
            Self::Expired => "expired",
            Self::InactiveAccount => "inactive-account",
        }
    }
}
