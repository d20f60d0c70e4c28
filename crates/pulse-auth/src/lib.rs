//! # pulse-auth
//!
//! Admission control for sync connections.
//!
//! - [`AuthHandshake`]: turns a raw bearer credential into a [`Principal`]
//!   or an [`AuthFailure`] (`missing`, `invalid`, `expired`,
//!   `inactive-account`)
//! - [`CredentialVerifier`]: the seam to the account service
//! - [`JwtVerifier`]: HS256 tokens via `jsonwebtoken`
//! - [`StaticVerifier`]: fixed token table for development and tests

#![deny(unsafe_code)]

pub mod errors;
pub mod handshake;
pub mod jwt;
pub mod verifier;

pub use errors::AuthFailure;
pub use handshake::{AuthHandshake, Principal};
pub use jwt::JwtVerifier;
pub use verifier::{CredentialVerifier, StaticVerifier, VerifiedIdentity};
