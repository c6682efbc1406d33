//! Request authentication
//!
//! Validates bearer tokens against the configured OIDC issuer, with an
//! optional fallback that asks the upstream itself to review the token.

mod authenticator;
mod jwks;
mod oidc;
mod token_review;

pub use authenticator::{
    extract_bearer_token, Outcome, RequestAuthenticator, ReviewToken, VerifyToken,
};
pub use jwks::JwksCache;
pub use oidc::OidcVerifier;
pub use token_review::{ReviewError, TokenReviewClient};

#[cfg(test)]
pub use authenticator::{MockReviewToken, MockVerifyToken};

use std::collections::HashMap;

/// Verified user identity asserted towards the upstream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// Username (from the configured claim, prefix applied)
    pub name: String,
    /// Group memberships
    pub groups: Vec<String>,
    /// Additional attributes, one ordered value list per key
    pub extra: HashMap<String, Vec<String>>,
}

/// Typed token verification failure
///
/// Variants never carry the token itself; their rendering is safe to log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Token is not a well-formed compact JWS
    #[error("malformed token")]
    Malformed,

    /// Signature did not verify, no key matched, or the algorithm is not
    /// accepted
    #[error("invalid token signature")]
    SignatureInvalid,

    /// Token is expired or not yet valid
    #[error("token outside its validity window")]
    Expired,

    /// `iss` does not match the configured issuer
    #[error("token issuer mismatch")]
    IssuerMismatch,

    /// `aud` contains none of the accepted audiences
    #[error("token audience mismatch")]
    AudienceMismatch,

    /// A required claim is absent or differs from the configured value
    #[error("required claim {0} missing or mismatched")]
    RequiredClaimMismatch(String),

    /// The resolved username is empty
    #[error("username claim missing or empty")]
    NoUsername,

    /// The signing keys could not be fetched from the issuer
    #[error("issuer signing keys unavailable")]
    JwksUnavailable,
}
