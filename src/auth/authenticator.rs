//! Request authentication pipeline stage
//!
//! Extracts the bearer token, drives the OIDC verifier and the optional
//! TokenReview delegate, and decides how the request may be forwarded. Both
//! dependencies sit behind traits so the stage is testable without an issuer
//! or an upstream.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use tracing::debug;

use crate::error::Error;

use super::token_review::ReviewError;
use super::{UserInfo, VerifyError};

/// Capability to verify a bearer token locally
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerifyToken: Send + Sync {
    /// Validate the token and extract the identity it asserts
    async fn verify(&self, token: &str) -> Result<UserInfo, VerifyError>;
}

/// Capability to have the upstream review a token
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewToken: Send + Sync {
    /// Ask the upstream whether the token is valid
    async fn review(&self, token: &str) -> Result<UserInfo, ReviewError>;
}

/// How an admitted request is to be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Forward with impersonation headers synthesized from the verified
    /// identity; the client's credentials are replaced with the proxy's
    Impersonate(UserInfo),
    /// Forward unmodified, original credentials intact
    Passthrough,
}

/// Authenticates requests ahead of forwarding
pub struct RequestAuthenticator {
    verifier: Arc<dyn VerifyToken>,
    reviewer: Option<Arc<dyn ReviewToken>>,
    disable_impersonation: bool,
}

impl RequestAuthenticator {
    /// Create an authenticator.
    ///
    /// `reviewer` is the TokenReview fallback, present only when enabled.
    pub fn new(
        verifier: Arc<dyn VerifyToken>,
        reviewer: Option<Arc<dyn ReviewToken>>,
        disable_impersonation: bool,
    ) -> Self {
        Self {
            verifier,
            reviewer,
            disable_impersonation,
        }
    }

    /// Authenticate a request from its headers.
    ///
    /// The rejection reason is never exposed to the client; every
    /// authentication failure surfaces as `Unauthorized`.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Outcome, Error> {
        let token = extract_bearer_token(headers).ok_or(Error::Unauthorized)?;

        match self.verifier.verify(token).await {
            Ok(user) => {
                // An authenticator that produced an empty name cannot be
                // asserted upstream.
                if user.name.is_empty() {
                    return Err(Error::NoUsername);
                }

                if self.disable_impersonation {
                    Ok(Outcome::Passthrough)
                } else {
                    Ok(Outcome::Impersonate(user))
                }
            }
            Err(VerifyError::NoUsername) => Err(Error::NoUsername),
            Err(e) => {
                debug!(error = %e, "OIDC validation failed");

                let Some(reviewer) = &self.reviewer else {
                    return Err(Error::Unauthorized);
                };

                match reviewer.review(token).await {
                    Ok(user) => {
                        debug!(user = %user.name, "token accepted by upstream review");
                        Ok(Outcome::Passthrough)
                    }
                    Err(err) => {
                        debug!(error = %err, "token review did not validate token");
                        Err(Error::Unauthorized)
                    }
                }
            }
        }
    }
}

/// Extract the bearer token from the `Authorization` header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
