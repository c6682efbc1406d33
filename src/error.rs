//! Error types for the proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Authentication failed (missing or invalid token, failed TokenReview)
    #[error("Unauthorized")]
    Unauthorized,

    /// Request carried inbound impersonation headers
    #[error("impersonation header in client request")]
    ImpersonationAttempt,

    /// Token verified but the resolved username is empty
    #[error("no username available in verified identity")]
    NoUsername,

    /// Failed to reach or proxy to the upstream API server
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // The client is never told why a token was rejected; detail goes to
        // the log at a verbosity that excludes the token itself.
        match self {
            Error::Unauthorized => {
                debug!("rejecting unauthenticated request");
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            Error::ImpersonationAttempt => {
                debug!("rejecting client impersonation request");
                (
                    StatusCode::FORBIDDEN,
                    "Impersonation requests are disabled when using kube-oidc-proxy",
                )
                    .into_response()
            }
            Error::NoUsername => {
                debug!("rejecting verified identity with empty username");
                (
                    StatusCode::FORBIDDEN,
                    "Username claim not available in OIDC Issuer response",
                )
                    .into_response()
            }
            Error::Upstream(msg) => {
                warn!(error = %msg, "upstream request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
            Error::Config(msg) | Error::Internal(msg) => {
                error!(error = %msg, "internal proxy error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_maps_to_401() {
        let response = Error::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_impersonation_attempt_maps_to_403() {
        let response = Error::ImpersonationAttempt.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_no_username_maps_to_403() {
        let response = Error::NoUsername.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_upstream_maps_to_502() {
        let response = Error::Upstream("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_internal_maps_to_500() {
        let response = Error::Internal("invariant violated".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
