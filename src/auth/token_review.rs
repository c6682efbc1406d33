//! TokenReview fallback
//!
//! When OIDC validation fails and the fallback is enabled, the presented
//! token is posted to the upstream's TokenReview endpoint using the proxy's
//! own credentials. A positive verdict lets the request pass through with
//! its original headers intact.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use std::path::PathBuf;
use tracing::debug;

use crate::config::UpstreamOptions;
use crate::error::Error;
use crate::proxy::transport::{build_upstream_client, load_bearer};

use super::{ReviewToken, UserInfo};

/// Typed TokenReview failure
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// The upstream authoritatively rejected the token
    #[error("token review rejected the token")]
    Unauthenticated,

    /// The review could not be performed (transport error or non-2xx)
    #[error("token review unavailable: {0}")]
    Unavailable(String),
}

/// Client for the upstream TokenReview endpoint
pub struct TokenReviewClient {
    http: reqwest::Client,
    url: String,
    token_file: Option<PathBuf>,
    audiences: Vec<String>,
}

impl TokenReviewClient {
    /// Create a client from the upstream configuration.
    ///
    /// `audiences` are the API audiences the upstream should validate the
    /// token against.
    pub fn new(upstream: &UpstreamOptions, audiences: Vec<String>) -> Result<Self, Error> {
        let http = build_upstream_client(upstream, true, false)?;
        let url = format!(
            "{}{}/apis/authentication.k8s.io/v1/tokenreviews",
            upstream.host.trim_end_matches('/'),
            upstream.api_path_prefix
        );

        Ok(Self {
            http,
            url,
            token_file: upstream.token_file.clone(),
            audiences,
        })
    }
}

#[async_trait]
impl ReviewToken for TokenReviewClient {
    async fn review(&self, token: &str) -> Result<UserInfo, ReviewError> {
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: if self.audiences.is_empty() {
                    None
                } else {
                    Some(self.audiences.clone())
                },
            },
            status: None,
        };

        let mut request = self.http.post(&self.url).json(&review);
        if let Some(bearer) = load_bearer(self.token_file.as_deref())
            .await
            .map_err(|e| ReviewError::Unavailable(e.to_string()))?
        {
            request = request.bearer_auth(&*bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReviewError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReviewError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let result: TokenReview = response
            .json()
            .await
            .map_err(|e| ReviewError::Unavailable(format!("invalid response: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| ReviewError::Unavailable("response carried no status".into()))?;

        user_from_status(status)
    }
}

/// Interpret a TokenReview verdict
fn user_from_status(status: TokenReviewStatus) -> Result<UserInfo, ReviewError> {
    if !status.authenticated.unwrap_or(false) {
        return Err(ReviewError::Unauthenticated);
    }

    let user = status
        .user
        .ok_or_else(|| ReviewError::Unavailable("authenticated but no user info".into()))?;

    let info = UserInfo {
        name: user.username.unwrap_or_default(),
        groups: user.groups.unwrap_or_default(),
        extra: user
            .extra
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
    };

    debug!(user = %info.name, "token review validated token");

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo as K8sUserInfo;

    #[test]
    fn test_authenticated_status_yields_user() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(K8sUserInfo {
                username: Some("system:serviceaccount:default:builder".to_string()),
                groups: Some(vec!["system:serviceaccounts".to_string()]),
                uid: None,
                extra: None,
            }),
            error: None,
            audiences: None,
        };

        let user = user_from_status(status).unwrap();
        assert_eq!(user.name, "system:serviceaccount:default:builder");
        assert_eq!(user.groups, vec!["system:serviceaccounts"]);
        assert!(user.extra.is_empty());
    }

    #[test]
    fn test_unauthenticated_status_is_rejected() {
        let status = TokenReviewStatus {
            authenticated: Some(false),
            user: None,
            error: Some("token expired".to_string()),
            audiences: None,
        };

        assert!(matches!(
            user_from_status(status),
            Err(ReviewError::Unauthenticated)
        ));
    }

    #[test]
    fn test_missing_authenticated_field_is_rejected() {
        let status = TokenReviewStatus {
            authenticated: None,
            user: None,
            error: None,
            audiences: None,
        };

        assert!(matches!(
            user_from_status(status),
            Err(ReviewError::Unauthenticated)
        ));
    }

    #[test]
    fn test_authenticated_without_user_is_unavailable() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: None,
            error: None,
            audiences: None,
        };

        assert!(matches!(
            user_from_status(status),
            Err(ReviewError::Unavailable(_))
        ));
    }

    #[test]
    fn test_extra_attributes_are_carried_over() {
        let mut extra = std::collections::BTreeMap::new();
        extra.insert("scopes".to_string(), vec!["read".to_string()]);

        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(K8sUserInfo {
                username: Some("builder".to_string()),
                groups: None,
                uid: None,
                extra: Some(extra),
            }),
            error: None,
            audiences: None,
        };

        let user = user_from_status(status).unwrap();
        assert_eq!(user.extra["scopes"], vec!["read"]);
    }
}
