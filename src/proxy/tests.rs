use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Request, Response, StatusCode};

use crate::auth::{
    MockReviewToken, MockVerifyToken, RequestAuthenticator, ReviewToken, UserInfo, VerifyError,
    VerifyToken,
};
use crate::config::ProxyOptions;
use crate::error::Error;
use crate::server::AppState;

use super::engine::{proxy_handler, strip_hop_by_hop};
use super::transport::{ForwardMode, MockDispatchUpstream};

fn remote() -> SocketAddr {
    "10.0.0.7:44321".parse().unwrap()
}

fn alice() -> UserInfo {
    UserInfo {
        name: "alice".to_string(),
        groups: vec!["dev".to_string()],
        extra: Default::default(),
    }
}

fn verifier_ok() -> MockVerifyToken {
    let mut verifier = MockVerifyToken::new();
    verifier.expect_verify().returning(|_| Ok(alice()));
    verifier
}

fn app_state(
    verifier: MockVerifyToken,
    reviewer: Option<Arc<dyn ReviewToken>>,
    options: ProxyOptions,
    upstream: MockDispatchUpstream,
) -> AppState {
    let disable_impersonation = options.disable_impersonation;
    AppState {
        authenticator: Arc::new(RequestAuthenticator::new(
            Arc::new(verifier) as Arc<dyn VerifyToken>,
            reviewer,
            disable_impersonation,
        )),
        options: Arc::new(options),
        upstream: Arc::new(upstream),
    }
}

fn get_request(headers: Vec<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri("/api/v1/pods");
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::empty()).unwrap()
}

fn ok_response() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap())
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

// ========================================================================
// Impersonated forwarding
// ========================================================================

#[tokio::test]
async fn test_valid_token_forwards_with_impersonation() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|mode, req| {
        assert_eq!(mode, ForwardMode::Impersonate);
        assert_eq!(
            header_values(req.headers(), "impersonate-user"),
            vec!["alice"]
        );
        assert_eq!(
            header_values(req.headers(), "impersonate-group"),
            vec!["dev", "system:authenticated"]
        );
        // The client's credentials never reach the upstream on an
        // impersonated request.
        assert!(req.headers().get(header::AUTHORIZATION).is_none());
        ok_response()
    });

    let state = app_state(verifier_ok(), None, ProxyOptions::default(), upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    let response = proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_replayed_token_yields_identical_impersonation_headers() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().times(2).returning(|_, req| {
        assert_eq!(
            header_values(req.headers(), "impersonate-user"),
            vec!["alice"]
        );
        assert_eq!(
            header_values(req.headers(), "impersonate-group"),
            vec!["dev", "system:authenticated"]
        );
        ok_response()
    });

    let state = app_state(verifier_ok(), None, ProxyOptions::default(), upstream);

    for _ in 0..2 {
        let request = get_request(vec![("Authorization", "Bearer token")]);
        proxy_handler(State(state.clone()), ConnectInfo(remote()), request)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_client_ip_extra_header_forwarded() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|_, req| {
        assert_eq!(
            header_values(req.headers(), "impersonate-extra-remote-client-ip"),
            vec!["10.0.0.7:44321"]
        );
        ok_response()
    });

    let options = ProxyOptions {
        extra_user_headers_client_ip_enabled: true,
        ..Default::default()
    };
    let state = app_state(verifier_ok(), None, options, upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_static_extra_user_headers_forwarded() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|_, req| {
        assert_eq!(
            header_values(req.headers(), "impersonate-extra-org"),
            vec!["acme"]
        );
        ok_response()
    });

    let mut extra_user_headers = HashMap::new();
    extra_user_headers.insert("org".to_string(), vec!["acme".to_string()]);
    let options = ProxyOptions {
        extra_user_headers,
        ..Default::default()
    };
    let state = app_state(verifier_ok(), None, options, upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
}

// ========================================================================
// Impersonation gate
// ========================================================================

#[tokio::test]
async fn test_inbound_impersonation_rejected_before_upstream() {
    // No expectations: any dispatch or verify call panics the test.
    let upstream = MockDispatchUpstream::new();
    let verifier = MockVerifyToken::new();

    let state = app_state(verifier, None, ProxyOptions::default(), upstream);
    let request = get_request(vec![
        ("Authorization", "Bearer token"),
        ("Impersonate-User", "bob"),
    ]);

    let result = proxy_handler(State(state), ConnectInfo(remote()), request).await;
    assert!(matches!(result, Err(Error::ImpersonationAttempt)));
}

#[tokio::test]
async fn test_inbound_impersonation_rejected_even_when_impersonation_disabled() {
    let upstream = MockDispatchUpstream::new();
    let verifier = MockVerifyToken::new();

    let options = ProxyOptions {
        disable_impersonation: true,
        ..Default::default()
    };
    let state = app_state(verifier, None, options, upstream);
    let request = get_request(vec![
        ("Authorization", "Bearer token"),
        ("Impersonate-Extra-Scopes", "admin"),
    ]);

    let result = proxy_handler(State(state), ConnectInfo(remote()), request).await;
    assert!(matches!(result, Err(Error::ImpersonationAttempt)));
}

// ========================================================================
// Passthrough modes
// ========================================================================

#[tokio::test]
async fn test_disabled_impersonation_preserves_request() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|mode, req| {
        assert_eq!(mode, ForwardMode::Passthrough);
        // Original credentials and headers survive; hop-by-hop does not.
        assert_eq!(
            header_values(req.headers(), "authorization"),
            vec!["Bearer token"]
        );
        assert_eq!(header_values(req.headers(), "accept"), vec!["application/json"]);
        assert!(req.headers().get("keep-alive").is_none());
        assert!(req.headers().get("impersonate-user").is_none());
        assert!(req.headers().get("impersonate-group").is_none());
        ok_response()
    });

    let options = ProxyOptions {
        disable_impersonation: true,
        ..Default::default()
    };
    let state = app_state(verifier_ok(), None, options, upstream);
    let request = get_request(vec![
        ("Authorization", "Bearer token"),
        ("Accept", "application/json"),
        ("Keep-Alive", "timeout=5"),
    ]);

    let response = proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_token_review_fallback_passes_request_through() {
    let mut verifier = MockVerifyToken::new();
    verifier
        .expect_verify()
        .returning(|_| Err(VerifyError::SignatureInvalid));

    let mut reviewer = MockReviewToken::new();
    reviewer.expect_review().returning(|_| {
        Ok(UserInfo {
            name: "system:serviceaccount:default:builder".to_string(),
            ..Default::default()
        })
    });

    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|mode, req| {
        assert_eq!(mode, ForwardMode::Passthrough);
        assert_eq!(
            header_values(req.headers(), "authorization"),
            vec!["Bearer token"]
        );
        assert!(req.headers().get("impersonate-user").is_none());
        ok_response()
    });

    let options = ProxyOptions {
        token_review: true,
        ..Default::default()
    };
    let state = app_state(verifier, Some(Arc::new(reviewer)), options, upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    let response = proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ========================================================================
// Rejections
// ========================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let upstream = MockDispatchUpstream::new();
    let verifier = MockVerifyToken::new();

    let state = app_state(verifier, None, ProxyOptions::default(), upstream);
    let request = get_request(vec![]);

    let result = proxy_handler(State(state), ConnectInfo(remote()), request).await;
    assert!(matches!(result, Err(Error::Unauthorized)));
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() {
    let mut verifier = MockVerifyToken::new();
    verifier
        .expect_verify()
        .returning(|_| Err(VerifyError::Expired));

    let upstream = MockDispatchUpstream::new();
    let state = app_state(verifier, None, ProxyOptions::default(), upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    let result = proxy_handler(State(state), ConnectInfo(remote()), request).await;
    assert!(matches!(result, Err(Error::Unauthorized)));
}

#[tokio::test]
async fn test_empty_username_rejected_before_upstream() {
    let mut verifier = MockVerifyToken::new();
    verifier
        .expect_verify()
        .returning(|_| Err(VerifyError::NoUsername));

    let upstream = MockDispatchUpstream::new();
    let state = app_state(verifier, None, ProxyOptions::default(), upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    let result = proxy_handler(State(state), ConnectInfo(remote()), request).await;
    assert!(matches!(result, Err(Error::NoUsername)));
}

// ========================================================================
// Hop-by-hop handling
// ========================================================================

#[test]
fn test_strip_hop_by_hop_fixed_set() {
    let mut headers = HeaderMap::new();
    headers.insert("keep-alive", "timeout=5".parse().unwrap());
    headers.insert("transfer-encoding", "chunked".parse().unwrap());
    headers.insert("content-type", "application/json".parse().unwrap());

    strip_hop_by_hop(&mut headers);

    assert!(headers.get("keep-alive").is_none());
    assert!(headers.get("transfer-encoding").is_none());
    assert!(headers.get("content-type").is_some());
}

#[test]
fn test_strip_hop_by_hop_connection_named() {
    let mut headers = HeaderMap::new();
    headers.insert("connection", "close, x-session-token".parse().unwrap());
    headers.insert("x-session-token", "abc".parse().unwrap());
    headers.insert("x-request-id", "1".parse().unwrap());

    strip_hop_by_hop(&mut headers);

    assert!(headers.get("connection").is_none());
    assert!(headers.get("x-session-token").is_none());
    assert!(headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn test_response_hop_by_hop_stripped() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|_, _| {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("keep-alive", "timeout=5")
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap())
    });

    let state = app_state(verifier_ok(), None, ProxyOptions::default(), upstream);
    let request = get_request(vec![("Authorization", "Bearer token")]);

    let response = proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
    assert!(response.headers().get("keep-alive").is_none());
    assert_eq!(
        header_values(response.headers(), "content-type"),
        vec!["application/json"]
    );
}

#[tokio::test]
async fn test_upgrade_headers_restored_for_upgrade_request() {
    let mut upstream = MockDispatchUpstream::new();
    upstream.expect_dispatch().returning(|_, req| {
        assert_eq!(header_values(req.headers(), "connection"), vec!["Upgrade"]);
        assert_eq!(header_values(req.headers(), "upgrade"), vec!["SPDY/3.1"]);
        ok_response()
    });

    let state = app_state(verifier_ok(), None, ProxyOptions::default(), upstream);
    let request = get_request(vec![
        ("Authorization", "Bearer token"),
        ("Connection", "Upgrade"),
        ("Upgrade", "SPDY/3.1"),
    ]);

    proxy_handler(State(state), ConnectInfo(remote()), request)
        .await
        .unwrap();
}
