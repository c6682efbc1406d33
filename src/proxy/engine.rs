//! Reverse proxy engine
//!
//! Each request runs the same pipeline: impersonation gate, authentication,
//! impersonation header synthesis, upstream dispatch. Authentication
//! completes fully before any byte is forwarded. Bodies stream in both
//! directions and hop-by-hop headers are stripped on both legs.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use tracing::debug;

use crate::auth::Outcome;
use crate::error::Error;
use crate::server::AppState;

use super::impersonation::{contains_impersonation, impersonation_headers};
use super::transport::ForwardMode;

/// Hop-by-hop headers never forwarded by an intermediary (RFC 7230)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle one proxied request
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Result<Response<Body>, Error> {
    // Inbound impersonation headers are rejected before anything else; a
    // client must not be able to assert an identity regardless of what
    // token it presents.
    if contains_impersonation(request.headers()) {
        debug!(remote = %remote, "rejecting request with inbound impersonation headers");
        return Err(Error::ImpersonationAttempt);
    }

    let outcome = state.authenticator.authenticate(request.headers()).await?;

    let upgrade_protocol = requested_upgrade(request.headers());
    strip_hop_by_hop(request.headers_mut());
    // The client library writes the upstream authority.
    request.headers_mut().remove(header::HOST);

    // Upgrade headers are hop-by-hop but carry the handshake; restore them
    // for requests that asked to upgrade.
    if let Some(protocol) = upgrade_protocol {
        request
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        request.headers_mut().insert(header::UPGRADE, protocol);
    }

    let mode = match outcome {
        Outcome::Impersonate(user) => {
            debug!(remote = %remote, user = %user.name, "forwarding with impersonation");
            request.headers_mut().remove(header::AUTHORIZATION);
            let remote_addr = remote.to_string();
            for (name, value) in
                impersonation_headers(&user, &state.options, Some(&remote_addr))?
            {
                request.headers_mut().append(name, value);
            }
            ForwardMode::Impersonate
        }
        Outcome::Passthrough => {
            debug!(remote = %remote, "forwarding without impersonation");
            ForwardMode::Passthrough
        }
    };

    let mut response = state.upstream.dispatch(mode, request).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        strip_hop_by_hop(response.headers_mut());
    }

    Ok(response)
}

/// The protocol the client asked to upgrade to, when the request is a
/// proper upgrade request (`Connection` lists `upgrade` and `Upgrade` names
/// a protocol).
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let connection = headers.get(header::CONNECTION)?.to_str().ok()?;
    let wants_upgrade = connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Strip hop-by-hop headers: anything the `Connection` header names plus
/// the fixed RFC 7230 set.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut named: Vec<String> = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            named.extend(
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty()),
            );
        }
    }

    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
