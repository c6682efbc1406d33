//! kube-oidc-proxy
//!
//! An authenticating reverse proxy that sits in front of a Kubernetes API
//! server. Clients authenticate with OIDC bearer tokens; the proxy verifies
//! them against the issuer's JWKS and forwards requests with impersonation
//! headers the upstream trusts.
//!
//! # Architecture
//!
//! ```text
//! kubectl ──► TLS listener ──► gate ──► authenticate ──► impersonate ──► K8s API
//!                              (403)    (OIDC / review)  (headers)
//! ```
//!
//! Each request runs a fixed pipeline: inbound impersonation headers are
//! rejected, the bearer token is verified (optionally falling back to an
//! upstream TokenReview), impersonation headers are synthesized from the
//! verified identity, and the request is streamed to the upstream with the
//! proxy's own credentials. With impersonation disabled, or when the
//! upstream reviewed the token, the request passes through unmodified.

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod probe;
pub mod proxy;
pub mod server;

pub use auth::{
    JwksCache, OidcVerifier, Outcome, RequestAuthenticator, TokenReviewClient, UserInfo,
};
pub use config::{OidcOptions, ProxyOptions, ServingOptions, UpstreamOptions};
pub use error::{Error, Result};
pub use proxy::{DispatchUpstream, ForwardMode, UpstreamTransport};
pub use server::AppState;
