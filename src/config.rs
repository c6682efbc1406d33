//! Startup configuration
//!
//! All configuration is resolved once in `main` and shared read-only for the
//! lifetime of the process. When no upstream flags are given the proxy falls
//! back to the in-cluster environment (service host/port variables plus the
//! mounted ServiceAccount credentials).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Path to the in-cluster CA certificate
pub const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Path to the in-cluster ServiceAccount token
pub const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// OIDC issuer and claim-mapping configuration
#[derive(Clone, Debug)]
pub struct OidcOptions {
    /// OIDC issuer URL; `iss` must match this exactly
    pub issuer_url: String,
    /// OIDC client ID, accepted as an audience
    pub client_id: String,
    /// Additional accepted audiences
    pub api_audiences: Vec<String>,
    /// CA bundle for the issuer's TLS endpoints (system trust when unset)
    pub ca_file: Option<PathBuf>,
    /// JWT claim to use as username
    pub username_claim: String,
    /// Prefix applied to usernames. `None` means unset: non-`email` claims
    /// then default to `<issuer_url>#`. `Some("")` explicitly disables the
    /// prefix.
    pub username_prefix: Option<String>,
    /// JWT claim to use as groups
    pub groups_claim: String,
    /// Prefix applied to every group
    pub groups_prefix: Option<String>,
    /// Claims that must be present with exactly these string values
    pub required_claims: HashMap<String, String>,
    /// Accepted JWS algorithm names (e.g. "RS256")
    pub supported_signing_algs: Vec<String>,
    /// Claims copied into the identity's extra attributes
    pub extra_claims: Vec<String>,
    /// Background JWKS refresh interval
    pub jwks_refresh_interval: Duration,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            api_audiences: Vec::new(),
            ca_file: None,
            username_claim: "sub".to_string(),
            username_prefix: None,
            groups_claim: "groups".to_string(),
            groups_prefix: None,
            required_claims: HashMap::new(),
            supported_signing_algs: vec!["RS256".to_string()],
            extra_claims: Vec::new(),
            jwks_refresh_interval: Duration::from_secs(300),
        }
    }
}

impl OidcOptions {
    /// All audiences accepted during validation: the client ID plus any
    /// configured API audiences.
    pub fn accepted_audiences(&self) -> Vec<String> {
        let mut audiences = vec![self.client_id.clone()];
        audiences.extend(self.api_audiences.iter().cloned());
        audiences
    }
}

/// Request-path behavior switches
#[derive(Clone, Debug, Default)]
pub struct ProxyOptions {
    /// Forward verified requests with their original credentials and emit no
    /// impersonation headers
    pub disable_impersonation: bool,
    /// On OIDC failure, fall back to the upstream TokenReview endpoint and
    /// pass valid requests through unmodified
    pub token_review: bool,
    /// Static extra attributes appended to every impersonated request
    pub extra_user_headers: HashMap<String, Vec<String>>,
    /// Append the client's remote address as an extra attribute
    pub extra_user_headers_client_ip_enabled: bool,
}

/// Upstream API server location, trust and proxy credentials
#[derive(Clone, Debug)]
pub struct UpstreamOptions {
    /// Upstream base URL (scheme and authority)
    pub host: String,
    /// Path prefix prepended to every forwarded path
    pub api_path_prefix: String,
    /// Per-request timeout; zero disables it
    pub timeout: Duration,
    /// CA bundle file for the upstream's serving certificate
    pub ca_file: Option<PathBuf>,
    /// Inline PEM CA bundle, preferred over `ca_file` when set
    pub ca_data: Option<Vec<u8>>,
    /// File holding the proxy's own bearer token, re-read per request so
    /// rotated tokens are picked up
    pub token_file: Option<PathBuf>,
    /// Client certificate for mTLS towards the upstream
    pub client_cert_file: Option<PathBuf>,
    /// Client key for mTLS towards the upstream
    pub client_key_file: Option<PathBuf>,
}

impl UpstreamOptions {
    /// Build options from the in-cluster environment, if present.
    ///
    /// Mirrors the standard in-cluster setup: endpoint from the service host
    /// and port variables, trust and credentials from the ServiceAccount
    /// mount.
    pub fn in_cluster() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        Some(Self {
            host: format!("https://{}:{}", host, port),
            api_path_prefix: String::new(),
            timeout: Duration::ZERO,
            ca_file: Some(PathBuf::from(IN_CLUSTER_CA_PATH)),
            ca_data: None,
            token_file: Some(PathBuf::from(IN_CLUSTER_TOKEN_PATH)),
            client_cert_file: None,
            client_key_file: None,
        })
    }
}

/// Secure serving configuration for the client-facing listener
#[derive(Clone, Debug)]
pub struct ServingOptions {
    /// Address the TLS listener binds
    pub addr: std::net::SocketAddr,
    /// Server certificate chain PEM file
    pub cert_file: PathBuf,
    /// Server private key PEM file
    pub key_file: PathBuf,
    /// Optional CA bundle enabling (non-mandatory) TLS client authentication
    pub client_ca_file: Option<PathBuf>,
    /// Address the plain-HTTP readiness listener binds
    pub probe_addr: std::net::SocketAddr,
}
