//! kube-oidc-proxy - authenticating reverse proxy for Kubernetes API servers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_oidc_proxy::auth::{
    OidcVerifier, RequestAuthenticator, ReviewToken, TokenReviewClient, VerifyToken,
};
use kube_oidc_proxy::config::{OidcOptions, ProxyOptions, ServingOptions, UpstreamOptions};
use kube_oidc_proxy::probe::{self, Readiness};
use kube_oidc_proxy::proxy::UpstreamTransport;
use kube_oidc_proxy::server::{self, AppState};

/// Reverse proxy that authenticates OIDC bearer tokens and impersonates the
/// verified identity towards a Kubernetes API server
#[derive(Parser, Debug)]
#[command(name = "kube-oidc-proxy", version, about, long_about = None)]
struct Cli {
    /// OIDC issuer URL; tokens must carry it as `iss`
    #[arg(long)]
    oidc_issuer_url: String,

    /// OIDC client ID, accepted as token audience
    #[arg(long)]
    oidc_client_id: String,

    /// CA bundle for the issuer's TLS endpoints (system trust when unset)
    #[arg(long)]
    oidc_ca_file: Option<PathBuf>,

    /// JWT claim to use as the username
    #[arg(long, default_value = "sub")]
    oidc_username_claim: String,

    /// Prefix prepended to usernames. Unset defaults to "<issuer-url>#" for
    /// non-email claims; pass an empty value to disable prefixing
    #[arg(long)]
    oidc_username_prefix: Option<String>,

    /// JWT claim to use as the user's groups
    #[arg(long, default_value = "groups")]
    oidc_groups_claim: String,

    /// Prefix prepended to every group
    #[arg(long)]
    oidc_groups_prefix: Option<String>,

    /// Claim that must be present with this exact value, as key=value
    /// (repeatable)
    #[arg(long = "oidc-required-claim", value_parser = parse_key_value)]
    oidc_required_claims: Vec<(String, String)>,

    /// Accepted JWS signing algorithms, comma separated
    #[arg(long, value_delimiter = ',', default_value = "RS256")]
    oidc_signing_algs: Vec<String>,

    /// Claim copied into the identity's extra attributes (repeatable)
    #[arg(long = "oidc-extra-claim")]
    oidc_extra_claims: Vec<String>,

    /// Additional audiences accepted in tokens and passed to TokenReview,
    /// comma separated
    #[arg(long, value_delimiter = ',')]
    api_audiences: Vec<String>,

    /// Background JWKS refresh interval in seconds
    #[arg(long, default_value_t = 300)]
    oidc_jwks_refresh_interval_seconds: u64,

    /// Forward verified requests with their original credentials and emit
    /// no impersonation headers
    #[arg(long)]
    disable_impersonation: bool,

    /// On OIDC validation failure, fall back to the upstream TokenReview
    /// endpoint and pass valid requests through unmodified
    #[arg(long)]
    token_review: bool,

    /// Static extra user header as key=value (repeatable)
    #[arg(long = "extra-user-header", value_parser = parse_key_value)]
    extra_user_headers: Vec<(String, String)>,

    /// Append the client's remote address as an extra user header
    #[arg(long)]
    extra_user_header_client_ip: bool,

    /// Address for the TLS listener
    #[arg(long, default_value = "0.0.0.0:8443")]
    secure_listen_address: SocketAddr,

    /// Server TLS certificate chain (PEM)
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// Server TLS private key (PEM)
    #[arg(long)]
    tls_private_key_file: PathBuf,

    /// CA bundle enabling TLS client authentication
    #[arg(long)]
    tls_client_ca_file: Option<PathBuf>,

    /// Address for the plain-HTTP readiness listener
    #[arg(long, default_value = "0.0.0.0:8080")]
    probe_listen_address: SocketAddr,

    /// Upstream API server URL; unset falls back to the in-cluster
    /// environment
    #[arg(long)]
    upstream: Option<String>,

    /// CA bundle for the upstream's serving certificate
    #[arg(long)]
    upstream_ca_file: Option<PathBuf>,

    /// File holding the proxy's own bearer token for the upstream
    #[arg(long)]
    upstream_token_file: Option<PathBuf>,

    /// Client certificate for mTLS towards the upstream (PEM)
    #[arg(long)]
    upstream_client_cert_file: Option<PathBuf>,

    /// Client key for mTLS towards the upstream (PEM)
    #[arg(long)]
    upstream_client_key_file: Option<PathBuf>,

    /// Upstream request timeout in seconds; 0 disables it
    #[arg(long, default_value_t = 0)]
    upstream_timeout_seconds: u64,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err("expected key=value".to_string()),
    }
}

fn collect_multimap(pairs: Vec<(String, String)>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        map.entry(key).or_default().push(value);
    }
    map
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}. \
             The proxy cannot terminate or originate TLS without it.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let api_audiences = cli.api_audiences.clone();

    let oidc_options = OidcOptions {
        issuer_url: cli.oidc_issuer_url,
        client_id: cli.oidc_client_id,
        api_audiences: cli.api_audiences,
        ca_file: cli.oidc_ca_file,
        username_claim: cli.oidc_username_claim,
        username_prefix: cli.oidc_username_prefix,
        groups_claim: cli.oidc_groups_claim,
        groups_prefix: cli.oidc_groups_prefix,
        required_claims: cli.oidc_required_claims.into_iter().collect(),
        supported_signing_algs: cli.oidc_signing_algs,
        extra_claims: cli.oidc_extra_claims,
        jwks_refresh_interval: Duration::from_secs(cli.oidc_jwks_refresh_interval_seconds),
    };

    let proxy_options = Arc::new(ProxyOptions {
        disable_impersonation: cli.disable_impersonation,
        token_review: cli.token_review,
        extra_user_headers: collect_multimap(cli.extra_user_headers),
        extra_user_headers_client_ip_enabled: cli.extra_user_header_client_ip,
    });

    let upstream_options = match cli.upstream {
        Some(host) => UpstreamOptions {
            host,
            api_path_prefix: String::new(),
            timeout: Duration::from_secs(cli.upstream_timeout_seconds),
            ca_file: cli.upstream_ca_file,
            ca_data: None,
            token_file: cli.upstream_token_file,
            client_cert_file: cli.upstream_client_cert_file,
            client_key_file: cli.upstream_client_key_file,
        },
        None => UpstreamOptions::in_cluster().ok_or_else(|| {
            anyhow::anyhow!("no --upstream configured and not running in-cluster")
        })?,
    };

    let serving = ServingOptions {
        addr: cli.secure_listen_address,
        cert_file: cli.tls_cert_file,
        key_file: cli.tls_private_key_file,
        client_ca_file: cli.tls_client_ca_file,
        probe_addr: cli.probe_listen_address,
    };

    let refresh_interval = oidc_options.jwks_refresh_interval;
    let verifier = Arc::new(OidcVerifier::new(oidc_options)?);

    // Probe listener first so readiness is observable during discovery.
    let readiness = Readiness::new();
    {
        let readiness = readiness.clone();
        let addr = serving.probe_addr;
        tokio::spawn(async move {
            if let Err(e) = probe::serve(addr, readiness).await {
                tracing::error!(error = %e, "probe listener failed");
            }
        });
    }

    // The proxy does not accept traffic until discovery has succeeded once.
    let jwks = verifier.jwks();
    let mut retry_delay = Duration::from_secs(1);
    let max_retry_delay = Duration::from_secs(30);
    loop {
        match jwks.discover().await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, retry_in = ?retry_delay, "OIDC discovery failed, retrying...");
                tokio::time::sleep(retry_delay).await;
                retry_delay = std::cmp::min(retry_delay * 2, max_retry_delay);
            }
        }
    }
    info!("OIDC discovery complete");
    readiness.set_ready();

    tokio::spawn(jwks.clone().run_refresh_loop(refresh_interval));

    let reviewer: Option<Arc<dyn ReviewToken>> = if proxy_options.token_review {
        Some(Arc::new(TokenReviewClient::new(
            &upstream_options,
            api_audiences,
        )?))
    } else {
        None
    };

    let authenticator = Arc::new(RequestAuthenticator::new(
        verifier.clone() as Arc<dyn VerifyToken>,
        reviewer,
        proxy_options.disable_impersonation,
    ));

    let upstream = Arc::new(UpstreamTransport::new(&upstream_options)?);

    let state = AppState {
        authenticator,
        options: proxy_options,
        upstream,
    };

    server::serve(&serving, state).await?;

    info!("kube-oidc-proxy shut down");
    Ok(())
}
