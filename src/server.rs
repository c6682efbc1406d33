//! Secure serving
//!
//! Terminates TLS for the client-facing listener and routes every request
//! through the proxy pipeline. Shutdown is graceful: on SIGTERM or ctrl-c
//! the listener stops accepting and in-flight requests get a bounded drain
//! period.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::auth::RequestAuthenticator;
use crate::config::{ProxyOptions, ServingOptions};
use crate::error::Error;
use crate::proxy::{proxy_handler, DispatchUpstream};

/// Grace period for in-flight requests during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    /// Request authenticator
    pub authenticator: Arc<RequestAuthenticator>,
    /// Request-path behavior switches
    pub options: Arc<ProxyOptions>,
    /// Upstream dispatcher
    pub upstream: Arc<dyn DispatchUpstream>,
}

/// Serve the proxy until shutdown.
///
/// Every path on this listener is proxied; probes live on their own
/// listener.
pub async fn serve(serving: &ServingOptions, state: AppState) -> Result<(), Error> {
    let app = Router::new().fallback(proxy_handler).with_state(state);

    let tls = tls_config(serving)?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!(addr = %serving.addr, "starting secure proxy listener");

    axum_server::bind_rustls(serving.addr, tls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))
}

/// Build the rustls serving configuration, with optional (non-mandatory)
/// TLS client authentication when a client CA bundle is configured.
fn tls_config(serving: &ServingOptions) -> Result<RustlsConfig, Error> {
    let certs = load_certificates(&serving.cert_file)?;
    let key = PrivateKeyDer::from_pem_file(&serving.key_file).map_err(|e| {
        Error::Config(format!(
            "failed to read server key {}: {}",
            serving.key_file.display(),
            e
        ))
    })?;

    let builder = rustls::ServerConfig::builder();

    let config = match &serving.client_ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certificates(ca_file)? {
                roots.add(cert).map_err(|e| {
                    Error::Config(format!("failed to add client CA certificate: {}", e))
                })?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Config(format!("invalid client CA bundle: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = config
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid server certificate/key pair: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    CertificateDer::pem_file_iter(path)
        .map_err(|e| {
            Error::Config(format!(
                "failed to open certificate bundle {}: {}",
                path.display(),
                e
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!(
                "failed to read certificate bundle {}: {}",
                path.display(),
                e
            ))
        })
}

/// Stop accepting on SIGTERM or ctrl-c, then drain in-flight requests.
async fn shutdown_on_signal(handle: Handle) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(drain = ?DRAIN_TIMEOUT, "shutdown signal received, draining connections");
    handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
}
