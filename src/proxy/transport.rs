//! Upstream HTTP transport
//!
//! Two credential modes ride the same trust settings: the impersonating
//! client carries the proxy's own credentials, the passthrough client is
//! TLS-only so the client's original headers survive untouched. Each mode
//! also has an HTTP/1.1-pinned sibling used for `Connection: Upgrade`
//! requests; the pooled clients negotiate HTTP/2 via ALPN when the upstream
//! offers it.

use std::path::Path;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode, Uri};
use futures::TryStreamExt;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::UpstreamOptions;
use crate::error::Error;

/// Which credential set rides the forwarded request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    /// The proxy's own credentials plus impersonation headers
    Impersonate,
    /// The client's original headers, credentials included
    Passthrough,
}

/// Dispatch seam between the proxy engine and the upstream
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchUpstream: Send + Sync {
    /// Forward a prepared request and stream the response back.
    ///
    /// Upgrade requests are detected from the request itself; on a 101 the
    /// upgraded byte streams are joined in a background task.
    async fn dispatch(
        &self,
        mode: ForwardMode,
        request: Request<Body>,
    ) -> Result<Response<Body>, Error>;
}

struct ClientPair {
    pooled: reqwest::Client,
    upgrade: reqwest::Client,
}

/// Upstream transport with impersonating and passthrough clients
pub struct UpstreamTransport {
    base: String,
    token_file: Option<std::path::PathBuf>,
    impersonate: ClientPair,
    passthrough: ClientPair,
}

impl UpstreamTransport {
    /// Build both client pairs from the upstream configuration.
    pub fn new(options: &UpstreamOptions) -> Result<Self, Error> {
        Ok(Self {
            base: format!(
                "{}{}",
                options.host.trim_end_matches('/'),
                options.api_path_prefix
            ),
            token_file: options.token_file.clone(),
            impersonate: ClientPair {
                pooled: build_upstream_client(options, true, false)?,
                upgrade: build_upstream_client(options, true, true)?,
            },
            passthrough: ClientPair {
                pooled: build_upstream_client(options, false, false)?,
                upgrade: build_upstream_client(options, false, true)?,
            },
        })
    }

    fn target_url(&self, uri: &Uri) -> String {
        match uri.path_and_query() {
            Some(pq) => format!("{}{}", self.base, pq),
            None => self.base.clone(),
        }
    }

    fn client(&self, mode: ForwardMode, upgrade: bool) -> &reqwest::Client {
        let pair = match mode {
            ForwardMode::Impersonate => &self.impersonate,
            ForwardMode::Passthrough => &self.passthrough,
        };
        if upgrade {
            &pair.upgrade
        } else {
            &pair.pooled
        }
    }
}

#[async_trait]
impl DispatchUpstream for UpstreamTransport {
    async fn dispatch(
        &self,
        mode: ForwardMode,
        request: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        let (mut parts, body) = request.into_parts();

        let client_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();
        let wants_upgrade =
            client_upgrade.is_some() && parts.headers.contains_key(header::UPGRADE);

        let url = self.target_url(&parts.uri);
        debug!(method = %parts.method, url = %url, mode = ?mode, upgrade = wants_upgrade, "forwarding to upstream");

        let mut builder = self
            .client(mode, wants_upgrade)
            .request(parts.method, url)
            .headers(parts.headers);

        if mode == ForwardMode::Impersonate {
            if let Some(bearer) = load_bearer(self.token_file.as_deref()).await? {
                builder = builder.bearer_auth(&*bearer);
            }
        }

        if !wants_upgrade {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        if let (true, Some(on_upgrade)) = (
            wants_upgrade && response.status() == StatusCode::SWITCHING_PROTOCOLS,
            client_upgrade,
        ) {
            return join_upgrade(response, on_upgrade).await;
        }

        stream_response(response)
    }
}

/// Relay the upstream 101 to the client and join the two upgraded byte
/// streams until either side closes.
async fn join_upgrade(
    response: reqwest::Response,
    client_upgrade: hyper::upgrade::OnUpgrade,
) -> Result<Response<Body>, Error> {
    let status = response.status();
    let headers = response.headers().clone();

    let mut upstream_io = response
        .upgrade()
        .await
        .map_err(|e| Error::Upstream(format!("upstream upgrade failed: {}", e)))?;

    tokio::spawn(async move {
        match client_upgrade.await {
            Ok(client_io) => {
                let mut client_io = TokioIo::new(client_io);
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                {
                    debug!(error = %e, "upgraded connection closed with error");
                }
            }
            Err(e) => warn!(error = %e, "client upgrade failed"),
        }
    });

    let mut relayed = Response::builder()
        .status(status)
        .body(Body::empty())
        .map_err(|e| Error::Internal(format!("failed to build upgrade response: {}", e)))?;
    *relayed.headers_mut() = headers;

    Ok(relayed)
}

/// Build a streaming response from the upstream answer. Body errors after
/// the headers have been written terminate the stream and are logged.
fn stream_response(response: reqwest::Response) -> Result<Response<Body>, Error> {
    let status = response.status();
    let headers = response.headers().clone();

    let stream = response.bytes_stream().map_err(|e| {
        debug!(error = %e, "upstream body stream ended with error");
        std::io::Error::other(e)
    });

    let mut out = Response::builder()
        .status(status)
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))?;
    *out.headers_mut() = headers;

    Ok(out)
}

/// Build a reqwest client for the upstream.
///
/// `with_credentials` selects the impersonating configuration (client
/// certificate identity when configured); the bearer token is attached per
/// request so rotated tokens are honored. `http1_only` pins the protocol
/// for upgrade requests. The request timeout only applies to pooled
/// clients; upgrade connections live until either side closes.
pub(crate) fn build_upstream_client(
    options: &UpstreamOptions,
    with_credentials: bool,
    http1_only: bool,
) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    let ca_pem: Option<Vec<u8>> = match (&options.ca_data, &options.ca_file) {
        (Some(data), _) => Some(data.clone()),
        (None, Some(path)) => Some(std::fs::read(path).map_err(|e| {
            Error::Config(format!(
                "failed to read upstream CA file {}: {}",
                path.display(),
                e
            ))
        })?),
        (None, None) => None,
    };

    if let Some(pem) = ca_pem {
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Config(format!("invalid upstream CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }

    if with_credentials {
        if let (Some(cert_file), Some(key_file)) =
            (&options.client_cert_file, &options.client_key_file)
        {
            let mut pem = std::fs::read(cert_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read client certificate {}: {}",
                    cert_file.display(),
                    e
                ))
            })?;
            pem.extend(std::fs::read(key_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read client key {}: {}",
                    key_file.display(),
                    e
                ))
            })?);

            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
    }

    if http1_only {
        builder = builder.http1_only();
    } else if !options.timeout.is_zero() {
        builder = builder.timeout(options.timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to create upstream HTTP client: {}", e)))
}

/// Read the proxy's bearer token, if one is configured.
pub(crate) async fn load_bearer(
    token_file: Option<&Path>,
) -> Result<Option<Zeroizing<String>>, Error> {
    match token_file {
        Some(path) => {
            let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::Internal(format!(
                    "failed to read upstream token file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(Some(Zeroizing::new(token.trim().to_string())))
        }
        None => Ok(None),
    }
}
