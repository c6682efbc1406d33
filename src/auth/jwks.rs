//! JWKS discovery and key caching
//!
//! Resolves the issuer's `jwks_uri` via OIDC discovery and keeps the signing
//! keys cached by `kid`. A token carrying an unknown `kid` forces a refresh;
//! concurrent forced refreshes coalesce onto a single in-flight fetch, and a
//! minimum interval between fetches bounds the load a burst of unknown keys
//! can put on the issuer.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Error;

use super::VerifyError;

/// Minimum spacing between forced refreshes triggered by unknown `kid`s
const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout for discovery and JWKS fetches, independent of the upstream
/// request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum backoff between failed background refresh attempts
const MAX_REFRESH_BACKOFF: Duration = Duration::from_secs(30);

/// OIDC discovery document (the fields the proxy needs)
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

/// JSON Web Key Set
#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Individual JSON Web Key
#[derive(Debug, Deserialize)]
struct Jwk {
    /// Key type (RSA, EC)
    kty: String,
    /// Key ID
    #[serde(default)]
    kid: Option<String>,
    /// Public key use; "enc" keys are skipped
    #[serde(default, rename = "use")]
    use_: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default)]
    n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default)]
    e: Option<String>,
    /// EC curve name
    #[serde(default)]
    crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default)]
    x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default)]
    y: Option<String>,
}

impl Jwk {
    fn is_signing_key(&self) -> bool {
        self.use_.as_deref() != Some("enc")
    }
}

/// Cached key set
struct CachedKeys {
    /// Keys indexed by kid for lookup
    by_kid: HashMap<String, DecodingKey>,
    /// All usable keys, in publication order
    all: Vec<DecodingKey>,
    /// When this set was fetched
    fetched_at: Instant,
}

/// JWKS cache with forced-refresh coalescing
pub struct JwksCache {
    http: reqwest::Client,
    issuer_url: String,
    jwks_uri: OnceLock<String>,
    keys: RwLock<Option<CachedKeys>>,
    refresh_gate: Mutex<()>,
}

impl JwksCache {
    /// Create a cache for the given issuer.
    ///
    /// `ca_pem` is the issuer TLS trust bundle; system roots are used when
    /// it is absent.
    pub fn new(issuer_url: &str, ca_pem: Option<&[u8]>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(FETCH_TIMEOUT);

        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid issuer CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create issuer HTTP client: {}", e)))?;

        Ok(Self {
            http,
            issuer_url: issuer_url.trim_end_matches('/').to_string(),
            jwks_uri: OnceLock::new(),
            keys: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        })
    }

    /// Resolve the issuer's `jwks_uri` and prime the key cache.
    ///
    /// The proxy must not accept traffic before this has succeeded once.
    pub async fn discover(&self) -> Result<(), Error> {
        let url = format!("{}/.well-known/openid-configuration", self.issuer_url);
        debug!(url = %url, "fetching OIDC discovery document");

        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("OIDC discovery request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Upstream(format!("OIDC discovery request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid OIDC discovery response: {}", e)))?;

        if doc.issuer.trim_end_matches('/') != self.issuer_url {
            return Err(Error::Config(format!(
                "discovery issuer mismatch: expected {}, got {}",
                self.issuer_url, doc.issuer
            )));
        }

        let _ = self.jwks_uri.set(doc.jwks_uri);
        self.fetch().await
    }

    /// Fetch the key set and replace the cache.
    pub async fn refresh(&self) -> Result<(), Error> {
        self.fetch().await
    }

    /// Look up the verification key for a token.
    ///
    /// An unknown `kid` forces one coalesced refresh before failing; a token
    /// without a `kid` verifies against the issuer's first published key.
    pub async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, VerifyError> {
        if let Some(key) = self.lookup(kid).await {
            return Ok(key);
        }

        self.forced_refresh().await?;

        self.lookup(kid)
            .await
            .ok_or(VerifyError::SignatureInvalid)
    }

    async fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let guard = self.keys.read().await;
        let cached = guard.as_ref()?;
        match kid {
            Some(kid) => cached.by_kid.get(kid).cloned(),
            None => cached.all.first().cloned(),
        }
    }

    /// Refresh triggered by a cache miss. Serialized through `refresh_gate`
    /// so concurrent misses produce a single fetch, and suppressed entirely
    /// while the cache is younger than the minimum interval.
    async fn forced_refresh(&self) -> Result<(), VerifyError> {
        let _gate = self.refresh_gate.lock().await;

        {
            let guard = self.keys.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < MIN_FORCED_REFRESH_INTERVAL {
                    return Ok(());
                }
            }
        }

        self.fetch().await.map_err(|e| {
            warn!(error = %e, "forced JWKS refresh failed");
            VerifyError::JwksUnavailable
        })
    }

    async fn fetch(&self) -> Result<(), Error> {
        let uri = self
            .jwks_uri
            .get()
            .ok_or_else(|| Error::Internal("JWKS fetch attempted before discovery".into()))?;

        debug!(url = %uri, "fetching JWKS");

        let jwks: JwkSet = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("JWKS request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Upstream(format!("JWKS request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid JWKS response: {}", e)))?;

        let mut by_kid = HashMap::new();
        let mut all = Vec::new();
        for jwk in &jwks.keys {
            if !jwk.is_signing_key() {
                continue;
            }
            match decoding_key(jwk) {
                Ok(key) => {
                    if let Some(kid) = &jwk.kid {
                        by_kid.insert(kid.clone(), key.clone());
                    }
                    all.push(key);
                }
                Err(e) => {
                    warn!(kty = %jwk.kty, kid = ?jwk.kid, error = %e, "skipping unusable JWK");
                }
            }
        }

        if all.is_empty() {
            return Err(Error::Config("no usable signing keys in JWKS".into()));
        }

        info!(key_count = all.len(), "refreshed JWKS cache");

        *self.keys.write().await = Some(CachedKeys {
            by_kid,
            all,
            fetched_at: Instant::now(),
        });

        Ok(())
    }

    /// Background refresh loop. Refreshes on the configured interval and
    /// backs off exponentially (1 s up to 30 s) after failures.
    pub async fn run_refresh_loop(self: Arc<Self>, interval: Duration) {
        let mut backoff = Duration::from_secs(1);
        let mut delay = interval;

        loop {
            tokio::time::sleep(delay).await;
            match self.refresh().await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                    delay = interval;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "background JWKS refresh failed");
                    delay = backoff;
                    backoff = std::cmp::min(backoff * 2, MAX_REFRESH_BACKOFF);
                }
            }
        }
    }
}

/// Convert a JWK to a verification key
fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, Error> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_ref()
                .ok_or_else(|| Error::Config("RSA key missing 'n'".into()))?;
            let e = jwk
                .e
                .as_ref()
                .ok_or_else(|| Error::Config("RSA key missing 'e'".into()))?;

            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| Error::Config(format!("invalid RSA key: {}", e)))
        }
        "EC" => {
            let crv = jwk
                .crv
                .as_ref()
                .ok_or_else(|| Error::Config("EC key missing 'crv'".into()))?;
            let x = jwk
                .x
                .as_ref()
                .ok_or_else(|| Error::Config("EC key missing 'x'".into()))?;
            let y = jwk
                .y
                .as_ref()
                .ok_or_else(|| Error::Config("EC key missing 'y'".into()))?;

            match crv.as_str() {
                "P-256" | "P-384" => DecodingKey::from_ec_components(x, y)
                    .map_err(|e| Error::Config(format!("invalid EC key: {}", e))),
                _ => Err(Error::Config(format!("unsupported EC curve: {}", crv))),
            }
        }
        kty => Err(Error::Config(format!("unsupported key type: {}", kty))),
    }
}
