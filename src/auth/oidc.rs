//! OIDC token verification
//!
//! Validates compact JWS bearer tokens against the configured issuer and
//! extracts the identity the proxy asserts upstream.
//!
//! # Username prefixing
//!
//! The username prefix follows the well-known OIDC authenticator rules: when
//! the username claim is `email` no prefix is applied unless one is
//! explicitly configured; for any other claim an unset prefix defaults to
//! `<issuer_url>#`, and an explicitly empty prefix disables prefixing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::OidcOptions;
use crate::error::Error;

use super::jwks::JwksCache;
use super::{UserInfo, VerifyError, VerifyToken};

/// OIDC token verifier backed by a JWKS cache
pub struct OidcVerifier {
    options: OidcOptions,
    algorithms: Vec<Algorithm>,
    jwks: Arc<JwksCache>,
}

impl OidcVerifier {
    /// Create a verifier for the configured issuer.
    ///
    /// Reads the issuer CA bundle if one is configured. Discovery has not
    /// run yet; callers drive [`JwksCache::discover`] before serving.
    pub fn new(options: OidcOptions) -> Result<Self, Error> {
        let algorithms = options
            .supported_signing_algs
            .iter()
            .map(|name| {
                name.parse::<Algorithm>()
                    .map_err(|_| Error::Config(format!("unsupported signing algorithm: {}", name)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ca_pem = match &options.ca_file {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                Error::Config(format!(
                    "failed to read issuer CA file {}: {}",
                    path.display(),
                    e
                ))
            })?),
            None => None,
        };

        let jwks = Arc::new(JwksCache::new(&options.issuer_url, ca_pem.as_deref())?);

        Ok(Self {
            options,
            algorithms,
            jwks,
        })
    }

    /// The verifier's key cache, for discovery and background refresh.
    pub fn jwks(&self) -> Arc<JwksCache> {
        self.jwks.clone()
    }
}

#[async_trait]
impl VerifyToken for OidcVerifier {
    async fn verify(&self, token: &str) -> Result<UserInfo, VerifyError> {
        let header = decode_header(token).map_err(|_| VerifyError::Malformed)?;

        if !self.algorithms.contains(&header.alg) {
            return Err(VerifyError::SignatureInvalid);
        }

        let key = self.jwks.key_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        // Zero clock-skew tolerance; the crate default of 60 s is too lax.
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.set_issuer(&[self.options.issuer_url.as_str()]);
        validation.set_audience(&self.options.accepted_audiences());

        let data =
            decode::<Map<String, Value>>(token, &key, &validation).map_err(map_jwt_error)?;
        let claims = data.claims;

        check_required_claims(&claims, &self.options.required_claims)?;

        let name = resolve_username(&claims, &self.options)?;
        let groups = resolve_groups(&claims, &self.options);
        let extra = resolve_extra(&claims, &self.options);

        debug!(user = %name, "verified OIDC token");

        Ok(UserInfo { name, groups, extra })
    }
}

/// Map JWT library failures onto the verification taxonomy
fn map_jwt_error(e: jsonwebtoken::errors::Error) -> VerifyError {
    use jsonwebtoken::errors::ErrorKind;

    match e.kind() {
        ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => VerifyError::Expired,
        ErrorKind::InvalidIssuer => VerifyError::IssuerMismatch,
        ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
        ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
            "iss" => VerifyError::IssuerMismatch,
            "aud" => VerifyError::AudienceMismatch,
            _ => VerifyError::Malformed,
        },
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => VerifyError::Malformed,
        _ => VerifyError::SignatureInvalid,
    }
}

/// Every configured required claim must be present as a string equal to the
/// configured value.
fn check_required_claims(
    claims: &Map<String, Value>,
    required: &HashMap<String, String>,
) -> Result<(), VerifyError> {
    for (name, expected) in required {
        match claims.get(name) {
            Some(Value::String(actual)) if actual == expected => {}
            _ => return Err(VerifyError::RequiredClaimMismatch(name.clone())),
        }
    }
    Ok(())
}

fn resolve_username(
    claims: &Map<String, Value>,
    options: &OidcOptions,
) -> Result<String, VerifyError> {
    let raw = claims
        .get(&options.username_claim)
        .and_then(Value::as_str)
        .unwrap_or_default();

    if raw.is_empty() {
        return Err(VerifyError::NoUsername);
    }

    let username = if options.username_claim == "email" {
        match &options.username_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}{}", prefix, raw),
            _ => raw.to_string(),
        }
    } else {
        match &options.username_prefix {
            Some(prefix) => format!("{}{}", prefix, raw),
            None => format!("{}#{}", options.issuer_url, raw),
        }
    };

    Ok(username)
}

/// The groups claim may be a single string or an array of strings.
fn resolve_groups(claims: &Map<String, Value>, options: &OidcOptions) -> Vec<String> {
    let raw: Vec<String> = match claims.get(&options.groups_claim) {
        Some(Value::String(group)) => vec![group.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    };

    match &options.groups_prefix {
        Some(prefix) if !prefix.is_empty() => {
            raw.into_iter().map(|g| format!("{}{}", prefix, g)).collect()
        }
        _ => raw,
    }
}

/// Copy configured extra claims (string or string-array values) into the
/// identity's extra attributes.
fn resolve_extra(
    claims: &Map<String, Value>,
    options: &OidcOptions,
) -> HashMap<String, Vec<String>> {
    let mut extra = HashMap::new();

    for claim in &options.extra_claims {
        let values: Vec<String> = match claims.get(claim) {
            Some(Value::String(value)) => vec![value.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => continue,
        };
        if !values.is_empty() {
            extra.insert(claim.clone(), values);
        }
    }

    extra
}
