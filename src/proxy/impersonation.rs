//! Impersonation gating and header synthesis
//!
//! Inbound `Impersonate-*` headers are rejected outright so a client can
//! never assert someone else's identity through the proxy. Outbound headers
//! are synthesized exclusively from the verified identity.

use std::collections::HashMap;
use std::fmt::Write;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::auth::UserInfo;
use crate::config::ProxyOptions;
use crate::error::Error;

/// Impersonated user header
pub const IMPERSONATE_USER_HEADER: &str = "impersonate-user";

/// Impersonated group header, repeated per group
pub const IMPERSONATE_GROUP_HEADER: &str = "impersonate-group";

/// Impersonated UID header
pub const IMPERSONATE_UID_HEADER: &str = "impersonate-uid";

/// Prefix for impersonated extra attribute headers
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Extra key carrying the client's observed remote address
pub const CLIENT_IP_EXTRA_KEY: &str = "Remote-Client-IP";

/// Group every authenticated principal belongs to
const ALL_AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Whether the request carries any inbound impersonation header.
///
/// Header names are already lower-cased by the HTTP layer, so the match is
/// case-insensitive by construction.
pub fn contains_impersonation(headers: &HeaderMap) -> bool {
    headers.keys().any(|name| {
        let name = name.as_str();
        name == IMPERSONATE_USER_HEADER
            || name == IMPERSONATE_GROUP_HEADER
            || name == IMPERSONATE_UID_HEADER
            || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
    })
}

/// Synthesize the outbound impersonation header set for a verified identity.
///
/// Groups always include `system:authenticated`. The client address is
/// appended under [`CLIENT_IP_EXTRA_KEY`] when enabled, and statically
/// configured extra headers are merged additively. Extra keys are emitted in
/// sorted order so identical identities produce identical header sets.
pub fn impersonation_headers(
    user: &UserInfo,
    options: &ProxyOptions,
    remote_addr: Option<&str>,
) -> Result<Vec<(HeaderName, HeaderValue)>, Error> {
    let mut headers = Vec::new();

    headers.push((
        HeaderName::from_static(IMPERSONATE_USER_HEADER),
        header_value(&user.name)?,
    ));

    let mut groups = user.groups.clone();
    if !groups.iter().any(|g| g == ALL_AUTHENTICATED_GROUP) {
        groups.push(ALL_AUTHENTICATED_GROUP.to_string());
    }
    for group in &groups {
        headers.push((
            HeaderName::from_static(IMPERSONATE_GROUP_HEADER),
            header_value(group)?,
        ));
    }

    let mut extra: HashMap<String, Vec<String>> = user.extra.clone();

    if options.extra_user_headers_client_ip_enabled {
        if let Some(addr) = remote_addr {
            extra
                .entry(CLIENT_IP_EXTRA_KEY.to_string())
                .or_default()
                .push(addr.to_string());
        }
    }

    for (key, values) in &options.extra_user_headers {
        extra
            .entry(key.clone())
            .or_default()
            .extend(values.iter().cloned());
    }

    let mut keys: Vec<&String> = extra.keys().collect();
    keys.sort();

    for key in keys {
        let name = format!("{}{}", IMPERSONATE_EXTRA_PREFIX, encode_extra_key(key));
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Internal(format!("invalid impersonation extra key: {}", key)))?;
        for value in &extra[key] {
            headers.push((name.clone(), header_value(value)?));
        }
    }

    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Internal("impersonation value is not a valid header value".into()))
}

/// Canonical form for extra keys: lower-cased ASCII with non-token bytes
/// percent-encoded.
fn encode_extra_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        let byte = byte.to_ascii_lowercase();
        if is_token_byte(byte) {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

/// RFC 7230 token characters
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserInfo {
        UserInfo {
            name: "alice".to_string(),
            groups: vec!["dev".to_string()],
            extra: Default::default(),
        }
    }

    fn names(headers: &[(HeaderName, HeaderValue)], name: &str) -> Vec<String> {
        headers
            .iter()
            .filter(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_detects_impersonate_user() {
        let mut headers = HeaderMap::new();
        headers.insert("Impersonate-User", "bob".parse().unwrap());
        assert!(contains_impersonation(&headers));
    }

    #[test]
    fn test_detects_impersonate_group() {
        let mut headers = HeaderMap::new();
        headers.insert("Impersonate-Group", "admins".parse().unwrap());
        assert!(contains_impersonation(&headers));
    }

    #[test]
    fn test_detects_impersonate_uid() {
        let mut headers = HeaderMap::new();
        headers.insert("Impersonate-Uid", "1234".parse().unwrap());
        assert!(contains_impersonation(&headers));
    }

    #[test]
    fn test_detects_impersonate_extra_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("Impersonate-Extra-Scopes", "admin".parse().unwrap());
        assert!(contains_impersonation(&headers));
    }

    #[test]
    fn test_ignores_ordinary_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer token".parse().unwrap());
        headers.insert("X-Impersonate-User", "bob".parse().unwrap());
        assert!(!contains_impersonation(&headers));
    }

    #[test]
    fn test_user_header_set() {
        let headers =
            impersonation_headers(&alice(), &ProxyOptions::default(), None).unwrap();
        assert_eq!(names(&headers, IMPERSONATE_USER_HEADER), vec!["alice"]);
    }

    #[test]
    fn test_authenticated_group_appended() {
        let headers =
            impersonation_headers(&alice(), &ProxyOptions::default(), None).unwrap();
        assert_eq!(
            names(&headers, IMPERSONATE_GROUP_HEADER),
            vec!["dev", "system:authenticated"]
        );
    }

    #[test]
    fn test_authenticated_group_not_duplicated() {
        let user = UserInfo {
            groups: vec!["system:authenticated".to_string(), "dev".to_string()],
            ..alice()
        };
        let headers = impersonation_headers(&user, &ProxyOptions::default(), None).unwrap();
        assert_eq!(
            names(&headers, IMPERSONATE_GROUP_HEADER),
            vec!["system:authenticated", "dev"]
        );
    }

    #[test]
    fn test_client_ip_extra_header() {
        let options = ProxyOptions {
            extra_user_headers_client_ip_enabled: true,
            ..Default::default()
        };
        let headers =
            impersonation_headers(&alice(), &options, Some("10.0.0.7:44321")).unwrap();
        assert_eq!(
            names(&headers, "impersonate-extra-remote-client-ip"),
            vec!["10.0.0.7:44321"]
        );
    }

    #[test]
    fn test_client_ip_not_added_when_disabled() {
        let headers = impersonation_headers(
            &alice(),
            &ProxyOptions::default(),
            Some("10.0.0.7:44321"),
        )
        .unwrap();
        assert!(names(&headers, "impersonate-extra-remote-client-ip").is_empty());
    }

    #[test]
    fn test_static_extra_headers_merged() {
        let mut extra_user_headers = HashMap::new();
        extra_user_headers.insert("org".to_string(), vec!["acme".to_string()]);
        let options = ProxyOptions {
            extra_user_headers,
            ..Default::default()
        };

        let headers = impersonation_headers(&alice(), &options, None).unwrap();
        assert_eq!(names(&headers, "impersonate-extra-org"), vec!["acme"]);
    }

    #[test]
    fn test_static_extras_appended_to_identity_extras() {
        let mut user = alice();
        user.extra
            .insert("org".to_string(), vec!["from-token".to_string()]);

        let mut extra_user_headers = HashMap::new();
        extra_user_headers.insert("org".to_string(), vec!["from-config".to_string()]);
        let options = ProxyOptions {
            extra_user_headers,
            ..Default::default()
        };

        let headers = impersonation_headers(&user, &options, None).unwrap();
        assert_eq!(
            names(&headers, "impersonate-extra-org"),
            vec!["from-token", "from-config"]
        );
    }

    #[test]
    fn test_replay_produces_identical_headers() {
        let mut user = alice();
        user.extra.insert("b-key".to_string(), vec!["2".to_string()]);
        user.extra.insert("a-key".to_string(), vec!["1".to_string()]);

        let first = impersonation_headers(&user, &ProxyOptions::default(), None).unwrap();
        let second = impersonation_headers(&user, &ProxyOptions::default(), None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_extra_key_lowercased() {
        assert_eq!(encode_extra_key("Remote-Client-IP"), "remote-client-ip");
    }

    #[test]
    fn test_extra_key_non_token_bytes_percent_encoded() {
        assert_eq!(encode_extra_key("foo bar"), "foo%20bar");
        assert_eq!(encode_extra_key("a/b"), "a%2Fb");
    }

    #[test]
    fn test_extra_key_token_bytes_pass_through() {
        assert_eq!(encode_extra_key("a.b-c_d"), "a.b-c_d");
    }
}
