//! AWS Signature Version 4 request signing.
//!
//! Implements the canonical-request flow: canonicalize method, URI,
//! query, and headers; hash the payload; derive the signing key through
//! the kSecret → kDate → kRegion → kService → kSigning HMAC chain; and
//! emit the `Authorization`, `x-amz-date`, and optional
//! `x-amz-security-token` headers injected by the proxy.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::credentials::CredentialMaterial;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Headers the signer produces for injection into the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub x_amz_date: String,
    pub x_amz_security_token: Option<String>,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// kSecret → kDate → kRegion → kService → kSigning.
fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret}");
    let k_date = hmac(k_secret.as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

/// Canonical query string: parameters sorted by name, values kept in
/// their already-encoded form.
fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut params: Vec<(&str, &str)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .collect();
    params.sort();
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Sign one request. `path` and `query` must be the already-encoded
/// components of the target URL; `body` is the full payload.
pub fn sign_request(
    credentials: &CredentialMaterial,
    service: &str,
    method: &str,
    host: &str,
    path: &str,
    query: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(body);

    // Signed header set: host and x-amz-date always, the session token
    // when present.
    let mut header_pairs: Vec<(String, String)> = vec![
        ("host".to_string(), host.to_ascii_lowercase()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
    }
    header_pairs.sort();

    let canonical_headers: String = header_pairs
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_header_names = header_pairs
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_uri = if path.is_empty() { "/" } else { path };
    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
        canonical_query(query),
    );

    let scope = format!("{date}/{}/{service}/aws4_request", credentials.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &credentials.secret_access_key,
        &date,
        &credentials.region,
        service,
    );
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

    SignedHeaders {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_header_names}, Signature={signature}",
            credentials.access_key_id
        ),
        x_amz_date: amz_date,
        x_amz_security_token: credentials.session_token.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_credentials(token: Option<&str>) -> CredentialMaterial {
        CredentialMaterial {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: token.map(String::from),
            region: "us-east-1".to_string(),
            nonce: "nonce".to_string(),
        }
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    #[test]
    fn test_signature_shape() {
        let headers = sign_request(
            &test_credentials(None),
            "bedrock",
            "POST",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/anthropic.claude-3/invoke",
            "",
            br#"{"prompt":"hi"}"#,
            test_time(),
        );

        assert!(headers.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/bedrock/aws4_request"
        ));
        assert!(headers.authorization.contains("SignedHeaders=host;x-amz-date"));
        assert_eq!(headers.x_amz_date, "20150830T123600Z");
        assert!(headers.x_amz_security_token.is_none());

        let signature = headers
            .authorization
            .rsplit("Signature=")
            .next()
            .unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_token_joins_signed_headers() {
        let headers = sign_request(
            &test_credentials(Some("FwoGZXIvYXdzEBc")),
            "bedrock",
            "POST",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/m/invoke",
            "",
            b"{}",
            test_time(),
        );
        assert!(
            headers
                .authorization
                .contains("SignedHeaders=host;x-amz-date;x-amz-security-token")
        );
        assert_eq!(headers.x_amz_security_token.as_deref(), Some("FwoGZXIvYXdzEBc"));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let a = sign_request(
            &test_credentials(None),
            "bedrock",
            "GET",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/",
            "",
            b"",
            test_time(),
        );
        let b = sign_request(
            &test_credentials(None),
            "bedrock",
            "GET",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/",
            "",
            b"",
            test_time(),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_varies_with_inputs() {
        let base = sign_request(
            &test_credentials(None),
            "bedrock",
            "GET",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/",
            "",
            b"",
            test_time(),
        );

        let mut other_creds = test_credentials(None);
        other_creds.secret_access_key = "different-secret".to_string();
        let with_other_secret = sign_request(
            &other_creds,
            "bedrock",
            "GET",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/",
            "",
            b"",
            test_time(),
        );
        assert_ne!(base.authorization, with_other_secret.authorization);

        let with_body = sign_request(
            &test_credentials(None),
            "bedrock",
            "GET",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/",
            "",
            b"payload",
            test_time(),
        );
        assert_ne!(base.authorization, with_body.authorization);
    }

    #[test]
    fn test_canonical_query_sorts_parameters() {
        assert_eq!(canonical_query(""), "");
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query("flag"), "flag=");
        assert_eq!(canonical_query("a=1&a=0"), "a=0&a=1");
    }

    #[test]
    fn test_key_derivation_chain_changes_per_level() {
        let base = derive_signing_key("secret", "20150830", "us-east-1", "bedrock");
        assert_eq!(base.len(), 32);
        assert_ne!(
            base,
            derive_signing_key("secret", "20150831", "us-east-1", "bedrock")
        );
        assert_ne!(
            base,
            derive_signing_key("secret", "20150830", "us-west-2", "bedrock")
        );
        assert_ne!(
            base,
            derive_signing_key("secret", "20150830", "us-east-1", "s3")
        );
    }
}
