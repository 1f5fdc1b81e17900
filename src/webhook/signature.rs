use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// SIGNATURE SCHEMES - verification over the exact raw body bytes
// ============================================================================

/// Payment gateway timestamps older than this are rejected outright.
pub const STRIPE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,

    #[error("signature header malformed")]
    Malformed,

    #[error("signature mismatch")]
    Invalid,

    #[error("signed timestamp outside tolerance")]
    StaleTimestamp,
}

/// Plain HMAC-SHA256 scheme: the header carries the hex digest of the raw
/// body. Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_hmac_hex(secret: &str, body: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Invalid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

/// Parse the gateway's `t=...,v1=...` header. Multiple v1 entries appear
/// during secret rotation; any matching one passes.
pub fn parse_stripe_header(header: &str) -> Result<StripeSignatureHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    Ok(StripeSignatureHeader { timestamp, signatures })
}

/// Gateway scheme: HMAC-SHA256 over `"{t}." + body`, with a freshness
/// window on `t` to blunt replay.
pub fn verify_stripe_signature(
    secret: &str,
    body: &[u8],
    header: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_stripe_header(header)?;

    if (now_unix - parsed.timestamp).abs() > STRIPE_TOLERANCE_SECS {
        return Err(SignatureError::StaleTimestamp);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(parsed.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    for candidate in &parsed.signatures {
        let Ok(bytes) = hex::decode(candidate) else {
            continue;
        };
        if mac.clone().verify_slice(&bytes).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Invalid)
}

/// Helper used by tests and outbound signing: hex HMAC digest of a payload.
pub fn hmac_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_hmac_hex_round_trip() {
        let body = br#"{"type":"object_created","object":{"key":"a.jpg"}}"#;
        let signature = hmac_hex(SECRET, body);
        assert!(verify_hmac_hex(SECRET, body, &signature).is_ok());
    }

    #[test]
    fn test_hmac_hex_rejects_tampered_body() {
        let signature = hmac_hex(SECRET, b"original");
        assert_eq!(verify_hmac_hex(SECRET, b"tampered", &signature), Err(SignatureError::Invalid));
    }

    #[test]
    fn test_hmac_hex_rejects_garbage_header() {
        assert_eq!(
            verify_hmac_hex(SECRET, b"body", "not-hex!"),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_parse_stripe_header() {
        let parsed = parse_stripe_header("t=1700000000,v1=abcd,v1=ef01,v0=legacy").unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.signatures, vec!["abcd".to_string(), "ef01".to_string()]);
    }

    #[test]
    fn test_parse_stripe_header_requires_both_fields() {
        assert_eq!(parse_stripe_header("v1=abcd"), Err(SignatureError::Malformed));
        assert_eq!(parse_stripe_header("t=1700000000"), Err(SignatureError::Malformed));
    }

    fn signed_stripe_header(secret: &str, body: &[u8], timestamp: i64) -> String {
        let mut payload = timestamp.to_string().into_bytes();
        payload.push(b'.');
        payload.extend_from_slice(body);
        format!("t={},v1={}", timestamp, hmac_hex(secret, &payload))
    }

    #[test]
    fn test_stripe_signature_round_trip() {
        let body = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let now = 1_700_000_000;
        let header = signed_stripe_header(SECRET, body, now);
        assert!(verify_stripe_signature(SECRET, body, &header, now + 30).is_ok());
    }

    #[test]
    fn test_stripe_signature_rejects_stale_timestamp() {
        let body = b"{}";
        let then = 1_700_000_000;
        let header = signed_stripe_header(SECRET, body, then);
        assert_eq!(
            verify_stripe_signature(SECRET, body, &header, then + STRIPE_TOLERANCE_SECS + 1),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn test_stripe_signature_rejects_wrong_secret() {
        let body = b"{}";
        let now = 1_700_000_000;
        let header = signed_stripe_header("whsec_other", body, now);
        assert_eq!(
            verify_stripe_signature(SECRET, body, &header, now),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_stripe_signature_accepts_any_rotated_key() {
        let body = b"{}";
        let now = 1_700_000_000;
        let mut payload = now.to_string().into_bytes();
        payload.push(b'.');
        payload.extend_from_slice(body);
        let header = format!(
            "t={},v1={},v1={}",
            now,
            hmac_hex("whsec_retired", &payload),
            hmac_hex(SECRET, &payload)
        );
        assert!(verify_stripe_signature(SECRET, body, &header, now).is_ok());
    }
}
