use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

// AWS canonical encoding: everything except unreserved characters is
// escaped; '/' additionally survives in paths.
const AWS_ENCODE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');
const AWS_ENCODE_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("object store returned status {0}")]
    UnexpectedStatus(u16),
}

impl StorageError {
    /// 5xx and transport errors are worth retrying; 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Request(e) => e.is_timeout() || e.is_connect(),
            StorageError::UnexpectedStatus(status) => *status >= 500,
        }
    }
}

/// A minted presigned PUT target plus the headers the client must send
/// byte-for-byte (they are part of the signature).
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: String,
    pub required_headers: Vec<(String, String)>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub content_length: i64,
    pub content_type: Option<String>,
}

/// S3-compatible object store client. Presigning and request signing are
/// SigV4 composed from the HMAC primitives; requests go through the shared
/// reqwest client.
pub struct StorageService {
    config: StorageConfig,
    http: Client,
}

impl StorageService {
    pub fn new(config: StorageConfig, http: Client) -> Self {
        Self { config, http }
    }

    /// Mint a time-bounded presigned PUT URL with Content-Type,
    /// Content-Length and If-None-Match bound into the signature. The
    /// If-None-Match: * guard refuses overwrites of an existing object.
    pub fn presign_put(
        &self,
        object_key: &str,
        content_type: &str,
        content_length: i64,
        expires_in: Duration,
    ) -> PresignedUpload {
        let now = Utc::now();
        self.presign_put_at(object_key, content_type, content_length, expires_in, now)
    }

    /// Deterministic presign core, separated so the signature math is
    /// testable with a pinned clock.
    pub(crate) fn presign_put_at(
        &self,
        object_key: &str,
        content_type: &str,
        content_length: i64,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> PresignedUpload {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = self.host();
        let path = format!("/{}/{}", self.config.bucket, object_key);
        let credential = format!(
            "{}/{}/{}/{}/aws4_request",
            self.config.access_key_id, date, self.config.region, SERVICE
        );

        let headers = [
            ("content-length", content_length.to_string()),
            ("content-type", content_type.to_string()),
            ("host", host.clone()),
            ("if-none-match", "*".to_string()),
        ];
        let signed_headers = "content-length;content-type;host;if-none-match";

        let mut query: Vec<(String, String)> = vec![
            ("X-Amz-Algorithm".into(), "AWS4-HMAC-SHA256".into()),
            ("X-Amz-Credential".into(), credential.clone()),
            ("X-Amz-Date".into(), amz_date.clone()),
            ("X-Amz-Expires".into(), expires_in.as_secs().to_string()),
            ("X-Amz-SignedHeaders".into(), signed_headers.into()),
        ];
        query.sort();

        let canonical_query = canonical_query_string(&query);
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{}:{}\n", k, v.trim())).collect();
        let canonical_request = format!(
            "PUT\n{}\n{}\n{}\n{}\n{}",
            encode_path(&path),
            canonical_query,
            canonical_headers,
            signed_headers,
            UNSIGNED_PAYLOAD
        );

        let signature = self.sign(&date, &amz_date, &canonical_request);
        let url = format!(
            "{}{}?{}&X-Amz-Signature={}",
            self.config.endpoint,
            encode_path(&path),
            canonical_query,
            signature
        );

        PresignedUpload {
            url,
            required_headers: vec![
                ("Content-Type".to_string(), content_type.to_string()),
                ("Content-Length".to_string(), content_length.to_string()),
                ("If-None-Match".to_string(), "*".to_string()),
            ],
            expires_at: now + chrono::Duration::seconds(expires_in.as_secs() as i64),
        }
    }

    /// HEAD an object; `Ok(None)` when it does not exist.
    pub async fn head_object(&self, object_key: &str) -> Result<Option<ObjectHead>, StorageError> {
        let response = self.signed_request(reqwest::Method::HEAD, object_key).send().await?;
        match response.status().as_u16() {
            200 => {
                let content_length = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                Ok(Some(ObjectHead { content_length, content_type }))
            }
            404 => Ok(None),
            status => Err(StorageError::UnexpectedStatus(status)),
        }
    }

    /// Delete an object. Missing objects count as deleted.
    pub async fn delete_object(&self, object_key: &str) -> Result<(), StorageError> {
        let response = self.signed_request(reqwest::Method::DELETE, object_key).send().await?;
        match response.status().as_u16() {
            200 | 202 | 204 | 404 => Ok(()),
            status => {
                warn!(object_key, status, "object delete rejected");
                Err(StorageError::UnexpectedStatus(status))
            }
        }
    }

    fn signed_request(&self, method: reqwest::Method, object_key: &str) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = self.host();
        let path = format!("/{}/{}", self.config.bucket, object_key);

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, UNSIGNED_PAYLOAD, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            encode_path(&path),
            canonical_headers,
            signed_headers,
            UNSIGNED_PAYLOAD
        );

        let signature = self.sign(&date, &amz_date, &canonical_request);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}/{}/{}/aws4_request, SignedHeaders={}, Signature={}",
            self.config.access_key_id, date, self.config.region, SERVICE, signed_headers, signature
        );

        self.http
            .request(method, format!("{}{}", self.config.endpoint, encode_path(&path)))
            .header("Authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
    }

    fn sign(&self, date: &str, amz_date: &str, canonical_request: &str) -> String {
        let scope = format!("{}/{}/{}/aws4_request", date, self.config.region, SERVICE);
        let hashed_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{}\n{}\n{}", amz_date, scope, hashed_request);

        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_access_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }

    fn host(&self) -> String {
        self.config
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn canonical_query_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, AWS_ENCODE),
                utf8_percent_encode(v, AWS_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, AWS_ENCODE_PATH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_service() -> StorageService {
        StorageService::new(
            StorageConfig {
                account_id: "acct".to_string(),
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                bucket: "photos".to_string(),
                region: "auto".to_string(),
                webhook_secret: "unused".to_string(),
                endpoint: "https://acct.r2.cloudflarestorage.com".to_string(),
            },
            Client::new(),
        )
    }

    #[test]
    fn test_presign_url_shape() {
        let svc = test_service();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let presigned = svc.presign_put_at(
            "events/abc/raw/photo-1.jpg",
            "image/jpeg",
            1024,
            Duration::from_secs(900),
            now,
        );

        assert!(presigned.url.starts_with(
            "https://acct.r2.cloudflarestorage.com/photos/events/abc/raw/photo-1.jpg?"
        ));
        assert!(presigned.url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(presigned.url.contains("X-Amz-Date=20250601T120000Z"));
        assert!(presigned.url.contains("X-Amz-Expires=900"));
        assert!(presigned.url.contains(
            "X-Amz-SignedHeaders=content-length%3Bcontent-type%3Bhost%3Bif-none-match"
        ));
        assert_eq!(presigned.expires_at, now + chrono::Duration::seconds(900));
    }

    #[test]
    fn test_presign_signature_is_hex_and_deterministic() {
        let svc = test_service();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = svc.presign_put_at("k.jpg", "image/jpeg", 10, Duration::from_secs(60), now);
        let b = svc.presign_put_at("k.jpg", "image/jpeg", 10, Duration::from_secs(60), now);
        assert_eq!(a.url, b.url);

        let sig = a.url.split("X-Amz-Signature=").nth(1).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_binds_headers() {
        let svc = test_service();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = svc.presign_put_at("k.jpg", "image/jpeg", 10, Duration::from_secs(60), now);
        let b = svc.presign_put_at("k.jpg", "image/png", 10, Duration::from_secs(60), now);
        let c = svc.presign_put_at("k.jpg", "image/jpeg", 11, Duration::from_secs(60), now);
        let sig = |p: &PresignedUpload| p.url.split("X-Amz-Signature=").nth(1).unwrap().to_string();
        assert_ne!(sig(&a), sig(&b));
        assert_ne!(sig(&a), sig(&c));
    }

    #[test]
    fn test_required_headers_match_bound_values() {
        let svc = test_service();
        let presigned = svc.presign_put("k.jpg", "image/webp", 2048, Duration::from_secs(60));
        assert!(presigned
            .required_headers
            .contains(&("Content-Type".to_string(), "image/webp".to_string())));
        assert!(presigned
            .required_headers
            .contains(&("Content-Length".to_string(), "2048".to_string())));
        assert!(presigned
            .required_headers
            .contains(&("If-None-Match".to_string(), "*".to_string())));
    }

    #[test]
    fn test_canonical_query_encoding() {
        let params = vec![("X-Amz-Credential".to_string(), "AKID/20250601/auto/s3/aws4_request".to_string())];
        let encoded = canonical_query_string(&params);
        assert_eq!(
            encoded,
            "X-Amz-Credential=AKID%2F20250601%2Fauto%2Fs3%2Faws4_request"
        );
    }
}
