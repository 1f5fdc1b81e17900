use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::config::AppleConfig;

// ============================================================================
// STORE JWS VERIFIER - ES256 over an x5c chain anchored at the vendor root
// ============================================================================

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("JWS header unparsable: {0}")]
    Header(#[from] jsonwebtoken::errors::Error),

    #[error("JWS header carries no certificate chain")]
    MissingChain,

    #[error("certificate chain malformed")]
    BadChain,

    #[error("certificate outside its validity window")]
    ExpiredCertificate,

    #[error("certificate chain does not terminate at the configured root")]
    UntrustedRoot,

    #[error("certificate signature verification failed")]
    BadCertificateSignature,
}

/// Verifies the store's signed notification payloads. Built once per
/// configuration (the root certificate is loaded at startup) and shared
/// across requests; rebuild on configuration change.
pub struct StoreJwsVerifier {
    root_cert_der: Vec<u8>,
}

impl StoreJwsVerifier {
    pub fn new(config: &AppleConfig) -> Self {
        Self { root_cert_der: config.root_cert_der.clone() }
    }

    /// Verify a JWS and deserialize its claims. The embedded x5c chain must
    /// verify link-by-link and terminate at the configured root; the
    /// signature itself is checked against the leaf key.
    pub fn verify<T: DeserializeOwned>(&self, jws: &str) -> Result<T, JwsError> {
        let header = decode_header(jws)?;
        let x5c = header.x5c.ok_or(JwsError::MissingChain)?;
        if x5c.is_empty() {
            return Err(JwsError::MissingChain);
        }

        let chain_der: Vec<Vec<u8>> = x5c
            .iter()
            .map(|cert| BASE64.decode(cert).map_err(|_| JwsError::BadChain))
            .collect::<Result<_, _>>()?;

        let leaf_spki = self.verify_chain(&chain_der)?;

        let key = DecodingKey::from_ec_der(&leaf_spki);
        let mut validation = Validation::new(Algorithm::ES256);
        // Notification payloads carry no exp claim; the certificate windows
        // and the per-event correlation keys bound replay instead.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Ok(decode::<T>(jws, &key, &validation)?.claims)
    }

    /// Walk leaf -> intermediate -> root. Returns the leaf's public key
    /// point for the JWS signature check.
    fn verify_chain(&self, chain_der: &[Vec<u8>]) -> Result<Vec<u8>, JwsError> {
        let certs: Vec<X509Certificate> = chain_der
            .iter()
            .map(|der| {
                X509Certificate::from_der(der).map(|(_, cert)| cert).map_err(|_| JwsError::BadChain)
            })
            .collect::<Result<_, _>>()?;

        for cert in &certs {
            if !cert.validity().is_valid() {
                return Err(JwsError::ExpiredCertificate);
            }
        }

        // Each certificate must be signed by its successor.
        for pair in certs.windows(2) {
            pair[0]
                .verify_signature(Some(pair[1].public_key()))
                .map_err(|_| JwsError::BadCertificateSignature)?;
        }

        // The anchor must be byte-identical to the configured root. A chain
        // that omits the root is accepted if its last link is signed by it.
        let last_der = chain_der.last().expect("chain checked non-empty");
        if last_der != &self.root_cert_der {
            let (_, root) = X509Certificate::from_der(&self.root_cert_der)
                .map_err(|_| JwsError::BadChain)?;
            certs
                .last()
                .expect("chain checked non-empty")
                .verify_signature(Some(root.public_key()))
                .map_err(|_| JwsError::UntrustedRoot)?;
        }

        Ok(certs[0].public_key().subject_public_key.data.to_vec())
    }
}
