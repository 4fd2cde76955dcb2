//! DTLS certificate: ECDSA P-256 key plus DER certificate.
//!
//! Loaded from PEM files when configured, otherwise a self-signed certificate
//! is generated at startup. The SHA-256 fingerprint of the DER bytes is what
//! answers advertise in `a=fingerprint:sha-256`.

use std::fs;
use std::path::Path;

use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;

use super::crypto::{fingerprint_hex, sha256};
use super::error::{Error, Result};
use crate::config::ServerConfig;

const PEM_CERT_TAG: &str = "CERTIFICATE";

pub struct Certificate {
    der: Vec<u8>,
    signing_key: SigningKey,
    fingerprint: String,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// Load the configured certificate, or generate one if no paths are set.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        match (&config.certificate_path, &config.key_path) {
            (Some(cert), Some(key)) => Self::load(cert, key),
            (None, None) => Self::generate(),
            _ => Err(Error::Certificate(
                "certificate_path and key_path must be set together".into(),
            )),
        }
    }

    /// Generate a self-signed ECDSA P-256 certificate.
    pub fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("key generation: {}", e)))?;
        let params = rcgen::CertificateParams::new(vec!["sfu".to_string()])
            .map_err(|e| Error::Certificate(format!("certificate params: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("self-signing: {}", e)))?;

        let signing_key = SigningKey::from_pkcs8_der(&key_pair.serialize_der())
            .map_err(|e| Error::Certificate(format!("generated key: {}", e)))?;
        let cert = Self::new(cert.der().to_vec(), signing_key);
        tracing::info!("Generated self-signed DTLS certificate {}", cert.fingerprint);
        Ok(cert)
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;
        let cert = Self::from_pem(&cert_pem, &key_pem)?;
        tracing::info!(
            "Loaded DTLS certificate {} ({})",
            cert_path.display(),
            cert.fingerprint
        );
        Ok(cert)
    }

    /// Parse a PEM certificate and a PKCS#8 or SEC1 PEM P-256 private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let der = decode_pem_certificate(cert_pem)?;
        let signing_key = match SigningKey::from_pkcs8_pem(key_pem) {
            Ok(key) => key,
            Err(_) => p256::SecretKey::from_sec1_pem(key_pem)
                .map(SigningKey::from)
                .map_err(|e| Error::Certificate(format!("private key is not P-256: {}", e)))?,
        };
        Ok(Self::new(der, signing_key))
    }

    fn new(der: Vec<u8>, signing_key: SigningKey) -> Self {
        let fingerprint = fingerprint_hex(&sha256(&der));
        Self {
            der,
            signing_key,
            fingerprint,
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// `XX:XX:..` SHA-256 fingerprint of the DER certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// SHA-256 fingerprint of arbitrary DER bytes in SDP form.
pub fn fingerprint_of(der: &[u8]) -> String {
    fingerprint_hex(&sha256(der))
}

/// DER of the first `CERTIFICATE` block; chains may follow it.
fn decode_pem_certificate(input: &str) -> Result<Vec<u8>> {
    let blocks = pem::parse_many(input)
        .map_err(|e| Error::Certificate(format!("certificate PEM: {}", e)))?;
    blocks
        .into_iter()
        .find(|block| block.tag() == PEM_CERT_TAG)
        .map(pem::Pem::into_contents)
        .ok_or_else(|| Error::Certificate("no PEM certificate block".into()))
}
