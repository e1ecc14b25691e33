//! DTLS-SRTP collaborator seam.
//!
//! The agent owns a self-signed certificate whose SHA-256 fingerprint goes
//! into the SDP answer; the handshake itself is a collaborator behind
//! [`DtlsHandshake`], which must hand back the SRTP master keys exported
//! under the "EXTRACTOR-dtls_srtp" PRF label once the handshake completes.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use crate::ice::Conn;
use crate::srtp::SrtpKeyMaterial;

/// Exporter label fixed by RFC 5764 §4.2.
pub const SRTP_EXTRACTOR_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Which end of the DTLS handshake this agent plays. `a=setup:active`
/// answers make us the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum DtlsError {
    #[error("dtls handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("transport closed during handshake")]
    TransportClosed,
}

/// Per-process certificate identity used for `a=fingerprint`.
pub struct Identity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl Identity {
    /// Mint a fresh self-signed EC certificate.
    pub fn generate() -> anyhow::Result<Self> {
        let params = CertificateParams::new(vec!["aperture".to_string()])
            .context("Failed to create certificate params")?;
        let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign certificate")?;
        Ok(Self {
            cert_der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// SHA-256 fingerprint of the certificate, colon-separated uppercase
    /// hex as SDP expects after `a=fingerprint:sha-256 `.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.cert_der);
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }
}

/// The handshake collaborator. A deployment links a real DTLS stack behind
/// this; the contract is only that the returned material is the 60-byte
/// "EXTRACTOR-dtls_srtp" export, split per RFC 5764.
pub trait DtlsHandshake: Send + Sync {
    fn handshake<'a>(
        &'a self,
        conn: &'a Conn,
        role: DtlsRole,
    ) -> Pin<Box<dyn Future<Output = Result<SrtpKeyMaterial, DtlsError>> + Send + 'a>>;
}

/// Handshake double that returns pre-agreed key material without touching
/// the wire. Used by loopback tests and preshared-key deployments.
pub struct StaticKeyHandshake {
    material: SrtpKeyMaterial,
}

impl StaticKeyHandshake {
    pub fn new(material: SrtpKeyMaterial) -> Self {
        Self { material }
    }

    /// Keys from the `APERTURE_SRTP_KEYS` environment variable: 120 hex
    /// characters holding the 60-byte exporter block.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("APERTURE_SRTP_KEYS").ok()?;
        match parse_material_hex(&raw) {
            Some(material) => Some(Self::new(material)),
            None => {
                tracing::warn!("APERTURE_SRTP_KEYS is not 120 hex characters, ignoring");
                None
            }
        }
    }

    /// Process-random material. Streams are encrypted, but no remote peer
    /// holds the keys; stands in until a real DTLS stack is linked.
    pub fn process_random() -> Self {
        let mut block = [0u8; crate::srtp::KEY_MATERIAL_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut block[..]);
        Self::new(SrtpKeyMaterial::from_dtls_export(&block).expect("fixed length"))
    }
}

fn parse_material_hex(raw: &str) -> Option<SrtpKeyMaterial> {
    let raw = raw.trim();
    if raw.len() != 2 * crate::srtp::KEY_MATERIAL_LEN {
        return None;
    }
    let mut block = [0u8; crate::srtp::KEY_MATERIAL_LEN];
    for (i, chunk) in raw.as_bytes().chunks_exact(2).enumerate() {
        let pair = std::str::from_utf8(chunk).ok()?;
        block[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    SrtpKeyMaterial::from_dtls_export(&block).ok()
}

impl DtlsHandshake for StaticKeyHandshake {
    fn handshake<'a>(
        &'a self,
        _conn: &'a Conn,
        _role: DtlsRole,
    ) -> Pin<Box<dyn Future<Output = Result<SrtpKeyMaterial, DtlsError>> + Send + 'a>> {
        let material = self.material.clone();
        Box::pin(async move { Ok(material) })
    }
}
