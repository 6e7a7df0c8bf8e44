//! Certificate plumbing for the local testbed.
//!
//! The server loads a PEM pair from disk, generating a self-signed
//! `localhost` pair on first boot if none exists. Clients run with
//! verification disabled; the testbed talks to itself over loopback.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::ALPN_H3;

/// Load the PEM cert chain and private key, creating a self-signed pair
/// next to the given paths if either file is missing.
pub fn load_or_generate(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if !cert_path.is_file() || !key_path.is_file() {
        generate_self_signed(cert_path, key_path)?;
    }
    let certs = rustls_pemfile::certs(&mut fs::File::open(cert_path).map(std::io::BufReader::new)?)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("read certificates from {}", cert_path.display()))?;
    ensure!(!certs.is_empty(), "no certificates in {}", cert_path.display());
    let key = rustls_pemfile::private_key(&mut fs::File::open(key_path).map(std::io::BufReader::new)?)
        .with_context(|| format!("read private key from {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;
    Ok((certs, key))
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("generate self-signed certificate")?;
    if let Some(parent) = cert_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(cert_path, cert.pem()).context("write certificate")?;
    fs::write(key_path, key_pair.serialize_pem()).context("write private key")?;
    tracing::info!(cert = %cert_path.display(), "generated self-signed certificate pair");
    Ok(())
}

/// Server-side TLS config with the `h3` ALPN.
pub fn server_crypto(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server TLS config")?;
    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Ok(config)
}

/// Client-side TLS config with certificate verification disabled.
pub fn insecure_client_crypto() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    config
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider())))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
