//! TLS utilities for certificate generation and configuration

use crate::util::{C2Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ServerConfig;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::{fs::File, io::BufReader, path::Path};

impl From<rustls::Error> for C2Error {
    fn from(err: rustls::Error) -> Self {
        C2Error::Tls(format!("rustls error: {}", err))
    }
}

impl From<rcgen::Error> for C2Error {
    fn from(err: rcgen::Error) -> Self {
        C2Error::Tls(format!("rcgen error: {}", err))
    }
}

/// Generate a self-signed certificate valid for `localhost` and `server_name`
pub fn generate_key_pair(
    server_name: Option<&str>,
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let name = server_name.unwrap_or("localhost");
    let subject_alt_names = vec![name.to_string(), "localhost".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)?;

    let cert_der: CertificateDer<'static> = certified_key.cert.der().to_vec().into();
    let key_der: PrivateKeyDer<'static> =
        PrivateKeyDer::Pkcs8(certified_key.signing_key.serialize_der().into());

    Ok((cert_der, key_der))
}

/// Create a server TLS config with a generated certificate
pub fn create_server_config() -> Result<Arc<ServerConfig>> {
    let (cert, key) = generate_key_pair(None)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    Ok(Arc::new(config))
}

/// Create a server TLS config by loading certificate/private key from disk (PEM).
pub fn create_server_config_from_files<P: AsRef<Path>>(
    cert_path: P,
    key_path: P,
) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path.as_ref())?;

    let key_file = File::open(&key_path).map_err(C2Error::Io)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| C2Error::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| {
            C2Error::Tls(format!("no private key found in {:?}", key_path.as_ref()))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(path).map_err(C2Error::Io)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| C2Error::Tls(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(C2Error::Tls(format!("no certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Certificate verifier that accepts every certificate (skip-verify connectors)
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Create a client TLS config that accepts any server certificate
pub fn create_insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoCertificateVerification));

    Arc::new(config)
}

/// Trust store holding the bundled Mozilla root certificates
pub fn default_root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Create a verifying client TLS config trusting the given roots
pub fn create_client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Create a verifying client TLS config trusting the PEM certificates in `ca_path`
pub fn create_client_config_from_file<P: AsRef<Path>>(ca_path: P) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path.as_ref())? {
        roots.add(cert)?;
    }
    Ok(create_client_config(roots))
}
