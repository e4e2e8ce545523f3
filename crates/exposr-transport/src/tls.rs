//! rustls client setup shared by the broker transport and the target connector

use crate::{TransportError, TransportResult, TransportSecurityConfig};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::IpAddr;
use std::sync::Arc;

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Build a rustls client configuration.
///
/// With `verify_server_cert` off any certificate for any name is accepted.
pub fn client_config(security: &TransportSecurityConfig) -> TransportResult<rustls::ClientConfig> {
    ensure_crypto_provider();

    if !security.verify_server_cert {
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();

    if security.root_certs.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for cert_der in &security.root_certs {
            roots
                .add(CertificateDer::from(cert_der.clone()))
                .map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Build a `tokio_rustls` connector from [`client_config`].
pub fn tls_connector(
    security: &TransportSecurityConfig,
) -> TransportResult<tokio_rustls::TlsConnector> {
    let config = client_config(security)?;
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

/// TLS server name for `host`.
///
/// IP literals map to an IP server name, for which rustls sends no SNI.
pub fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_for_ip_literal() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(server_name("[::1]").unwrap(), ServerName::IpAddress(_)));
    }

    #[test]
    fn test_server_name_for_hostname() {
        assert!(matches!(
            server_name("example.com").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name("bad name!").is_err());
    }

    #[test]
    fn test_insecure_client_config_builds() {
        let security = TransportSecurityConfig {
            verify_server_cert: false,
            ..Default::default()
        };
        assert!(client_config(&security).is_ok());
        assert!(client_config(&TransportSecurityConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_root_cert_rejected() {
        let security = TransportSecurityConfig {
            verify_server_cert: true,
            root_certs: vec![vec![0, 1, 2, 3]],
        };
        assert!(client_config(&security).is_err());
    }
}
