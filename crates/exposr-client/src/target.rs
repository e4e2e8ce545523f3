//! Connections to the local target endpoint

use crate::error::{ConfigError, TunnelError};
use crate::resolver::CachingResolver;
use exposr_transport::tls;
use exposr_transport::TransportSecurityConfig;
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

/// Well-known port for a target scheme.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" | "tls" => Some(443),
        "ssh" => Some(22),
        "smtp" => Some(25),
        "postgres" => Some(5432),
        "mysql" => Some(3306),
        "redis" => Some(6379),
        _ => None,
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "https" | "wss" | "tls")
}

/// Byte stream to the target, plain TCP or TLS over TCP.
pub trait TargetIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TargetIo for T {}

pub type TargetStream = Box<dyn TargetIo>;

#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    /// Accept any certificate for any name on TLS targets
    pub allow_insecure: bool,
    /// Shared across connectors so every transport benefits from one cache
    pub resolver: Arc<CachingResolver>,
}

struct TargetTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Dials the target described by a URL. One attempt per call, no retries.
pub struct TargetConnector {
    url: Url,
    host: String,
    port: u16,
    tls: Option<TargetTls>,
    resolver: Arc<CachingResolver>,
}

impl fmt::Debug for TargetConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConnector")
            .field("url", &self.url.as_str())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl TargetConnector {
    pub fn new(url: &Url, options: TargetOptions) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTarget {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| invalid("no port given and no default port for scheme"))?;

        let tls = if is_tls_scheme(url.scheme()) {
            let security = TransportSecurityConfig {
                verify_server_cert: !options.allow_insecure,
                root_certs: Vec::new(),
            };
            let connector =
                tls::tls_connector(&security).map_err(|e| ConfigError::Tls(e.to_string()))?;
            let server_name =
                tls::server_name(host).map_err(|e| ConfigError::Tls(e.to_string()))?;
            Some(TargetTls {
                connector,
                server_name,
            })
        } else {
            None
        };

        Ok(Self {
            url: url.clone(),
            host: host.to_string(),
            port,
            tls,
            resolver: options.resolver,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` of the target
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub async fn connect(&self) -> Result<TargetStream, TunnelError> {
        let target_error = |source: io::Error| TunnelError::Target {
            target: self.address(),
            source,
        };

        let addrs = self
            .resolver
            .resolve(&self.host, self.port)
            .await
            .map_err(target_error)?;

        let tcp = TcpStream::connect(&addrs[..]).await.map_err(target_error)?;
        let _ = tcp.set_nodelay(true);
        debug!("Connected to target {}", self.address());

        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(target_error)?;
                debug!("TLS established with target {}", self.address());
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_default_ports() {
        assert_eq!(default_port("http"), Some(80));
        assert_eq!(default_port("wss"), Some(443));
        assert_eq!(default_port("postgres"), Some(5432));
        assert_eq!(default_port("tcp"), None);
    }

    #[test]
    fn test_connector_requires_port() {
        let url = Url::parse("tcp://localhost").unwrap();
        assert!(matches!(
            TargetConnector::new(&url, TargetOptions::default()),
            Err(ConfigError::InvalidTarget { .. })
        ));

        let url = Url::parse("redis://cache").unwrap();
        let connector = TargetConnector::new(&url, TargetOptions::default()).unwrap();
        assert_eq!(connector.address(), "cache:6379");
        assert!(!connector.is_tls());
    }

    #[test]
    fn test_tls_schemes() {
        for raw in ["https://example.com", "tls://10.0.0.1:8443", "wss://[::1]"] {
            let url = Url::parse(raw).unwrap();
            let connector = TargetConnector::new(&url, TargetOptions::default()).unwrap();
            assert!(connector.is_tls(), "{}", raw);
        }
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let url = Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let connector = TargetConnector::new(&url, TargetOptions::default()).unwrap();
        let mut stream = connector.connect().await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let connector = TargetConnector::new(&url, TargetOptions::default()).unwrap();
        match connector.connect().await {
            Err(TunnelError::Target { target, source }) => {
                assert_eq!(target, format!("127.0.0.1:{}", port));
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected target error, got {:?}", other.map(|_| ())),
        }
    }
}
