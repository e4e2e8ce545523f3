//! WebSocket transport configuration

use exposr_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use std::time::Duration;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Security configuration
    security: TransportSecurityConfig,

    /// Keep-alive interval (ping frames)
    pub keep_alive_interval: Duration,

    /// How long `close()` waits for the broker to acknowledge the close frame
    pub close_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,

    /// Capacity of each per-stream inbound channel
    pub stream_buffer: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            keep_alive_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(1),
            max_message_size: 16 * 1024 * 1024, // 16MB
            stream_buffer: 256,
        }
    }
}

impl WebSocketConfig {
    /// Create a client configuration for local development (skip cert verification)
    pub fn insecure() -> Self {
        Self::default().with_insecure_skip_verify()
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set how long a local close waits for the broker
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Trust these DER encoded roots instead of the bundled web roots
    pub fn with_root_certs(mut self, roots: Vec<Vec<u8>>) -> Self {
        self.security.root_certs = roots;
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Build rustls TlsConnector for `wss://` endpoints
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        exposr_transport::tls::tls_connector(&self.security)
    }
}

impl TransportConfig for WebSocketConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be greater than zero".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(TransportError::ConfigurationError(
                "Stream buffer must hold at least one chunk".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert!(config.security_config().verify_server_cert);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_insecure_config() {
        let config = WebSocketConfig::insecure();
        assert!(!config.security_config().verify_server_cert);
        assert!(config.build_tls_connector().is_ok());
    }

    #[test]
    fn test_zero_keep_alive_rejected() {
        let config = WebSocketConfig::default().with_keep_alive(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
