//! Client configuration

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;
use crate::target::default_port;
use exposr_proto::CLOSE_POLICY_VIOLATION;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Headers whose URL-shaped values can be rewritten from the public ingress
/// to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RewriteHeader {
    Host,
    Referer,
    Origin,
}

impl RewriteHeader {
    pub const ALL: [RewriteHeader; 3] = [Self::Host, Self::Referer, Self::Origin];

    /// Lowercase header name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Referer => "referer",
            Self::Origin => "origin",
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(self.as_str())
    }
}

impl FromStr for RewriteHeader {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|header| header.matches(s.trim()))
            .ok_or_else(|| ConfigError::UnknownRewriteHeader(s.to_string()))
    }
}

impl fmt::Display for RewriteHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header rewrite and replace rules applied to requests sent to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRules {
    /// Transform requested (`--http-mode`)
    pub enabled: bool,
    pub rewrite_headers: BTreeSet<RewriteHeader>,
    /// Lowercased header name to value. An empty value drops the header.
    pub(crate) replace_headers: BTreeMap<String, String>,
}

impl Default for TransformRules {
    fn default() -> Self {
        Self {
            enabled: false,
            rewrite_headers: RewriteHeader::ALL.into_iter().collect(),
            replace_headers: BTreeMap::new(),
        }
    }
}

impl TransformRules {
    /// Set a replacement value for `name`, matched case-insensitively.
    pub fn replace_header(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let name = name.trim();
        if !is_header_token(name) {
            return Err(ConfigError::InvalidHeaderName(name.to_string()));
        }
        self.replace_headers
            .insert(name.to_ascii_lowercase(), value.trim().to_string());
        Ok(())
    }

    /// Parse a `NAME:VALUE` replace specification. The value may itself
    /// contain colons; an empty value drops the header.
    pub fn parse_replace_spec(spec: &str) -> Result<(String, String), ConfigError> {
        let (name, value) = spec
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidHeaderSpec(spec.to_string()))?;
        let name = name.trim();
        if !is_header_token(name) {
            return Err(ConfigError::InvalidHeaderName(name.to_string()));
        }
        Ok((name.to_ascii_lowercase(), value.trim().to_string()))
    }

    /// Replacement for `name`: `Some("")` means drop the header.
    pub fn replacement(&self, name: &str) -> Option<&str> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.replace_headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str)
        } else {
            self.replace_headers.get(name).map(String::as_str)
        }
    }

    pub fn rewrites(&self, name: &str) -> bool {
        self.rewrite_headers.iter().any(|h| h.matches(name))
    }

    pub fn replace_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.replace_headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Requested and with at least one rule to apply
    pub fn is_active(&self) -> bool {
        self.enabled && (!self.rewrite_headers.is_empty() || !self.replace_headers.is_empty())
    }
}

/// RFC 9110 token
fn is_header_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub target_url: Url,
    /// Skip certificate verification for TLS targets
    pub allow_insecure: bool,
    pub max_transports: usize,
    pub transform: TransformRules,
    pub handshake_timeout: Duration,
    /// Close codes after which a transport slot stops reconnecting
    pub no_reconnect_close_codes: BTreeSet<u16>,
    pub backoff: BackoffConfig,
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }
}

/// Builder for TunnelConfig
#[derive(Debug)]
pub struct TunnelConfigBuilder {
    target_url: Option<String>,
    allow_insecure: bool,
    max_transports: usize,
    transform: TransformRules,
    replace: Vec<(String, String)>,
    rewrite: Option<Vec<String>>,
    handshake_timeout: Duration,
    no_reconnect_close_codes: BTreeSet<u16>,
    backoff: BackoffConfig,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            target_url: None,
            allow_insecure: false,
            max_transports: 1,
            transform: TransformRules::default(),
            replace: Vec::new(),
            rewrite: None,
            handshake_timeout: Duration::from_secs(2),
            no_reconnect_close_codes: [CLOSE_POLICY_VIOLATION].into_iter().collect(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl TunnelConfigBuilder {
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    pub fn max_transports(mut self, max: usize) -> Self {
        self.max_transports = max;
        self
    }

    pub fn http_mode(mut self, enabled: bool) -> Self {
        self.transform.enabled = enabled;
        self
    }

    /// Replace the default rewrite set (host, referer, origin).
    pub fn rewrite_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rewrite = Some(headers.into_iter().map(Into::into).collect());
        self
    }

    pub fn replace_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.replace.push((name.into(), value.into()));
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn no_reconnect_close_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.no_reconnect_close_codes = codes.into_iter().collect();
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        let raw = self.target_url.ok_or(ConfigError::MissingTarget)?;
        let target_url = validate_target(&raw)?;

        if self.max_transports == 0 {
            return Err(ConfigError::InvalidMaxTransports);
        }

        let mut transform = self.transform;
        if let Some(rewrite) = self.rewrite {
            transform.rewrite_headers = rewrite
                .iter()
                .map(|name| name.parse())
                .collect::<Result<_, _>>()?;
        }
        for (name, value) in &self.replace {
            transform.replace_header(name, value)?;
        }

        Ok(TunnelConfig {
            target_url,
            allow_insecure: self.allow_insecure,
            max_transports: self.max_transports,
            transform,
            handshake_timeout: self.handshake_timeout,
            no_reconnect_close_codes: self.no_reconnect_close_codes,
            backoff: self.backoff,
        })
    }
}

fn validate_target(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTarget {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if url.host().is_none() {
        return Err(invalid("missing host"));
    }
    if url.port().or_else(|| default_port(url.scheme())).is_none() {
        return Err(invalid("no port given and no default port for scheme"));
    }
    Ok(url)
}
