//! Tunnel descriptor as returned by `GET /v1/tunnel/{id}`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Name of the ingress whose URL is used as the public host for header
/// rewriting.
pub const HTTP_INGRESS: &str = "http";

/// Broker view of a tunnel. Read-only to the client; refreshed by reading it
/// again from the tunnel service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub id: String,

    #[serde(default)]
    pub connection: ConnectionInfo,

    #[serde(default)]
    pub transport: TransportInfo,

    #[serde(default)]
    pub ingress: BTreeMap<String, IngressInfo>,

    /// Older brokers call this `upstream`
    #[serde(default, alias = "upstream")]
    pub target: TargetInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub connected: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    /// Upper bound on concurrent transport connections accepted by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws: Option<WsTransportInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsTransportInfo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressInfo {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,

    /// Alternative names announced for the ingress, including `url`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<Url>,
}

impl IngressInfo {
    /// Every public URL of this ingress, primary first.
    pub fn public_urls(&self) -> Vec<&Url> {
        let mut urls: Vec<&Url> = self.url.iter().collect();
        for url in &self.urls {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

impl TunnelDescriptor {
    /// Broker endpoint the transport connects to, if the WebSocket transport
    /// is enabled for this tunnel.
    pub fn transport_endpoint(&self) -> Option<&Url> {
        self.transport
            .ws
            .as_ref()
            .filter(|ws| ws.enabled)
            .and_then(|ws| ws.url.as_ref())
    }

    /// Public URL of the HTTP ingress, when enabled.
    pub fn http_ingress_url(&self) -> Option<&Url> {
        self.ingress
            .get(HTTP_INGRESS)
            .filter(|ingress| ingress.enabled)
            .and_then(|ingress| ingress.url.as_ref())
    }

    /// Enabled ingresses and their public URLs.
    pub fn enabled_ingress(&self) -> impl Iterator<Item = (&str, Vec<&Url>)> {
        self.ingress
            .iter()
            .filter(|(_, ingress)| ingress.enabled)
            .map(|(name, ingress)| (name.as_str(), ingress.public_urls()))
    }

    pub fn max_connections(&self) -> Option<u32> {
        self.transport.max_connections
    }
}
