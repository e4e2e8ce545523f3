//! Caching resolver for target hostnames

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

/// Longest time a positive answer is served from the cache
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Names kept in the cache
pub const DEFAULT_MAX_ENTRIES: usize = 10;

/// Resolves target hostnames through a small TTL-bounded cache. IP literals
/// are returned as-is and never reach the resolver.
pub struct CachingResolver {
    resolver: TokioAsyncResolver,
}

impl fmt::Debug for CachingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingResolver").finish()
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl CachingResolver {
    /// Resolver using the system configuration, falling back to the
    /// resolver crate's defaults when it can not be read.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(e) => {
                debug!("Using default resolver configuration: {}", e);
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.cache_size = max_entries.max(1);
        opts.positive_max_ttl = Some(ttl);

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Resolve `host` to socket addresses on `port`.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let lookup = self
            .resolver
            .lookup_ip(bare)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;

        let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No addresses found for {}", bare),
            ));
        }
        trace!("Resolved {} to {:?}", bare, addrs);
        Ok(addrs)
    }

    /// Drop every cached answer.
    pub fn clear(&self) {
        self.resolver.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literals_bypass_resolver() {
        let resolver = CachingResolver::default();

        let addrs = resolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);

        let addrs = resolver.resolve("[::1]", 443).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_localhost_resolves_with_port() {
        let resolver = CachingResolver::default();

        let first = resolver.resolve("localhost", 80).await.unwrap();
        assert!(!first.is_empty());
        assert!(first.iter().all(|addr| addr.ip().is_loopback()));

        // Served again with the new port
        let second = resolver.resolve("LOCALHOST", 81).await.unwrap();
        assert!(second.iter().all(|addr| addr.port() == 81));

        resolver.clear();
        assert!(!resolver.resolve("localhost", 82).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_is_not_found() {
        let resolver = CachingResolver::new(Duration::from_secs(5), 2);
        let err = resolver.resolve("target.invalid", 80).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
