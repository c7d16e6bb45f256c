//! Asynchronous DNS resolution with memoized results

use crate::{Error, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use tracing::debug;

const CACHE_SIZE: usize = 512;

/// DNS resolver wrapping the system configuration, with an LRU memo so a
/// destination that is hit repeatedly resolves once.
pub struct Resolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<LruCache<String, Vec<IpAddr>>>,
}

impl Resolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("system resolver unavailable ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        Resolver {
            resolver,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Resolve a host to a single IP
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let ips = self.resolve_all(host).await?;
        ips.first()
            .copied()
            .ok_or_else(|| Error::dns(format!("no IP found for {}", host)))
    }

    /// Resolve a host to all of its IPs
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(ips) = self.cache.lock().get(host) {
            return Ok(ips.clone());
        }

        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::dns(format!("lookup failed for {}: {}", host, e)))?;

        let ips: Vec<IpAddr> = response.iter().collect();
        if ips.is_empty() {
            return Err(Error::dns(format!("no IP found for {}", host)));
        }

        debug!("DNS {} -> {}", host, ips[0]);
        self.cache.lock().put(host.to_string(), ips.clone());
        Ok(ips)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_passthrough() {
        let resolver = Resolver::new();
        let ip = resolver.resolve("192.0.2.1").await.unwrap();
        assert_eq!(ip, "192.0.2.1".parse::<IpAddr>().unwrap());

        let ip6 = resolver.resolve("::1").await.unwrap();
        assert_eq!(ip6, "::1".parse::<IpAddr>().unwrap());
    }
}
