//! DNS cache in front of the system resolver.
//!
//! Positive entries live for the cache TTL (default 5 minutes),
//! negative entries for 30 seconds. An upstream connect failure evicts
//! the entry so the next request re-resolves.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum CacheEntry {
    Hit {
        addrs: Vec<SocketAddr>,
        expires: Instant,
    },
    Miss {
        expires: Instant,
    },
}

pub struct DnsCache {
    ttl: Duration,
    negative_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_NEGATIVE_TTL)
    }
}

impl DnsCache {
    pub fn new(ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            ttl,
            negative_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `host:port`, consulting the cache first. Cached
    /// addresses are re-keyed by host, so the same host on a different
    /// port resolves without a fresh lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let now = Instant::now();
        {
            let entries = self.entries.lock().await;
            match entries.get(host) {
                Some(CacheEntry::Hit { addrs, expires }) if *expires > now => {
                    return Ok(addrs
                        .iter()
                        .map(|addr| SocketAddr::new(addr.ip(), port))
                        .collect());
                }
                Some(CacheEntry::Miss { expires }) if *expires > now => {
                    bail!("resolution of {host} failed recently (negative cache)");
                }
                _ => {}
            }
        }

        match lookup_host((host, port))
            .await
            .with_context(|| format!("DNS lookup failed for {host}"))
        {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    self.store_miss(host).await;
                    bail!("DNS lookup returned no addresses for {host}");
                }
                let mut entries = self.entries.lock().await;
                entries.insert(
                    host.to_string(),
                    CacheEntry::Hit {
                        addrs: addrs.clone(),
                        expires: now + self.ttl,
                    },
                );
                Ok(addrs)
            }
            Err(e) => {
                self.store_miss(host).await;
                Err(e)
            }
        }
    }

    async fn store_miss(&self, host: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            host.to_string(),
            CacheEntry::Miss {
                expires: Instant::now() + self.negative_ttl,
            },
        );
    }

    /// Drop a cached entry; called when connecting to a cached address
    /// fails.
    pub async fn evict(&self, host: &str) {
        self.entries.lock().await.remove(host);
    }

    /// Insert a known-good resolution. Used at startup for static
    /// entries and by tests.
    pub async fn prime(&self, host: &str, addrs: Vec<SocketAddr>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            host.to_string(),
            CacheEntry::Hit {
                addrs,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_localhost() {
        let cache = DnsCache::default();
        let addrs = cache.resolve("localhost", 8080).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 8080));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_rekeys_port() {
        let cache = DnsCache::default();
        cache
            .prime("service.internal", vec!["10.0.0.9:443".parse().unwrap()])
            .await;
        let addrs = cache.resolve("service.internal", 8443).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.9:8443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_negative_cache_short_circuits() {
        let cache = DnsCache::new(DEFAULT_TTL, Duration::from_secs(60));
        let bogus = "definitely-not-a-real-host.invalid";
        assert!(cache.resolve(bogus, 80).await.is_err());
        // Second failure comes from the negative cache.
        let err = cache.resolve(bogus, 80).await.unwrap_err();
        assert!(err.to_string().contains("negative cache"));
    }

    #[tokio::test]
    async fn test_evict_forces_fresh_lookup() {
        let cache = DnsCache::default();
        cache
            .prime("service.internal", vec!["10.0.0.9:443".parse().unwrap()])
            .await;
        cache.evict("service.internal").await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_positive_entry_is_ignored() {
        let cache = DnsCache::new(Duration::ZERO, DEFAULT_NEGATIVE_TTL);
        cache
            .prime("localhost", vec!["127.0.0.1:1".parse().unwrap()])
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Entry expired; falls through to a real lookup of localhost.
        let addrs = cache.resolve("localhost", 9000).await.unwrap();
        assert!(addrs.iter().all(|a| a.port() == 9000));
    }
}
