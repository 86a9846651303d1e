use crate::error::{Result, SupervisorError};
use crate::ipc::protocol::{
    AddressFamily, LookupAddress, LookupOptions, LookupResult, ResolveOptions, ResolvedRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Shared DNS cache used on behalf of sandboxed analyses
///
/// One resolver is shared by every supervisor, so implementations must
/// tolerate concurrent lookups.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup(&self, hostname: &str, options: &LookupOptions) -> Result<LookupResult>;

    async fn resolve4(&self, hostname: &str, options: &ResolveOptions)
        -> Result<Vec<ResolvedRecord>>;

    async fn resolve6(&self, hostname: &str, options: &ResolveOptions)
        -> Result<Vec<ResolvedRecord>>;
}

struct CachedAnswer {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// System resolver with a TTL cache in front of it
pub struct CachingResolver {
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedAnswer>>,
}

impl CachingResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of hostnames currently cached (expired ones included)
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Resolve a hostname, returning its addresses and the remaining lifetime
    async fn addresses(&self, hostname: &str) -> Result<(Vec<IpAddr>, Duration)> {
        let now = Instant::now();

        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(hostname) {
                if hit.expires_at > now {
                    return Ok((hit.addresses.clone(), hit.expires_at - now));
                }
            }
        }

        debug!("Resolving {} through the system resolver", hostname);

        let resolved = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| SupervisorError::DnsError(hostname.to_string(), e.to_string()))?;

        let mut addresses: Vec<IpAddr> = Vec::new();
        for socket_addr in resolved {
            if !addresses.contains(&socket_addr.ip()) {
                addresses.push(socket_addr.ip());
            }
        }

        if addresses.is_empty() {
            return Err(SupervisorError::DnsError(
                hostname.to_string(),
                "ENOTFOUND".to_string(),
            ));
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|_, answer| answer.expires_at > now);
            cache.insert(
                hostname.to_string(),
                CachedAnswer {
                    addresses: addresses.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }

        Ok((addresses, self.ttl))
    }

    async fn resolve_family(
        &self,
        hostname: &str,
        options: &ResolveOptions,
        v6: bool,
    ) -> Result<Vec<ResolvedRecord>> {
        let (addresses, remaining) = self.addresses(hostname).await?;

        let records: Vec<ResolvedRecord> = addresses
            .into_iter()
            .filter(|ip| ip.is_ipv6() == v6)
            .map(|ip| {
                if options.ttl {
                    ResolvedRecord::WithTtl {
                        address: ip.to_string(),
                        ttl: remaining.as_secs() as u32,
                    }
                } else {
                    ResolvedRecord::Address(ip.to_string())
                }
            })
            .collect();

        if records.is_empty() {
            return Err(SupervisorError::DnsError(
                hostname.to_string(),
                "ENODATA".to_string(),
            ));
        }

        Ok(records)
    }
}

#[async_trait]
impl DnsResolver for CachingResolver {
    async fn lookup(&self, hostname: &str, options: &LookupOptions) -> Result<LookupResult> {
        let (addresses, _) = self.addresses(hostname).await?;

        let mut matching: Vec<LookupAddress> = addresses
            .into_iter()
            .filter(|ip| match options.family {
                AddressFamily::Any => true,
                AddressFamily::V4 => ip.is_ipv4(),
                AddressFamily::V6 => ip.is_ipv6(),
            })
            .map(|ip| LookupAddress {
                address: ip.to_string(),
                family: if ip.is_ipv4() { 4 } else { 6 },
            })
            .collect();

        if matching.is_empty() {
            return Err(SupervisorError::DnsError(
                hostname.to_string(),
                "ENOTFOUND".to_string(),
            ));
        }

        if options.all {
            Ok(LookupResult::All(matching))
        } else {
            Ok(LookupResult::One(matching.remove(0)))
        }
    }

    async fn resolve4(
        &self,
        hostname: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<ResolvedRecord>> {
        self.resolve_family(hostname, options, false).await
    }

    async fn resolve6(
        &self,
        hostname: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<ResolvedRecord>> {
        self.resolve_family(hostname, options, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_ip_literal() {
        let resolver = CachingResolver::new(Duration::from_secs(60));

        let result = resolver
            .lookup("127.0.0.1", &LookupOptions::default())
            .await
            .unwrap();

        assert_eq!(
            result,
            LookupResult::One(LookupAddress {
                address: "127.0.0.1".to_string(),
                family: 4,
            })
        );
        assert_eq!(resolver.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_lookup_all() {
        let resolver = CachingResolver::new(Duration::from_secs(60));
        let options = LookupOptions {
            family: AddressFamily::Any,
            all: true,
        };

        let result = resolver.lookup("127.0.0.1", &options).await.unwrap();
        assert!(matches!(result, LookupResult::All(ref list) if list.len() == 1));
    }

    #[tokio::test]
    async fn test_family_mismatch_is_an_error() {
        let resolver = CachingResolver::new(Duration::from_secs(60));
        let options = LookupOptions {
            family: AddressFamily::V6,
            all: false,
        };

        let result = resolver.lookup("127.0.0.1", &options).await;
        assert!(matches!(result, Err(SupervisorError::DnsError(_, _))));

        let result = resolver
            .resolve6("127.0.0.1", &ResolveOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve4_with_ttl() {
        let resolver = CachingResolver::new(Duration::from_secs(120));

        let records = resolver
            .resolve4("127.0.0.1", &ResolveOptions { ttl: true })
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        match &records[0] {
            ResolvedRecord::WithTtl { address, ttl } => {
                assert_eq!(address, "127.0.0.1");
                assert!(*ttl <= 120);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entries_expire() {
        let resolver = CachingResolver::new(Duration::from_secs(10));

        resolver
            .resolve4("127.0.0.1", &ResolveOptions::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        resolver
            .resolve4("127.0.0.2", &ResolveOptions::default())
            .await
            .unwrap();

        // The expired entry is pruned when the next answer is cached
        assert_eq!(resolver.cached_entries(), 1);
    }
}
