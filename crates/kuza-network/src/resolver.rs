//! Address Resolver with Caching
//!
//! Resolves domains to exact host ranges with:
//! - A static bootstrap table consulted before any network activity
//! - Caching of live lookups (failures are cached for a shorter time)
//! - Live lookup through a pluggable [`LiveLookup`] (hickory by default)

use crate::address_table::{host_range, normalize_domain, StaticAddressTable};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Lookup failed for {domain}: {reason}")]
    LookupFailed { domain: String, reason: String },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("{0} is not in the address table and live lookup is disabled")]
    Unknown(String),

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Cache TTL for failed lookups
    pub negative_cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// Whether to use system DNS or Cloudflare
    pub use_system_dns: bool,
    /// Timeout for a single live lookup
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            negative_cache_ttl: Duration::from_secs(60),
            max_cache_entries: 10000,
            use_system_dns: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Live (network) lookup of a normalized domain.
#[async_trait]
pub trait LiveLookup: Send + Sync {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// [`LiveLookup`] backed by hickory's tokio resolver
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    /// Build a resolver from the system configuration or Cloudflare.
    pub fn new(config: &DnsConfig) -> Result<Self, ResolveError> {
        let (resolver_config, mut opts) = if config.use_system_dns {
            hickory_resolver::system_conf::read_system_conf()
                .map_err(|e| ResolveError::ResolverError(e.to_string()))?
        } else {
            (ResolverConfig::cloudflare(), ResolverOpts::default())
        };
        opts.timeout = config.timeout;

        info!(system = config.use_system_dns, "Live DNS lookup initialized");

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
        })
    }
}

#[async_trait]
impl LiveLookup for HickoryLookup {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self.resolver.lookup_ip(domain).await.map_err(|e| {
            ResolveError::LookupFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(lookup.iter().collect())
    }
}

/// Cached live lookup outcome
#[derive(Clone)]
struct CacheEntry {
    result: Result<Vec<IpAddr>, ResolveError>,
    expires_at: Instant,
}

/// Domain → host range resolver
///
/// Two resolutions of the same domain against the same cache state
/// always produce the same set.
pub struct AddressResolver {
    table: StaticAddressTable,
    live: Option<Arc<dyn LiveLookup>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    config: DnsConfig,
}

impl AddressResolver {
    /// Resolver that answers only from the static table.
    pub fn static_only(table: StaticAddressTable) -> Self {
        Self {
            table,
            live: None,
            cache: RwLock::new(HashMap::new()),
            config: DnsConfig::default(),
        }
    }

    /// Resolver with a live fallback for domains absent from the table.
    pub fn new(table: StaticAddressTable, live: Arc<dyn LiveLookup>, config: DnsConfig) -> Self {
        Self {
            table,
            live: Some(live),
            cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Resolver with hickory as the live fallback.
    pub fn with_hickory(table: StaticAddressTable, config: DnsConfig) -> Result<Self, ResolveError> {
        let live = HickoryLookup::new(&config)?;
        Ok(Self::new(table, Arc::new(live), config))
    }

    /// The bootstrap table in use
    pub fn table(&self) -> &StaticAddressTable {
        &self.table
    }

    /// Resolve a domain, treating every failure as "no addresses".
    ///
    /// Failures are logged here; callers must tolerate partial resolution.
    pub async fn resolve(&self, domain: &str) -> BTreeSet<IpNet> {
        match self.try_resolve(domain).await {
            Ok(ranges) => ranges,
            Err(e) => {
                warn!(domain, error = %e, "Domain resolution failed");
                BTreeSet::new()
            }
        }
    }

    /// Resolve a domain to exact host ranges.
    pub async fn try_resolve(&self, domain: &str) -> Result<BTreeSet<IpNet>, ResolveError> {
        let normalized =
            normalize_domain(domain).ok_or_else(|| ResolveError::InvalidDomain(domain.to_string()))?;

        // 1. Static table, before any network activity
        if let Some((suffix, addrs)) = self.table.lookup(&normalized) {
            debug!(domain = %normalized, suffix, "Address table hit");
            return Ok(addrs.iter().copied().map(host_range).collect());
        }

        // 2. Cache
        if let Some(cached) = self.get_cached(&normalized) {
            debug!(domain = %normalized, "Resolution cache hit");
            return cached.map(|addrs| addrs.into_iter().map(host_range).collect());
        }

        // 3. Live lookup
        let live = self
            .live
            .as_ref()
            .ok_or_else(|| ResolveError::Unknown(normalized.clone()))?;

        debug!(domain = %normalized, "Live DNS lookup");
        let result = match tokio::time::timeout(self.config.timeout, live.lookup(&normalized)).await {
            Ok(Ok(addrs)) if addrs.is_empty() => Err(ResolveError::NoAddresses(normalized.clone())),
            Ok(result) => result,
            Err(_) => Err(ResolveError::LookupFailed {
                domain: normalized.clone(),
                reason: "timed out".to_string(),
            }),
        };

        self.cache_result(&normalized, &result);

        result.map(|addrs| addrs.into_iter().map(host_range).collect())
    }

    /// Clear all cached entries
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.clear();
        info!("Resolution cache cleared");
    }

    /// Cache statistics: (total entries, unexpired entries)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let total = cache.len();
        let live = cache.values().filter(|e| e.expires_at > now).count();
        (total, live)
    }

    fn get_cached(&self, domain: &str) -> Option<Result<Vec<IpAddr>, ResolveError>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);

        cache
            .get(domain)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.result.clone())
    }

    fn cache_result(&self, domain: &str, result: &Result<Vec<IpAddr>, ResolveError>) {
        let ttl = match result {
            Ok(_) => self.config.cache_ttl,
            Err(_) => self.config.negative_cache_ttl,
        };

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        // Evict expired entries first, then an arbitrary quarter if still full
        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            if cache.len() >= self.config.max_cache_entries {
                let keys_to_remove: Vec<_> = cache.keys().take(cache.len() / 4 + 1).cloned().collect();
                for key in keys_to_remove {
                    cache.remove(&key);
                }
            }
        }

        cache.insert(
            domain.to_string(),
            CacheEntry {
                result: result.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
