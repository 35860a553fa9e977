//! Short-lived cache of asset prices plus multi-hop price resolution.

use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::resilience::with_timeout;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PriceCacheConfig {
    pub ttl: Duration,
    /// Upper bound on cached pairs; least recently used pairs are evicted first
    pub capacity: usize,
    /// Assets tried as a bridge when no direct pair exists
    pub intermediates: Vec<String>,
    pub call_timeout: Duration,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1024,
            intermediates: vec!["BTC".to_string(), "ETH".to_string()],
            call_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    expires_at: Instant,
}

/// `asset/quote -> price` with a fixed TTL.
///
/// Concurrent refreshes of the same pair are allowed; the last write wins.
pub struct PriceCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn pair_key(asset: &str, quote: &str) -> String {
        format!("{}/{}", asset, quote)
    }

    pub async fn get(&self, pair: &str) -> Option<f64> {
        let mut entries = self.entries.lock().await;
        match entries.get(pair) {
            Some(cached) if Instant::now() < cached.expires_at => Some(cached.price),
            Some(_) => {
                entries.pop(pair);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, pair: &str, price: f64) {
        let cached = CachedPrice {
            price,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().await.put(pair.to_string(), cached);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Resolves `asset -> quote` prices, directly or through one intermediate asset.
///
/// An unresolvable price is a data-availability condition, reported as `None`.
pub struct PriceResolver {
    exchange: Arc<dyn ExchangeClient>,
    cache: Arc<PriceCache>,
    intermediates: Vec<String>,
    call_timeout: Duration,
}

impl PriceResolver {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        cache: Arc<PriceCache>,
        config: &PriceCacheConfig,
    ) -> Self {
        Self {
            exchange,
            cache,
            intermediates: config.intermediates.clone(),
            call_timeout: config.call_timeout,
        }
    }

    pub async fn resolve(&self, asset: &str, quote: &str) -> Option<f64> {
        if asset == quote {
            return Some(1.0);
        }

        let key = PriceCache::pair_key(asset, quote);
        if let Some(price) = self.cache.get(&key).await {
            return Some(price);
        }

        if let Some(price) = self.fetch_pair(asset, quote).await {
            return Some(price);
        }

        for mid in &self.intermediates {
            if mid == asset || mid == quote {
                continue;
            }
            let Some(first_leg) = self.fetch_pair(asset, mid).await else {
                continue;
            };
            let Some(second_leg) = self.fetch_pair(mid, quote).await else {
                continue;
            };
            let price = first_leg * second_leg;
            debug!(
                "Resolved {} via {}: {} x {} = {}",
                key, mid, first_leg, second_leg, price
            );
            self.cache.insert(&key, price).await;
            return Some(price);
        }

        warn!("No price route for {}", key);
        None
    }

    /// One leg, served from cache when fresh.
    async fn fetch_pair(&self, base: &str, quote: &str) -> Option<f64> {
        let key = PriceCache::pair_key(base, quote);
        if let Some(price) = self.cache.get(&key).await {
            return Some(price);
        }

        match with_timeout(self.call_timeout, self.exchange.fetch_ticker(&key)).await {
            Ok(ticker) if ticker.last > 0.0 && ticker.last.is_finite() => {
                self.cache.insert(&key, ticker.last).await;
                Some(ticker.last)
            }
            Ok(ticker) => {
                debug!("Ignoring non-positive price {} for {}", ticker.last, key);
                None
            }
            Err(e) => {
                debug!("No ticker for {}: {}", key, e);
                None
            }
        }
    }
}
