//! DepositValuator - turns raw balances into one quote-currency valuation

use crate::domain::entities::balance::Balances;
use crate::domain::services::price_cache::PriceResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DepositValuatorConfig {
    pub quote_currency: String,
    pub cache_ttl: Duration,
}

impl Default for DepositValuatorConfig {
    fn default() -> Self {
        Self {
            quote_currency: "USDT".to_string(),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedValuation {
    value: f64,
    cached_at: Instant,
}

pub struct DepositValuator {
    resolver: Arc<PriceResolver>,
    config: DepositValuatorConfig,
    cache: Mutex<HashMap<String, CachedValuation>>,
}

impl DepositValuator {
    pub fn new(resolver: Arc<PriceResolver>, config: DepositValuatorConfig) -> Self {
        Self {
            resolver,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn quote_currency(&self) -> &str {
        &self.config.quote_currency
    }

    /// Total value of `balances` in the quote currency.
    ///
    /// Assets without a resolvable price are left out of the total.
    pub async fn value_deposit(&self, user_id: &str, balances: &Balances) -> f64 {
        if let Some(cached) = self.cache.lock().await.get(user_id) {
            if cached.cached_at.elapsed() < self.config.cache_ttl {
                debug!(
                    "Returning cached deposit for {} (age: {:?})",
                    user_id,
                    cached.cached_at.elapsed()
                );
                return cached.value;
            }
        }

        let quote = self.config.quote_currency.as_str();
        let mut total = 0.0;
        let mut skipped = Vec::new();

        for (asset, balance) in balances {
            if balance.is_empty() {
                continue;
            }
            if asset == quote {
                total += balance.total;
                continue;
            }
            match self.resolver.resolve(asset, quote).await {
                Some(price) => total += balance.total * price,
                None => skipped.push(asset.clone()),
            }
        }

        if !skipped.is_empty() {
            warn!(
                "Deposit of {} excludes unpriced assets: {}",
                user_id,
                skipped.join(", ")
            );
        }

        self.cache.lock().await.insert(
            user_id.to_string(),
            CachedValuation {
                value: total,
                cached_at: Instant::now(),
            },
        );
        info!("Deposit valuated for {}: {:.2} {}", user_id, total, quote);

        total
    }
}
