//! BalanceGateway - fetches and caches account balances per user, with a
//! per-user circuit breaker around the exchange

use crate::domain::entities::balance::Balances;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::resilience::{
    attempt, with_timeout, KeyedLocks, RetryPolicy, SuspensionMap,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct BalanceGatewayConfig {
    pub retry: RetryPolicy,
    /// Per-attempt deadline; a timeout counts as a failed attempt
    pub call_timeout: Duration,
    pub cache_ttl: Duration,
    pub suspension: Duration,
}

impl Default for BalanceGatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3, Duration::from_secs(2)),
            call_timeout: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(30),
            suspension: Duration::from_secs(300),
        }
    }
}

/// Outcome of a balance fetch. Failures never escape as errors: after the
/// retry budget is spent the user is suspended and that is the answer.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceFetch {
    Balance(Balances),
    Suspended { until: Instant },
}

/// Cached balance entry with timestamp
#[derive(Clone, Debug)]
struct CachedBalance {
    balances: Balances,
    cached_at: Instant,
}

pub struct BalanceGateway {
    exchange: Arc<dyn ExchangeClient>,
    config: BalanceGatewayConfig,
    cache: Mutex<HashMap<String, CachedBalance>>,
    suspensions: SuspensionMap,
    user_locks: KeyedLocks,
}

impl BalanceGateway {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: BalanceGatewayConfig) -> Self {
        let suspensions = SuspensionMap::new(config.suspension);
        Self {
            exchange,
            config,
            cache: Mutex::new(HashMap::new()),
            suspensions,
            user_locks: KeyedLocks::default(),
        }
    }

    /// Balances for `user_id`, from cache when fresh unless `force_refresh`.
    pub async fn fetch_balance(&self, user_id: &str, force_refresh: bool) -> BalanceFetch {
        let _guard = self.user_locks.lock(user_id).await;

        if let Some(until) = self.suspensions.suspended_until(user_id).await {
            debug!("Balance fetch for {} short-circuited, suspended", user_id);
            return BalanceFetch::Suspended { until };
        }

        if !force_refresh {
            if let Some(cached) = self.cache.lock().await.get(user_id) {
                if cached.cached_at.elapsed() < self.config.cache_ttl {
                    debug!(
                        "Returning cached balance for {} (age: {:?})",
                        user_id,
                        cached.cached_at.elapsed()
                    );
                    return BalanceFetch::Balance(cached.balances.clone());
                }
            }
        }

        let operation = format!("fetch_balance({})", user_id);
        let result = attempt(&operation, &self.config.retry, || {
            with_timeout(self.config.call_timeout, self.exchange.fetch_balance(user_id))
        })
        .await;

        match result {
            Ok(balances) => {
                self.suspensions.clear(user_id).await;
                self.cache.lock().await.insert(
                    user_id.to_string(),
                    CachedBalance {
                        balances: balances.clone(),
                        cached_at: Instant::now(),
                    },
                );
                info!("Balance refreshed for {}: {} assets", user_id, balances.len());
                BalanceFetch::Balance(balances)
            }
            Err(e) => {
                let until = self.suspensions.suspend(user_id).await;
                error!(
                    "Balance fetch for {} exhausted retries ({}); suspended for {:?}",
                    user_id,
                    e,
                    self.suspensions.duration()
                );
                BalanceFetch::Suspended { until }
            }
        }
    }

    pub async fn suspended_until(&self, user_id: &str) -> Option<Instant> {
        self.suspensions.suspended_until(user_id).await
    }
}
