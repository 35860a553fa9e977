//! Market-wide circuit breaker
//!
//! Two time-based breakers share one check:
//! - a process-wide pause when reference symbols crash or turn wild
//! - a per-user suspension when reference data cannot be fetched for that user
//!
//! Neither has a reset call; both lapse on their own.

use crate::domain::entities::market::Candle;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::resilience::{with_timeout, SuspensionMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const GLOBAL_KEY: &str = "*";

#[derive(Debug, Clone)]
pub struct MarketBreakerConfig {
    pub reference_symbols: Vec<String>,
    pub timeframe: String,
    pub candle_limit: usize,
    /// Average close-to-close drop over the last two candles
    pub drop_threshold: f64,
    /// Average (high - low) / close over the last two candles
    pub volatility_threshold: f64,
    pub pause_duration: Duration,
    pub user_suspension: Duration,
    pub call_timeout: Duration,
}

impl Default for MarketBreakerConfig {
    fn default() -> Self {
        Self {
            reference_symbols: vec!["BTC/USDT".to_string()],
            timeframe: "1h".to_string(),
            candle_limit: 2,
            drop_threshold: 0.05,
            volatility_threshold: 0.03,
            pause_duration: Duration::from_secs(3600),
            user_suspension: Duration::from_secs(300),
            call_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketGate {
    Open,
    /// Global pause, applies to every user
    Paused { until: Instant },
    UserSuspended { until: Instant },
}

/// Drop and range of one reference symbol over its last two candles
#[derive(Debug, Clone, Copy)]
struct Sample {
    drop: f64,
    range: f64,
}

fn sample(candles: &[Candle]) -> Option<Sample> {
    let [previous, last] = candles.get(candles.len().checked_sub(2)?..)? else {
        return None;
    };
    if previous.close <= 0.0 {
        return None;
    }
    let drop = (previous.close - last.close) / previous.close;
    let range = (previous.range_fraction()? + last.range_fraction()?) / 2.0;
    Some(Sample { drop, range })
}

pub struct MarketCircuitBreaker {
    exchange: Arc<dyn ExchangeClient>,
    config: MarketBreakerConfig,
    pause: SuspensionMap,
    users: SuspensionMap,
}

impl MarketCircuitBreaker {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: MarketBreakerConfig) -> Self {
        let pause = SuspensionMap::new(config.pause_duration);
        let users = SuspensionMap::new(config.user_suspension);
        Self {
            exchange,
            config,
            pause,
            users,
        }
    }

    /// Whether `user_id` may trade right now.
    pub async fn check(&self, user_id: &str) -> MarketGate {
        if let Some(until) = self.pause.suspended_until(GLOBAL_KEY).await {
            return MarketGate::Paused { until };
        }
        if let Some(until) = self.users.suspended_until(user_id).await {
            return MarketGate::UserSuspended { until };
        }

        let mut samples = Vec::with_capacity(self.config.reference_symbols.len());
        for symbol in &self.config.reference_symbols {
            let fetched = with_timeout(
                self.config.call_timeout,
                self.exchange
                    .fetch_ohlcv(symbol, &self.config.timeframe, self.config.candle_limit),
            )
            .await;

            match fetched {
                Ok(candles) => match sample(&candles) {
                    Some(s) => samples.push(s),
                    None => warn!(
                        "Not enough {} candles for {} ({}), skipping market check",
                        self.config.timeframe,
                        symbol,
                        candles.len()
                    ),
                },
                Err(e) => {
                    let until = self.users.suspend(user_id).await;
                    error!(
                        "Market data for {} failed for {}: {}; suspending user for {:?}",
                        symbol,
                        user_id,
                        e,
                        self.users.duration()
                    );
                    return MarketGate::UserSuspended { until };
                }
            }
        }

        if samples.is_empty() {
            return MarketGate::Open;
        }

        let n = samples.len() as f64;
        let avg_drop = samples.iter().map(|s| s.drop).sum::<f64>() / n;
        let avg_range = samples.iter().map(|s| s.range).sum::<f64>() / n;
        debug!(
            "Market check: avg drop {:.4}, avg range {:.4}",
            avg_drop, avg_range
        );

        if avg_drop > self.config.drop_threshold || avg_range > self.config.volatility_threshold {
            let until = self.pause.suspend(GLOBAL_KEY).await;
            warn!(
                "Market circuit breaker tripped (drop {:.2}%, range {:.2}%), pausing all trading for {:?}",
                avg_drop * 100.0,
                avg_range * 100.0,
                self.pause.duration()
            );
            return MarketGate::Paused { until };
        }

        MarketGate::Open
    }

    pub async fn paused_until(&self) -> Option<Instant> {
        self.pause.suspended_until(GLOBAL_KEY).await
    }

    pub async fn user_suspended_until(&self, user_id: &str) -> Option<Instant> {
        self.users.suspended_until(user_id).await
    }
}
