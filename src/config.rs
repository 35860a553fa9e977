use crate::domain::services::balance_gateway::BalanceGatewayConfig;
use crate::domain::services::daily_limit::DailyLimitConfig;
use crate::domain::services::deposit_valuator::DepositValuatorConfig;
use crate::domain::services::market_breaker::MarketBreakerConfig;
use crate::domain::services::position_monitor::ExitPolicy;
use crate::domain::services::price_cache::PriceCacheConfig;
use crate::domain::services::risk_sizer::RiskSizerConfig;
use crate::domain::services::trade_ledger::TradeLedgerConfig;
use crate::domain::value_objects::fee_model::FeeModel;
use crate::persistence::DatabaseConfig;
use crate::rate_limit::RateLimiterConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Configuration of the whole engine, one section per component
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Users processed concurrently by one trading cycle
    pub max_concurrent_users: usize,
    /// Signals below this confidence are not traded
    pub min_signal_confidence: f64,
    /// OHLCV window handed to the signal source each cycle
    pub signal_timeframe: String,
    pub signal_candles: usize,
    pub price_cache: PriceCacheConfig,
    pub deposit: DepositValuatorConfig,
    pub balance: BalanceGatewayConfig,
    pub daily_limits: DailyLimitConfig,
    pub risk: RiskSizerConfig,
    pub market: MarketBreakerConfig,
    pub exit: ExitPolicy,
    pub ledger: TradeLedgerConfig,
    pub database: DatabaseConfig,
    pub rate_limit: RateLimiterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_users: 10,
            min_signal_confidence: 0.7,
            signal_timeframe: "1h".to_string(),
            signal_candles: 50,
            price_cache: PriceCacheConfig::default(),
            deposit: DepositValuatorConfig::default(),
            balance: BalanceGatewayConfig::default(),
            daily_limits: DailyLimitConfig::default(),
            risk: RiskSizerConfig::default(),
            market: MarketBreakerConfig::default(),
            exit: ExitPolicy::default(),
            ledger: TradeLedgerConfig::default(),
            database: DatabaseConfig::default(),
            rate_limit: RateLimiterConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> EngineConfig {
        // a missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` on top of the defaults.
    ///
    /// Out-of-range or unparsable values are logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> EngineConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(url) = lookup("TRADECORE_DATABASE_URL") {
            if url.trim().is_empty() {
                warn!("Ignoring empty TRADECORE_DATABASE_URL");
            } else {
                config.database.url = url;
            }
        }

        if let Some(users) = parse(&lookup, "TRADECORE_MAX_CONCURRENT_USERS", |v: &usize| *v > 0) {
            config.max_concurrent_users = users;
        }

        if let Some(quote) = lookup("TRADECORE_QUOTE_CURRENCY") {
            let quote = quote.trim().to_uppercase();
            if quote.is_empty() || !quote.chars().all(|c| c.is_ascii_alphanumeric()) {
                warn!("Invalid TRADECORE_QUOTE_CURRENCY '{}', keeping default", quote);
            } else {
                config.deposit.quote_currency = quote;
            }
        }

        if let Some(ratio) = parse(&lookup, "TRADECORE_DAILY_LIMIT_RATIO", |v: &f64| {
            *v > 0.0 && *v <= 1.0
        }) {
            config.daily_limits.daily_limit_ratio = ratio;
        }

        if let Some(drawdown) = parse(&lookup, "TRADECORE_MAX_DRAWDOWN", |v: &f64| {
            *v > 0.0 && *v < 1.0
        }) {
            config.risk.max_drawdown = drawdown;
        }

        if let Some(rate) = parse(&lookup, "TRADECORE_FEE_RATE", |v: &f64| {
            (0.0..0.1).contains(v)
        }) {
            // one fee model for budget floors and realized PNL
            config.daily_limits.fee_model = FeeModel::new(rate);
            config.exit.fee_model = FeeModel::new(rate);
        }

        if let Some(secs) = parse(&lookup, "TRADECORE_POLL_INTERVAL_SECONDS", |v: &u64| *v > 0) {
            config.exit.poll_interval = Duration::from_secs(secs);
        }

        if let Some(fraction) = parse(&lookup, "TRADECORE_PARTIAL_CLOSE_FRACTION", |v: &f64| {
            *v > 0.0 && *v <= 1.0
        }) {
            config.exit.partial_close_fraction = fraction;
        }

        if let Some(symbols) = lookup("TRADECORE_REFERENCE_SYMBOLS") {
            let symbols: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                warn!("TRADECORE_REFERENCE_SYMBOLS is empty, keeping default");
            } else {
                config.market.reference_symbols = symbols;
            }
        }

        if let Some(rpm) = parse(&lookup, "TRADECORE_EXCHANGE_REQUESTS_PER_MINUTE", |v: &u32| {
            *v > 0
        }) {
            config.rate_limit.requests_per_minute = rpm;
        }

        if let Some(confidence) = parse(&lookup, "TRADECORE_MIN_SIGNAL_CONFIDENCE", |v: &f64| {
            (0.0..=1.0).contains(v)
        }) {
            config.min_signal_confidence = confidence;
        }

        config
    }
}

fn parse<T, F, V>(lookup: &F, name: &str, valid: V) -> Option<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(value) => {
            warn!("{} out of range ({}), keeping default", name, value);
            None
        }
        Err(e) => {
            warn!("Invalid {} '{}': {}, keeping default", name, raw, e);
            None
        }
    }
}
