pub mod admission;
pub mod balance_gateway;
pub mod daily_limit;
pub mod deposit_valuator;
pub mod market_breaker;
pub mod position_monitor;
pub mod price_cache;
pub mod resilience;
pub mod risk_sizer;
pub mod trade_ledger;
