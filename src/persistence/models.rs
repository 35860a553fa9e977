//! Database Models
//!
//! Row types for the ledger tables and their conversions to domain records.

use crate::domain::entities::order::OrderSide;
use crate::domain::entities::trade::{TradeRecord, TradeSource, TradeStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::ledger_store::StoredTrade;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Trade record row
#[derive(Debug, Clone, FromRow)]
pub struct TradeRow {
    pub seq: i64,
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String, // "buy" or "sell"
    pub amount: f64,
    pub price: f64,
    pub timestamp_ms: i64,
    pub signals: String,
    pub signal_metrics: String,
    pub market_conditions: String,
    pub pnl: f64,
    pub status: String,
    pub related_trade_id: Option<String>,
    pub source: String, // "real" or "backtest"
    pub strategy_tag: Option<String>,
    pub expires_at_ms: i64,
}

/// JSON blob keyed by user (summaries, risk state)
#[derive(Debug, Clone, FromRow)]
pub struct UserBlobRow {
    pub user_id: String,
    pub payload: String,
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn corrupt(id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn payload(id: &str, column: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(id, format!("{}: {}", column, e)))
}

impl TradeRow {
    pub fn into_stored(self) -> Result<StoredTrade, StoreError> {
        let id = self.trade_id.as_str();
        let side = OrderSide::parse(&self.side)
            .ok_or_else(|| corrupt(id, format!("unknown side '{}'", self.side)))?;
        let status = TradeStatus::parse(&self.status)
            .ok_or_else(|| corrupt(id, format!("unknown status '{}'", self.status)))?;
        let source = TradeSource::parse(&self.source)
            .ok_or_else(|| corrupt(id, format!("unknown source '{}'", self.source)))?;
        let timestamp = from_millis(self.timestamp_ms)
            .ok_or_else(|| corrupt(id, "timestamp out of range"))?;
        let expires_at = from_millis(self.expires_at_ms)
            .ok_or_else(|| corrupt(id, "expiry out of range"))?;
        let signals = payload(id, "signals", &self.signals)?;
        let signal_metrics = payload(id, "signal_metrics", &self.signal_metrics)?;
        let market_conditions = payload(id, "market_conditions", &self.market_conditions)?;

        Ok(StoredTrade {
            record: TradeRecord {
                trade_id: self.trade_id,
                user_id: self.user_id,
                symbol: self.symbol,
                side,
                amount: self.amount,
                price: self.price,
                timestamp,
                signals,
                signal_metrics,
                market_conditions,
                pnl: self.pnl,
                status,
                related_trade_id: self.related_trade_id,
                source,
                strategy_tag: self.strategy_tag,
            },
            expires_at,
        })
    }

    pub fn into_record(self) -> Result<TradeRecord, StoreError> {
        self.into_stored().map(|stored| stored.record)
    }
}
