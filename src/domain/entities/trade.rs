//! Trade records as kept by the ledger

use crate::domain::entities::order::OrderSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Filled,
    PartiallyClosed,
    Completed,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Filled => "filled",
            TradeStatus::PartiallyClosed => "partially_closed",
            TradeStatus::Completed => "completed",
            TradeStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TradeStatus::Pending),
            "filled" => Some(TradeStatus::Filled),
            "partially_closed" => Some(TradeStatus::PartiallyClosed),
            "completed" => Some(TradeStatus::Completed),
            "failed" => Some(TradeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Failed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSource {
    Real,
    Backtest,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::Real => "real",
            TradeSource::Backtest => "backtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "real" => Some(TradeSource::Real),
            "backtest" => Some(TradeSource::Backtest),
            _ => None,
        }
    }
}

/// Durable ledger entry.
///
/// `signals`, `signal_metrics` and `market_conditions` belong to the caller
/// and are stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub signals: Value,
    pub signal_metrics: Value,
    pub market_conditions: Value,
    pub pnl: f64,
    pub status: TradeStatus,
    pub related_trade_id: Option<String>,
    pub source: TradeSource,
    pub strategy_tag: Option<String>,
}

impl TradeRecord {
    /// Opening trades have no back-reference; close legs point at their opening trade.
    pub fn is_root(&self) -> bool {
        self.related_trade_id.is_none()
    }

    pub fn notional(&self) -> f64 {
        self.amount * self.price
    }

    /// Label used by the per-user signal histogram.
    pub fn signal_label(&self) -> String {
        match &self.signals {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("signal")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            _ => "none".to_string(),
        }
    }
}

/// Input for `TradeLedger::create`; the ledger assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub user_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub signals: Value,
    pub signal_metrics: Value,
    pub market_conditions: Value,
    pub pnl: f64,
    pub status: TradeStatus,
    pub related_trade_id: Option<String>,
    pub source: TradeSource,
    pub strategy_tag: Option<String>,
}

impl NewTrade {
    pub fn new(user_id: &str, symbol: &str, side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            amount,
            price,
            timestamp: Utc::now(),
            signals: Value::Null,
            signal_metrics: Value::Null,
            market_conditions: Value::Null,
            pnl: 0.0,
            status: TradeStatus::Pending,
            related_trade_id: None,
            source: TradeSource::Real,
            strategy_tag: None,
        }
    }

    pub fn with_status(mut self, status: TradeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_signals(mut self, signals: Value, signal_metrics: Value) -> Self {
        self.signals = signals;
        self.signal_metrics = signal_metrics;
        self
    }

    pub fn with_market_conditions(mut self, market_conditions: Value) -> Self {
        self.market_conditions = market_conditions;
        self
    }

    pub fn with_pnl(mut self, pnl: f64) -> Self {
        self.pnl = pnl;
        self
    }

    pub fn related_to(mut self, trade_id: &str) -> Self {
        self.related_trade_id = Some(trade_id.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy_tag: Option<String>) -> Self {
        self.strategy_tag = strategy_tag;
        self
    }

    pub fn with_source(mut self, source: TradeSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn into_record(self, trade_id: String) -> TradeRecord {
        TradeRecord {
            trade_id,
            user_id: self.user_id,
            symbol: self.symbol,
            side: self.side,
            amount: self.amount,
            price: self.price,
            timestamp: self.timestamp,
            signals: self.signals,
            signal_metrics: self.signal_metrics,
            market_conditions: self.market_conditions,
            pnl: self.pnl,
            status: self.status,
            related_trade_id: self.related_trade_id,
            source: self.source,
            strategy_tag: self.strategy_tag,
        }
    }
}
