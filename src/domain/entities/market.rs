//! Market data as consumed from the exchange and the signal source

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// High-low range as a fraction of close
    pub fn range_fraction(&self) -> Option<f64> {
        if self.close > 0.0 {
            Some((self.high - self.low) / self.close)
        } else {
            None
        }
    }
}

/// Snapshot of market state captured at entry.
///
/// `volatility` drives sizing and exit levels; any other field supplied by the
/// caller is stored verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketConditions {
    #[serde(default)]
    pub volatility: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MarketConditions {
    pub fn with_volatility(volatility: f64) -> Self {
        Self {
            volatility,
            extra: Map::new(),
        }
    }

    /// Derive volatility (std-dev of close-to-close returns) and trend from candles.
    ///
    /// Returns `None` when fewer than three candles are available.
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        if candles.len() < 3 {
            return None;
        }

        let returns: Vec<f64> = candles
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| (w[1].close - w[0].close) / w[0].close)
            .collect();
        if returns.is_empty() {
            return None;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

        let first = candles[0].close;
        let last = candles[candles.len() - 1].close;
        let trend = if first > 0.0 { (last - first) / first } else { 0.0 };

        let mut extra = Map::new();
        extra.insert("trend".to_string(), Value::from(trend));
        extra.insert("last_close".to_string(), Value::from(last));
        extra.insert("candles".to_string(), Value::from(candles.len()));

        Some(Self {
            volatility: variance.sqrt(),
            extra,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "buy",
            Signal::Sell => "sell",
            Signal::Hold => "hold",
        }
    }
}

/// Output of a `SignalSource` evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub signal: Signal,
    /// 0.0 to 1.0
    pub confidence: f64,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default)]
    pub market_conditions: MarketConditions,
}

impl TradingSignal {
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "signal": self.signal.as_str(),
            "confidence": self.confidence,
        })
    }
}
