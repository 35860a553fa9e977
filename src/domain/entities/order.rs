use crate::domain::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order as submitted to the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, amount: f64) -> Result<Self, ValidationError> {
        Self::new(symbol, side, OrderType::Market, amount, None)
    }

    pub fn new(
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        amount: f64,
        price: Option<f64>,
    ) -> Result<Self, ValidationError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(format!(
                "order amount must be positive, got {}",
                amount
            )));
        }
        if let Some(p) = price {
            if !p.is_finite() || p <= 0.0 {
                return Err(ValidationError::InvalidPrice(format!(
                    "order price must be positive, got {}",
                    p
                )));
            }
        }
        // Limit orders must have price
        if order_type == OrderType::Limit && price.is_none() {
            return Err(ValidationError::InvalidPrice(
                "limit orders must have a price".to_string(),
            ));
        }

        Ok(Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            amount,
            price,
        })
    }
}

/// Exchange acknowledgement of an executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl OrderReceipt {
    pub fn notional(&self) -> f64 {
        self.amount * self.price
    }
}
