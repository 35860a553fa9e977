//! Balance entity - per-asset account balances as reported by the exchange

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Balance of a single asset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Available for trading
    pub free: f64,
    /// Locked in open orders
    pub used: f64,
    pub total: f64,
}

impl AssetBalance {
    pub fn new(free: f64, used: f64) -> Self {
        Self {
            free,
            used,
            total: free + used,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total.abs() < f64::EPSILON
    }
}

/// All balances of one account keyed by asset code
pub type Balances = HashMap<String, AssetBalance>;
