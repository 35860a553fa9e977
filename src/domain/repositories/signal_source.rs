use crate::domain::entities::market::{Candle, TradingSignal};
use async_trait::async_trait;

/// Strategy / model inference seen from the engine.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Tag stored with every trade opened from this source's signals
    fn name(&self) -> &str {
        "default"
    }

    /// Returns `None` when the source has nothing to say for this window
    /// (warming up, not enough history).
    async fn evaluate(&self, symbol: &str, candles: &[Candle]) -> Option<TradingSignal>;
}
