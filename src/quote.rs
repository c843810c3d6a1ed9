use crate::defs::MIN_PRICE;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current milliseconds since the UNIX epoch, `0` if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Represents the current simulated price of one instrument.
///
/// Quotes are owned by the [`SimulatedOracle`](crate::oracle::SimulatedOracle)
/// and are only ever updated in place; an instrument's quote lives as long as
/// the oracle does.
#[derive(Clone, Debug, PartialEq)]
pub struct Quote {
    /// Instrument symbol (e.g., `"SOL"`, `"ETH"`).
    pub instrument: String,

    /// Current price.
    pub price: f64,

    /// Price at the time the last price-move alert was reported.
    ///
    /// The market ticker compares `price` against this value to decide
    /// whether a move is large enough to broadcast.
    pub reference_price: f64,

    /// Timestamp of the last update, measured in **milliseconds** since the UNIX epoch.
    pub timestamp: u64,
}

impl Quote {
    /// Creates a new quote with a random price within `[1, 1000)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use trade_terminal::quote::Quote;
    /// let quote = Quote::new("SOL");
    /// assert_eq!(quote.instrument, "SOL");
    /// assert!(quote.price >= 1.0);
    /// ```
    pub fn new(instrument: &str) -> Self {
        Self::with_price(instrument, 1.0 + rand::random::<f64>() * 999.0)
    }

    /// Creates a new quote with a known starting price.
    ///
    /// Prices below the oracle floor are raised to it.
    pub fn with_price(instrument: &str, price: f64) -> Self {
        let price = price.max(MIN_PRICE);
        Quote {
            instrument: instrument.to_string(),
            price,
            reference_price: price,
            timestamp: now_millis(),
        }
    }

    /// Multiplies the price by `factor`, keeping it above the floor, and
    /// refreshes the timestamp.
    pub fn apply_factor(&mut self, factor: f64) -> f64 {
        self.price = (self.price * factor).max(MIN_PRICE);
        self.timestamp = now_millis();
        self.price
    }

    /// Relative change between the current price and the reference price.
    pub fn drift(&self) -> f64 {
        self.price / self.reference_price - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_price_clamps_to_floor() {
        let q = Quote::with_price("SOL", -5.0);
        assert_eq!(q.price, MIN_PRICE);
        assert_eq!(q.reference_price, MIN_PRICE);
    }

    #[test]
    fn test_apply_factor_and_drift() {
        let mut q = Quote::with_price("ETH", 100.0);
        q.apply_factor(1.1);
        assert!((q.price - 110.0).abs() < 1e-9);
        assert!((q.drift() - 0.1).abs() < 1e-9);
        assert!(q.timestamp > 0);
    }
}
