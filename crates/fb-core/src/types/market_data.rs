//! Market data structures delivered by the market-data gateways.

use serde::{Deserialize, Serialize};

/// A real-time trade/quote update for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument identifier (e.g. `"0050"`).
    pub instrument: String,
    /// Best bid.
    pub bid: f64,
    /// Best ask.
    pub ask: f64,
    /// Last traded price.
    pub price: f64,
    /// Last traded size.
    pub size: u64,
    /// Gateway timestamp; only compared for ordering.
    pub timestamp: u64,
    /// Set for continuous-session trades (not auction prints).
    #[serde(default)]
    pub is_continuous: bool,
}

impl Quote {
    /// Mid price between bid and ask.
    #[inline]
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}
