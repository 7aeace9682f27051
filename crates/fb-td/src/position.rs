//! Net long position per instrument.

/// A non-flat position. Flat instruments have no `Position` at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub instrument: String,
    /// Volume-weighted average entry price.
    pub avg_price: f64,
    /// Shares held. Never zero for a stored position.
    pub size: u64,
}

/// What an exit fill did to a position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitResult {
    Reduced(Position),
    Closed,
}

impl Position {
    pub fn open(instrument: impl Into<String>, price: f64, qty: u64) -> Self {
        Self { instrument: instrument.into(), avg_price: price, size: qty }
    }

    /// Merge an entry fill into the average price.
    pub fn apply_entry(&mut self, price: f64, qty: u64) {
        let total = self.size + qty;
        if total == 0 {
            return;
        }
        self.avg_price = (self.avg_price * self.size as f64 + price * qty as f64) / total as f64;
        self.size = total;
    }

    /// Reduce by an exit fill. Exits at or beyond the held size close the
    /// position; the average price is unchanged otherwise.
    pub fn apply_exit(mut self, qty: u64) -> ExitResult {
        if qty >= self.size {
            return ExitResult::Closed;
        }
        self.size -= qty;
        ExitResult::Reduced(self)
    }
}
