//! Stale market-data filtering.
//!
//! The quote dispatcher keeps only the newest pending update per instrument,
//! but a gateway can still deliver an older quote after a newer one (two
//! connections racing during a reconnect, or a replayed snapshot after
//! resubscription). [`LatestTimestampFilter`] drops anything that is not
//! strictly newer than what was already delivered for that instrument.

use ahash::AHashMap;

/// Per-instrument monotonic timestamp filter.
///
/// # Thread safety
///
/// Not thread-safe. Each dispatcher lane owns its own instance.
#[derive(Debug, Default)]
pub struct LatestTimestampFilter {
    last: AHashMap<String, u64>,
}

impl LatestTimestampFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `timestamp` if it is strictly newer than the
    /// last accepted timestamp for `instrument`.
    #[inline]
    pub fn check_and_update(&mut self, instrument: &str, timestamp: u64) -> bool {
        match self.last.get_mut(instrument) {
            Some(last) if timestamp <= *last => false,
            Some(last) => {
                *last = timestamp;
                true
            }
            None => {
                self.last.insert(instrument.to_string(), timestamp);
                true
            }
        }
    }

    /// Last accepted timestamp for an instrument, if any.
    pub fn last(&self, instrument: &str) -> Option<u64> {
        self.last.get(instrument).copied()
    }

    /// Forget an instrument (e.g. after unsubscribe).
    pub fn forget(&mut self, instrument: &str) {
        self.last.remove(instrument);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_newer() {
        let mut f = LatestTimestampFilter::new();
        assert!(f.check_and_update("0050", 10));
        assert!(f.check_and_update("0050", 11));
        assert!(!f.check_and_update("0050", 11)); // duplicate
        assert!(!f.check_and_update("0050", 9)); // stale
        assert_eq!(f.last("0050"), Some(11));
    }

    #[test]
    fn instruments_are_independent() {
        let mut f = LatestTimestampFilter::new();
        assert!(f.check_and_update("0050", 5));
        assert!(f.check_and_update("2330", 5));
        f.forget("0050");
        assert!(f.check_and_update("0050", 1));
    }

    #[test]
    fn zero_timestamp_is_accepted_first_time() {
        let mut f = LatestTimestampFilter::new();
        assert!(f.check_and_update("0050", 0));
        assert!(!f.check_and_update("0050", 0));
    }
}
