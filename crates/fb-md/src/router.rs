//! Instrument → connection assignment.
//!
//! [`SubscriptionRouter`] is plain bookkeeping with no I/O: the gateway pool
//! consults it to decide which connection a new subscription goes to, and to
//! find the instruments that must be replayed after a connection recovers.
//!
//! Placement is first-fit: the lowest-indexed live connection with a free slot
//! wins, so connections fill one after another rather than round-robin.

use ahash::AHashMap;
use fb_core::error::{FbError, Result};

/// Tracks which connection slot each subscribed instrument lives on.
#[derive(Debug, Clone)]
pub struct SubscriptionRouter {
    capacity: usize,
    /// Per slot, instruments in subscription order.
    slots: Vec<Vec<String>>,
    assignments: AHashMap<String, usize>,
}

impl SubscriptionRouter {
    pub fn new(slot_count: usize, capacity: usize) -> Self {
        Self {
            capacity,
            slots: vec![Vec::new(); slot_count],
            assignments: AHashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot holding `instrument`, if subscribed.
    pub fn slot_of(&self, instrument: &str) -> Option<usize> {
        self.assignments.get(instrument).copied()
    }

    /// Number of instruments assigned to `slot`.
    pub fn count(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, Vec::len)
    }

    /// Instruments assigned to `slot`, in subscription order.
    pub fn instruments_of(&self, slot: usize) -> &[String] {
        self.slots.get(slot).map_or(&[], Vec::as_slice)
    }

    /// Every subscribed instrument across all slots.
    pub fn all_instruments(&self) -> Vec<String> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Assign `instrument` to the first live slot below capacity.
    ///
    /// Returns the existing slot if the instrument is already assigned.
    /// Fails with [`FbError::NoCapacity`] if every live slot is full.
    pub fn assign(&mut self, instrument: &str, is_live: impl Fn(usize) -> bool) -> Result<usize> {
        if let Some(slot) = self.slot_of(instrument) {
            return Ok(slot);
        }
        let slot = (0..self.slots.len())
            .find(|&i| is_live(i) && self.slots[i].len() < self.capacity)
            .ok_or_else(|| FbError::NoCapacity { instrument: instrument.to_string() })?;
        self.slots[slot].push(instrument.to_string());
        self.assignments.insert(instrument.to_string(), slot);
        Ok(slot)
    }

    /// Remove `instrument`'s assignment. No-op (returns `None`) if absent.
    pub fn release(&mut self, instrument: &str) -> Option<usize> {
        let slot = self.assignments.remove(instrument)?;
        self.slots[slot].retain(|s| s != instrument);
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_live(_: usize) -> bool {
        true
    }

    #[test]
    fn fills_first_connection_before_second() {
        let mut r = SubscriptionRouter::new(2, 5);
        for s in ["A1", "A2", "A3", "A4"] {
            assert_eq!(r.assign(s, all_live).unwrap(), 0);
        }
        // Fifth goes to the first connection, filling it.
        assert_eq!(r.assign("A5", all_live).unwrap(), 0);
        assert_eq!(r.count(0), 5);
        // Sixth must go to the second connection.
        assert_eq!(r.assign("B1", all_live).unwrap(), 1);
    }

    #[test]
    fn never_exceeds_capacity_and_fails_when_full() {
        let mut r = SubscriptionRouter::new(2, 2);
        for s in ["a", "b", "c", "d"] {
            r.assign(s, all_live).unwrap();
        }
        assert_eq!(r.count(0), 2);
        assert_eq!(r.count(1), 2);
        let err = r.assign("e", all_live).unwrap_err();
        assert_eq!(err, FbError::NoCapacity { instrument: "e".into() });
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn skips_dead_connections() {
        let mut r = SubscriptionRouter::new(2, 5);
        assert_eq!(r.assign("x", |i| i != 0).unwrap(), 1);
        assert!(r.assign("y", |_| false).is_err());
    }

    #[test]
    fn duplicate_assign_returns_existing_slot() {
        let mut r = SubscriptionRouter::new(2, 1);
        assert_eq!(r.assign("x", all_live).unwrap(), 0);
        assert_eq!(r.assign("x", all_live).unwrap(), 0);
        assert_eq!(r.count(0), 1);
    }

    #[test]
    fn release_frees_a_slot_and_is_idempotent() {
        let mut r = SubscriptionRouter::new(1, 1);
        r.assign("x", all_live).unwrap();
        assert!(r.assign("y", all_live).is_err());
        assert_eq!(r.release("x"), Some(0));
        assert_eq!(r.release("x"), None);
        assert_eq!(r.assign("y", all_live).unwrap(), 0);
        assert_eq!(r.instruments_of(0), ["y".to_string()]);
    }

    #[test]
    fn preserves_subscription_order_per_slot() {
        let mut r = SubscriptionRouter::new(1, 10);
        for s in ["c", "a", "b"] {
            r.assign(s, all_live).unwrap();
        }
        r.release("a");
        assert_eq!(r.instruments_of(0), ["c".to_string(), "b".to_string()]);
        assert_eq!(r.all_instruments(), vec!["c".to_string(), "b".to_string()]);
    }
}
