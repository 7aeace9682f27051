//! Per-instrument trading state.
//!
//! [`InstrumentRegistry`] replaces global order and position maps: every
//! instrument gets its own [`InstrumentState`] behind its own lock, so fills,
//! placements and reconciler updates for different instruments never contend,
//! and every read-modify-write on one instrument is atomic.
//!
//! Locks are plain `parking_lot` mutexes and are never held across `.await`.

use std::sync::Arc;

use ahash::AHashMap;
use fb_core::error::{FbError, Result};
use fb_core::types::{FillEvent, Intent};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::ledger::{OrderLedger, OrderRecord};
use crate::position::{ExitResult, Position};

/// What applying a fill did.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// First entry fill created the position.
    Opened(Position),
    /// Entry fill merged into an existing position.
    Increased(Position),
    /// Exit fill reduced the position.
    Reduced(Position),
    /// Exit fill brought the position to zero; it was removed.
    Closed { instrument: String },
    /// Exit fill arrived while flat. Position unchanged.
    ExitWhileFlat,
    /// Order unknown but a placement is pending; held until the ack.
    Deferred,
    /// Order unknown; ignored.
    Unknown,
}

impl FillOutcome {
    pub fn position(&self) -> Option<&Position> {
        match self {
            Self::Opened(p) | Self::Increased(p) | Self::Reduced(p) => Some(p),
            _ => None,
        }
    }
}

/// Mutable state for one instrument.
#[derive(Debug, Default)]
pub struct InstrumentState {
    ledger: OrderLedger,
    position: Option<Position>,
    /// Set between reservation and the placement ack.
    placement_pending: bool,
    entries_placed: u32,
    exits_placed: u32,
    /// Fills that arrived for unknown orders while a placement was pending.
    deferred: Vec<FillEvent>,
}

impl InstrumentState {
    fn apply_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        let intent = match self.ledger.intent_of(&fill.order_no) {
            Some(intent) => intent,
            None if self.placement_pending => {
                debug!(
                    "[registry] {}: fill for {} before placement ack, deferring",
                    fill.instrument, fill.order_no
                );
                self.deferred.push(fill.clone());
                return FillOutcome::Deferred;
            }
            None => {
                let err = FbError::UnknownOrder {
                    instrument: fill.instrument.clone(),
                    order_no: fill.order_no.clone(),
                };
                warn!("[registry] ignoring fill: {err}");
                return FillOutcome::Unknown;
            }
        };

        self.ledger.record_terminal(&fill.order_no);

        match intent {
            Intent::Entry => match self.position.as_mut() {
                Some(pos) => {
                    pos.apply_entry(fill.filled_price, fill.filled_qty);
                    FillOutcome::Increased(pos.clone())
                }
                None => {
                    let pos = Position::open(&fill.instrument, fill.filled_price, fill.filled_qty);
                    self.position = Some(pos.clone());
                    FillOutcome::Opened(pos)
                }
            },
            Intent::Exit => match self.position.take() {
                Some(pos) => match pos.apply_exit(fill.filled_qty) {
                    ExitResult::Reduced(pos) => {
                        self.position = Some(pos.clone());
                        FillOutcome::Reduced(pos)
                    }
                    ExitResult::Closed => FillOutcome::Closed { instrument: fill.instrument.clone() },
                },
                None => {
                    warn!(
                        "[registry] {}: exit fill {} while flat, position unchanged",
                        fill.instrument, fill.order_no
                    );
                    FillOutcome::ExitWhileFlat
                }
            },
        }
    }
}

/// Read-only view of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSnapshot {
    pub instrument: String,
    pub position: Option<Position>,
    pub outstanding: Vec<OrderRecord>,
    pub placement_pending: bool,
    pub entries_placed: u32,
    pub exits_placed: u32,
}

type Slot = Arc<Mutex<InstrumentState>>;

/// Owner of every instrument's state.
#[derive(Default)]
pub struct InstrumentRegistry {
    instruments: RwLock<AHashMap<String, Slot>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, instrument: &str) -> Option<Slot> {
        self.instruments.read().get(instrument).cloned()
    }

    fn get_or_create(&self, instrument: &str) -> Slot {
        if let Some(slot) = self.get(instrument) {
            return slot;
        }
        Arc::clone(self.instruments.write().entry(instrument.to_string()).or_default())
    }

    // -- Placement -----------------------------------------------------------

    /// Claim the right to place an order for `instrument`.
    ///
    /// Fails with [`FbError::OutstandingOrder`] if an order is still in
    /// flight or another placement holds the reservation.
    pub fn reserve(&self, instrument: &str) -> Result<()> {
        let slot = self.get_or_create(instrument);
        let mut st = slot.lock();
        if st.placement_pending || st.ledger.has_outstanding() {
            return Err(FbError::OutstandingOrder { instrument: instrument.to_string() });
        }
        st.placement_pending = true;
        Ok(())
    }

    /// Drop a reservation after a rejected or failed placement.
    ///
    /// Returns the fills deferred during the reservation; they can no longer
    /// match a pending order and should be reprocessed as unknown.
    pub fn release(&self, instrument: &str) -> Vec<FillEvent> {
        let Some(slot) = self.get(instrument) else {
            return Vec::new();
        };
        let mut st = slot.lock();
        st.placement_pending = false;
        std::mem::take(&mut st.deferred)
    }

    /// Record a successful placement ack and clear the reservation.
    ///
    /// Returns the fills deferred while the placement was pending so the
    /// caller can feed them back through the fill path.
    pub fn record_placed(&self, instrument: &str, order_no: &str, intent: Intent, placed_at: u64) -> Vec<FillEvent> {
        let slot = self.get_or_create(instrument);
        let mut st = slot.lock();
        st.placement_pending = false;
        let record = OrderRecord {
            order_no: order_no.to_string(),
            instrument: instrument.to_string(),
            intent,
            placed_at,
        };
        if st.ledger.record_placed(record) {
            match intent {
                Intent::Entry => st.entries_placed += 1,
                Intent::Exit => st.exits_placed += 1,
            }
        } else {
            warn!("[registry] {instrument}: order {order_no} already recorded");
        }
        std::mem::take(&mut st.deferred)
    }

    // -- Resolution ----------------------------------------------------------

    /// Mark `order_no` terminal. Idempotent; returns `true` only when the
    /// order was outstanding.
    pub fn record_terminal(&self, instrument: &str, order_no: &str) -> bool {
        let Some(slot) = self.get(instrument) else {
            return false;
        };
        let removed = slot.lock().ledger.record_terminal(order_no);
        if removed {
            info!("[registry] {instrument}: order {order_no} resolved");
        }
        removed
    }

    /// Apply one fill atomically under the instrument's lock.
    ///
    /// A fill for an instrument that was never traded cannot match an order
    /// and leaves no state behind.
    pub fn apply_fill(&self, fill: &FillEvent) -> FillOutcome {
        match self.get(&fill.instrument) {
            Some(slot) => slot.lock().apply_fill(fill),
            None => {
                warn!(
                    "[registry] ignoring fill {} for untraded instrument {}",
                    fill.order_no, fill.instrument
                );
                FillOutcome::Unknown
            }
        }
    }

    /// Number of instruments with state.
    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    // -- Queries -------------------------------------------------------------

    pub fn has_outstanding(&self, instrument: &str) -> bool {
        self.get(instrument).is_some_and(|slot| slot.lock().ledger.has_outstanding())
    }

    /// Every outstanding `(instrument, order_no)` pair at this instant.
    pub fn outstanding(&self) -> Vec<(String, String)> {
        let slots: Vec<(String, Slot)> =
            self.instruments.read().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        let mut out = Vec::new();
        for (instrument, slot) in slots {
            let st = slot.lock();
            out.extend(st.ledger.outstanding().map(|r| (instrument.clone(), r.order_no.clone())));
        }
        out
    }

    pub fn position(&self, instrument: &str) -> Option<Position> {
        self.get(instrument).and_then(|slot| slot.lock().position.clone())
    }

    /// All non-flat positions.
    pub fn positions(&self) -> Vec<Position> {
        let slots: Vec<Slot> = self.instruments.read().values().cloned().collect();
        let mut out: Vec<Position> = slots.iter().filter_map(|s| s.lock().position.clone()).collect();
        out.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        out
    }

    pub fn snapshot(&self, instrument: &str) -> Option<InstrumentSnapshot> {
        let slot = self.get(instrument)?;
        let st = slot.lock();
        Some(InstrumentSnapshot {
            instrument: instrument.to_string(),
            position: st.position.clone(),
            outstanding: st.ledger.outstanding().cloned().collect(),
            placement_pending: st.placement_pending,
            entries_placed: st.entries_placed,
            exits_placed: st.exits_placed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fb_core::types::Side;

    fn fill(order_no: &str, qty: u64, price: f64) -> FillEvent {
        FillEvent {
            account_no: "9809789".into(),
            order_no: order_no.into(),
            instrument: "0050".into(),
            side: Side::Buy,
            filled_qty: qty,
            filled_price: price,
            user_def: None,
            filled_at: 0,
        }
    }

    fn place(reg: &InstrumentRegistry, order_no: &str, intent: Intent) {
        reg.reserve("0050").unwrap();
        assert!(reg.record_placed("0050", order_no, intent, 1).is_empty());
    }

    #[test]
    fn vwap_scenario_then_full_exit() {
        let reg = InstrumentRegistry::new();

        place(&reg, "E1", Intent::Entry);
        let out = reg.apply_fill(&fill("E1", 1000, 100.0));
        assert_eq!(out, FillOutcome::Opened(Position::open("0050", 100.0, 1000)));

        place(&reg, "E2", Intent::Entry);
        let out = reg.apply_fill(&fill("E2", 1000, 102.0));
        let pos = out.position().unwrap();
        assert_eq!(pos.size, 2000);
        assert!((pos.avg_price - 101.0).abs() < 1e-9);

        place(&reg, "X1", Intent::Exit);
        let out = reg.apply_fill(&fill("X1", 2000, 105.0));
        assert_eq!(out, FillOutcome::Closed { instrument: "0050".into() });
        assert!(reg.position("0050").is_none());
        assert!(!reg.has_outstanding("0050"));

        let snap = reg.snapshot("0050").unwrap();
        assert_eq!(snap.entries_placed, 2);
        assert_eq!(snap.exits_placed, 1);
    }

    #[test]
    fn outstanding_order_blocks_second_placement() {
        let reg = InstrumentRegistry::new();
        reg.reserve("0050").unwrap();
        // Pending reservation blocks.
        assert!(matches!(reg.reserve("0050"), Err(FbError::OutstandingOrder { .. })));
        reg.record_placed("0050", "E1", Intent::Entry, 1);
        // Outstanding order blocks.
        assert!(matches!(reg.reserve("0050"), Err(FbError::OutstandingOrder { .. })));
        // Other instruments are independent.
        assert!(reg.reserve("2330").is_ok());

        assert!(reg.record_terminal("0050", "E1"));
        assert!(reg.reserve("0050").is_ok());
    }

    #[test]
    fn released_reservation_allows_retry() {
        let reg = InstrumentRegistry::new();
        reg.reserve("0050").unwrap();
        assert!(reg.release("0050").is_empty());
        assert!(reg.reserve("0050").is_ok());
    }

    #[test]
    fn terminal_reports_are_idempotent() {
        let reg = InstrumentRegistry::new();
        place(&reg, "E1", Intent::Entry);
        assert!(reg.record_terminal("0050", "E1"));
        assert!(!reg.record_terminal("0050", "E1"));
        assert!(!reg.record_terminal("9999", "E1"));
        assert!(reg.outstanding().is_empty());
    }

    #[test]
    fn late_partial_fill_of_resolved_order_is_classified() {
        let reg = InstrumentRegistry::new();
        place(&reg, "E1", Intent::Entry);
        reg.apply_fill(&fill("E1", 400, 100.0));
        let out = reg.apply_fill(&fill("E1", 600, 100.0));
        assert_eq!(out.position().unwrap().size, 1000);
    }

    #[test]
    fn unknown_fill_is_ignored() {
        let reg = InstrumentRegistry::new();
        assert_eq!(reg.apply_fill(&fill("ghost", 10, 1.0)), FillOutcome::Unknown);
        assert!(reg.position("0050").is_none());
        // No state is created for an instrument that was never traded.
        assert!(reg.is_empty());
        assert!(reg.snapshot("0050").is_none());
    }

    #[test]
    fn interleaved_entries_and_partial_exits_track_size_and_average() {
        let reg = InstrumentRegistry::new();
        let mut entered = 0u64;
        let mut exited = 0u64;
        let mut step = |order_no: &str, qty: u64, price: f64, intent: Intent| {
            match intent {
                Intent::Entry => entered += qty,
                Intent::Exit => exited += qty,
            }
            let out = reg.apply_fill(&fill(order_no, qty, price));
            (out, entered - exited)
        };

        place(&reg, "E1", Intent::Entry);
        let (out, expected) = step("E1", 1000, 100.0, Intent::Entry);
        assert_eq!(out.position().unwrap().size, expected);

        place(&reg, "E2", Intent::Entry);
        let (out, expected) = step("E2", 500, 106.0, Intent::Entry);
        let pos = out.position().unwrap();
        assert_eq!(pos.size, expected);
        assert!((pos.avg_price - 102.0).abs() < 1e-9);

        // Exit filled in two pieces; the second arrives after the order resolved.
        place(&reg, "X1", Intent::Exit);
        let (out, expected) = step("X1", 200, 120.0, Intent::Exit);
        let FillOutcome::Reduced(pos) = out else {
            panic!("partial exit should reduce, got {out:?}");
        };
        assert_eq!(pos.size, expected);
        assert!((pos.avg_price - 102.0).abs() < 1e-9);
        let (out, expected) = step("X1", 100, 90.0, Intent::Exit);
        assert_eq!(out.position().unwrap().size, expected);
        assert!((out.position().unwrap().avg_price - 102.0).abs() < 1e-9);

        place(&reg, "E3", Intent::Entry);
        let (out, expected) = step("E3", 300, 110.0, Intent::Entry);
        let pos = out.position().unwrap();
        assert_eq!((pos.size, expected), (1500, 1500));
        assert!((pos.avg_price - 103.6).abs() < 1e-9);

        place(&reg, "X2", Intent::Exit);
        let (out, expected) = step("X2", 1000, 101.0, Intent::Exit);
        let pos = out.position().unwrap();
        assert_eq!(pos.size, expected);
        assert!((pos.avg_price - 103.6).abs() < 1e-9);

        place(&reg, "X3", Intent::Exit);
        let (out, expected) = step("X3", 500, 99.0, Intent::Exit);
        assert_eq!(expected, 0);
        assert_eq!(out, FillOutcome::Closed { instrument: "0050".into() });
        assert!(reg.position("0050").is_none());
        assert!(!reg.has_outstanding("0050"));
    }

    #[test]
    fn fill_before_ack_is_deferred_and_returned() {
        let reg = InstrumentRegistry::new();
        reg.reserve("0050").unwrap();
        assert_eq!(reg.apply_fill(&fill("E1", 1000, 100.0)), FillOutcome::Deferred);
        assert!(reg.position("0050").is_none());

        let deferred = reg.record_placed("0050", "E1", Intent::Entry, 1);
        assert_eq!(deferred.len(), 1);
        let out = reg.apply_fill(&deferred[0]);
        assert_eq!(out.position().unwrap().size, 1000);
    }

    #[test]
    fn exit_while_flat_still_resolves_order() {
        let reg = InstrumentRegistry::new();
        place(&reg, "X1", Intent::Exit);
        assert_eq!(reg.apply_fill(&fill("X1", 100, 1.0)), FillOutcome::ExitWhileFlat);
        assert!(!reg.has_outstanding("0050"));
    }

    #[test]
    fn outstanding_snapshot_lists_every_instrument() {
        let reg = InstrumentRegistry::new();
        place(&reg, "E1", Intent::Entry);
        reg.reserve("2330").unwrap();
        reg.record_placed("2330", "E2", Intent::Entry, 1);
        let mut out = reg.outstanding();
        out.sort();
        assert_eq!(out, vec![("0050".into(), "E1".into()), ("2330".into(), "E2".into())]);
    }
}
