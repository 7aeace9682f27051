//! Outstanding-order ledger for one instrument.
//!
//! Each instrument keeps two ordered lists of in-flight orders, one per
//! intent class. An order leaves its list when a terminal status is observed
//! (from a fill or from the reconciler); its number is then remembered in the
//! resolved set so later partial fills can still be classified. Only the most
//! recent [`RESOLVED_RETAIN`] resolved numbers are kept.

use std::collections::VecDeque;

use ahash::AHashMap;
use fb_core::types::Intent;

/// An order that was acknowledged by the gateway and is not yet terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order_no: String,
    pub instrument: String,
    pub intent: Intent,
    /// Placement ack time (ms since epoch).
    pub placed_at: u64,
}

/// Resolved order numbers remembered per instrument for late fills.
pub const RESOLVED_RETAIN: usize = 256;

#[derive(Debug, Default)]
pub struct OrderLedger {
    entries: Vec<OrderRecord>,
    exits: Vec<OrderRecord>,
    resolved: AHashMap<String, Intent>,
    /// Resolution order, oldest first.
    resolved_order: VecDeque<String>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly acknowledged order. A number that is already outstanding
    /// or resolved is ignored, so an order lives in at most one class.
    pub fn record_placed(&mut self, record: OrderRecord) -> bool {
        if self.intent_of(&record.order_no).is_some() {
            return false;
        }
        match record.intent {
            Intent::Entry => self.entries.push(record),
            Intent::Exit => self.exits.push(record),
        }
        true
    }

    /// Remove `order_no` from the outstanding set.
    ///
    /// Returns `true` only for the call that actually removed it; repeated
    /// terminal reports are no-ops.
    pub fn record_terminal(&mut self, order_no: &str) -> bool {
        let removed = take(&mut self.entries, order_no).or_else(|| take(&mut self.exits, order_no));
        match removed {
            Some(record) => {
                self.remember(record.order_no, record.intent);
                true
            }
            None => false,
        }
    }

    fn remember(&mut self, order_no: String, intent: Intent) {
        if self.resolved.insert(order_no.clone(), intent).is_none() {
            self.resolved_order.push_back(order_no);
        }
        while self.resolved_order.len() > RESOLVED_RETAIN {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }

    /// Number of resolved order numbers still remembered.
    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.entries.is_empty() || !self.exits.is_empty()
    }

    /// Intent class of an outstanding or already-resolved order.
    pub fn intent_of(&self, order_no: &str) -> Option<Intent> {
        if self.entries.iter().any(|r| r.order_no == order_no) {
            return Some(Intent::Entry);
        }
        if self.exits.iter().any(|r| r.order_no == order_no) {
            return Some(Intent::Exit);
        }
        self.resolved.get(order_no).copied()
    }

    pub fn is_outstanding(&self, order_no: &str) -> bool {
        self.outstanding().any(|r| r.order_no == order_no)
    }

    /// Outstanding records, entries first, each class in placement order.
    pub fn outstanding(&self) -> impl Iterator<Item = &OrderRecord> {
        self.entries.iter().chain(self.exits.iter())
    }

    pub fn outstanding_entries(&self) -> &[OrderRecord] {
        &self.entries
    }

    pub fn outstanding_exits(&self) -> &[OrderRecord] {
        &self.exits
    }
}

fn take(list: &mut Vec<OrderRecord>, order_no: &str) -> Option<OrderRecord> {
    let idx = list.iter().position(|r| r.order_no == order_no)?;
    Some(list.remove(idx))
}
