//! Order requests, placement responses and fills.
//!
//! These types flow between the strategy layer, the trading session, and the
//! broker SDK adapter.

use serde::{Deserialize, Serialize};

use super::enums::{Intent, OrderKind, OrderStatus, PriceType, Side, TimeInForce};

// ---------------------------------------------------------------------------
// Order request (strategy → session → gateway)
// ---------------------------------------------------------------------------

/// An order request submitted by the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Instrument identifier.
    pub instrument: String,
    /// Buy or sell.
    pub side: Side,
    /// Order quantity in shares.
    pub quantity: u64,
    /// Limit price (`None` for market orders).
    pub price: Option<f64>,
    pub price_type: PriceType,
    pub time_in_force: TimeInForce,
    pub kind: OrderKind,
    /// Whether this order opens or closes a position. Used only by the
    /// session's ledger; the gateway never sees it.
    pub intent: Intent,
    /// Free-form tag echoed back on fills.
    #[serde(default)]
    pub user_def: Option<String>,
}

impl OrderSpec {
    /// A market order with rest-of-day time in force.
    pub fn market(instrument: impl Into<String>, side: Side, quantity: u64, intent: Intent) -> Self {
        Self {
            instrument: instrument.into(),
            side,
            quantity,
            price: None,
            price_type: PriceType::Market,
            time_in_force: TimeInForce::Rod,
            kind: OrderKind::Stock,
            intent,
            user_def: None,
        }
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    pub fn with_kind(mut self, kind: OrderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_user_def(mut self, tag: impl Into<String>) -> Self {
        self.user_def = Some(tag.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Placement response (gateway → session)
// ---------------------------------------------------------------------------

/// Immediate response to a placement call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub is_success: bool,
    /// Gateway order number, present on success.
    pub order_no: Option<String>,
    /// Rejection reason, present on failure.
    pub message: Option<String>,
}

impl PlaceOrderResponse {
    pub fn accepted(order_no: impl Into<String>) -> Self {
        Self { is_success: true, order_no: Some(order_no.into()), message: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { is_success: false, order_no: None, message: Some(message.into()) }
    }
}

// ---------------------------------------------------------------------------
// Order result (gateway poll → reconciler)
// ---------------------------------------------------------------------------

/// One row of the gateway's order-result query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_no: String,
    /// Instrument (the gateway calls it `stock_no`).
    pub instrument: String,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Fill (gateway trade-execution push → session)
// ---------------------------------------------------------------------------

/// A confirmed execution of some quantity of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Account the fill belongs to.
    pub account_no: String,
    pub order_no: String,
    pub instrument: String,
    pub side: Side,
    pub filled_qty: u64,
    pub filled_price: f64,
    #[serde(default)]
    pub user_def: Option<String>,
    /// Fill time (ms since epoch).
    pub filled_at: u64,
}
