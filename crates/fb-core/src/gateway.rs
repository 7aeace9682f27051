//! Broker capability traits.
//!
//! The brokerage SDK itself (network protocol, certificates, order routing)
//! lives outside this workspace. An adapter implements [`BrokerSdk`] and
//! [`QuoteFeed`]; everything in `fb-md` and `fb-td` talks to the venue only
//! through these traits.
//!
//! The SDK's push callbacks are modelled as channels: a successful login
//! hands back a [`TradeEventReceiver`], and every market-data connection
//! hands back an [`MdEventReceiver`]. The adapter owns the sending halves and
//! drops them when the underlying connection goes away.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{
    Account, Credentials, FillEvent, OrderResult, OrderSpec, PlaceOrderResponse, Quote,
};

/// Gateway event codes that mean the trading connection was lost.
pub const TRADE_CONNECTION_LOST_CODES: &[&str] = &["300", "301"];

// ---------------------------------------------------------------------------
// Trading connection events
// ---------------------------------------------------------------------------

/// Events pushed by the trading connection.
#[derive(Debug, Clone)]
pub enum TradeEvent {
    /// A confirmed fill.
    Filled(FillEvent),
    /// A gateway status event (`code`, `message`).
    Event { code: String, message: String },
    /// The trading connection dropped.
    Disconnected { reason: String },
}

impl TradeEvent {
    /// Whether this event means the trading connection must be re-established.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Disconnected { .. } => true,
            Self::Event { code, .. } => TRADE_CONNECTION_LOST_CODES.contains(&code.as_str()),
            Self::Filled(_) => false,
        }
    }
}

/// Sender half of a trading event channel (held by the SDK adapter).
pub type TradeEventSender = mpsc::UnboundedSender<TradeEvent>;

/// Receiver half of a trading event channel.
pub type TradeEventReceiver = mpsc::UnboundedReceiver<TradeEvent>;

/// Result of a successful login.
#[derive(Debug)]
pub struct LoginSession {
    /// Accounts available to the logged-in user.
    pub accounts: Vec<Account>,
    /// Push events for this trading connection.
    pub events: TradeEventReceiver,
}

// ---------------------------------------------------------------------------
// Market-data connection events
// ---------------------------------------------------------------------------

/// Events pushed by one market-data connection.
#[derive(Debug, Clone)]
pub enum MdEvent {
    Quote(Quote),
    Subscribed { instrument: String },
    Unsubscribed { instrument: String },
    Error(String),
    Disconnected { code: i32, reason: String },
}

/// Sender half of a market-data event channel (held by the SDK adapter).
pub type MdEventSender = mpsc::UnboundedSender<MdEvent>;

/// Receiver half of a market-data event channel.
pub type MdEventReceiver = mpsc::UnboundedReceiver<MdEvent>;

/// One live market-data connection.
pub struct MdConnection {
    pub feed: Arc<dyn QuoteFeed>,
    pub events: MdEventReceiver,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Subscription control for one market-data connection.
#[async_trait]
pub trait QuoteFeed: Send + Sync {
    async fn subscribe(&self, instrument: &str) -> Result<()>;
    async fn unsubscribe(&self, instrument: &str) -> Result<()>;
    /// Close the connection. Idempotent.
    async fn disconnect(&self);
}

/// Opens market-data connections. Split from [`BrokerSdk`] so the gateway
/// pool depends on nothing but this.
#[async_trait]
pub trait MarketDataConnector: Send + Sync {
    async fn connect_marketdata(&self) -> Result<MdConnection>;
}

/// The trading side of the broker SDK.
///
/// # Errors
///
/// Adapters map transport failures to [`FbError::Connectivity`] and refused
/// logins to [`FbError::Auth`]; the supervisor's retry policy depends on that
/// distinction.
///
/// [`FbError::Connectivity`]: crate::FbError::Connectivity
/// [`FbError::Auth`]: crate::FbError::Auth
#[async_trait]
pub trait BrokerSdk: MarketDataConnector {
    async fn login(&self, credentials: &Credentials) -> Result<LoginSession>;
    async fn logout(&self) -> Result<()>;
    /// Cheap authenticated request used to test whether the trading
    /// connection is still logged in.
    async fn probe(&self, account: &Account) -> Result<()>;
    async fn place_order(&self, account: &Account, order: &OrderSpec) -> Result<PlaceOrderResponse>;
    async fn get_order_results(&self, account: &Account) -> Result<Vec<OrderResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_codes() {
        let lost = TradeEvent::Event { code: "300".into(), message: "lost".into() };
        let other = TradeEvent::Event { code: "100".into(), message: "info".into() };
        assert!(lost.is_connection_lost());
        assert!(!other.is_connection_lost());
        assert!(TradeEvent::Disconnected { reason: "eof".into() }.is_connection_lost());
    }
}
