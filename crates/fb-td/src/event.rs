//! Session lifecycle events emitted to the strategy layer.
//!
//! The caller receives a [`SessionEventReceiver`] from
//! [`TradingSession::new`](crate::TradingSession::new) and can poll it to
//! react to connection changes, fatal errors and closed positions.

use fb_core::types::ConnectionState;
use fb_md::ConnectionStatus;

/// Which connection a reconnect event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTarget {
    Trading,
    MarketData { slot: usize },
}

impl std::fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trading => write!(f, "trading"),
            Self::MarketData { slot } => write!(f, "marketdata[{slot}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Login succeeded.
    Connected {
        /// Number of accounts returned by the gateway.
        accounts: usize,
    },

    /// A connection dropped.
    Disconnected { target: ConnectionTarget, reason: String },

    /// Recovery of a connection started.
    Reconnecting { target: ConnectionTarget },

    /// Recovery of a connection finished.
    Reconnected { target: ConnectionTarget },

    /// Recovery gave up. The affected connection stays `Failed`.
    Fatal { target: ConnectionTarget, message: String },

    /// A position went flat and its market-data subscription was released.
    PositionClosed { instrument: String },

    /// A non-fatal error worth surfacing.
    Error { message: String },
}

/// Sender half of the session event channel.
pub type SessionEventSender = tokio::sync::mpsc::UnboundedSender<SessionEvent>;

/// Receiver half of the session event channel.
pub type SessionEventReceiver = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

/// Point-in-time view of the session's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub trading: ConnectionState,
    pub alive: bool,
    pub active_account: Option<String>,
    pub marketdata: Vec<ConnectionStatus>,
}
