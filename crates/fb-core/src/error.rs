//! Typed error definitions for the brokerage session.
//!
//! [`FbError`] is the taxonomy every library crate returns. Connectivity
//! failures are the only retryable class; the supervisor absorbs them and
//! retries with backoff. Everything else is either reported to the caller
//! (auth, capacity, rejection) or logged and ignored by the reconciliation
//! path (unknown orders).

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, FbError>;

/// Domain-specific errors for the brokerage session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FbError {
    /// Transport-level failure (socket closed, timeout, gateway unreachable).
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Login or certificate rejected by the gateway.
    #[error("auth error: {0}")]
    Auth(String),

    /// Every live market-data connection is at its subscription capacity.
    #[error("no subscription capacity left for {instrument}")]
    NoCapacity { instrument: String },

    /// A fill or terminal report references an order the ledger never saw.
    #[error("unknown order {order_no} for {instrument}")]
    UnknownOrder { instrument: String, order_no: String },

    /// The gateway refused an order.
    #[error("placement rejected: {0}")]
    PlacementRejected(String),

    /// A placement was blocked because the instrument still has an order in flight.
    #[error("{instrument} already has an outstanding order")]
    OutstandingOrder { instrument: String },

    /// An operation needs a logged-in trading session.
    #[error("not logged in")]
    NotLoggedIn,

    /// An operation needs an active account.
    #[error("no active account selected")]
    NoActiveAccount,

    /// `set_active_account` named an account the login did not return.
    #[error("account {0} not found")]
    AccountNotFound(String),

    /// The session was terminated and cannot be reused.
    #[error("session terminated")]
    Terminated,

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),
}

impl FbError {
    /// Whether the supervisor should retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_is_retryable() {
        assert!(FbError::Connectivity("reset".into()).is_retryable());
        assert!(!FbError::Auth("bad cert".into()).is_retryable());
        assert!(!FbError::NoCapacity { instrument: "0050".into() }.is_retryable());
        assert!(!FbError::Terminated.is_retryable());
    }

    #[test]
    fn display_names_the_instrument() {
        let err = FbError::OutstandingOrder { instrument: "2330".into() };
        assert_eq!(err.to_string(), "2330 already has an outstanding order");
    }
}
