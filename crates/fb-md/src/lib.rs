//! # fb-md
//!
//! Market-data side of the brokerage session.
//!
//! ## Architecture
//!
//! [`pool::GatewayPool`] owns every market-data connection. Instruments are
//! placed on connections by the [`router::SubscriptionRouter`] (first live
//! connection with free capacity wins), and every quote a connection reads is
//! handed to the [`dispatcher::QuoteDispatcher`], which keeps one latest-wins
//! lane per subscribed instrument.
//!
//! - [`pool`]: connection slots, reader tasks, reconnect and replay
//! - [`router`]: instrument → connection assignment
//! - [`dispatcher`]: per-instrument quote lanes and the [`QuoteHandler`] trait

pub mod dispatcher;
pub mod pool;
pub mod router;

pub use dispatcher::{QuoteDispatcher, QuoteHandler};
pub use pool::{ConnectionStatus, GatewayPool, PoolConfig, PoolSignal, PoolSignalReceiver, SubscribeOutcome};
