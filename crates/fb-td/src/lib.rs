//! # fb-td
//!
//! Trading side of the brokerage session: order and position state, fill
//! reconciliation, connection supervision, and the [`TradingSession`] facade
//! strategies program against.
//!
//! ## Architecture
//!
//! ```text
//! TradingSession
//! ├── Supervisor          (login, relogin, market-data recovery)
//! ├── GatewayPool         (fb-md: market-data connections + quote lanes)
//! ├── InstrumentRegistry  (per-instrument ledger + position, one lock each)
//! ├── FillProcessor       (single FIFO task applying fills)
//! └── Reconciler          (periodic order-status poll)
//! ```
//!
//! - [`ledger`]: outstanding orders per intent class
//! - [`position`]: volume-weighted position arithmetic
//! - [`registry`]: per-instrument state and atomic fill application
//! - [`fills`]: fill processor and the [`FillHandler`] trait
//! - [`reconciler`]: order-status reconciler
//! - [`supervisor`]: connection state machine and recovery
//! - [`session`]: the facade
//! - [`event`]: session events

pub mod event;
pub mod fills;
pub mod ledger;
pub mod position;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use event::{ConnectionTarget, SessionEvent, SessionEventReceiver, SessionStatus};
pub use fills::FillHandler;
pub use position::Position;
pub use registry::{FillOutcome, InstrumentSnapshot};
pub use session::TradingSession;
