//! The [`TradingSession`] facade.
//!
//! Wires the gateway pool, instrument registry, fill processor, reconciler
//! and supervisor together and exposes the operations a strategy needs.
//!
//! # Lifecycle
//!
//! 1. Construct via [`TradingSession::new`], keeping the event receiver.
//! 2. [`login`](TradingSession::login), then
//!    [`set_active_account`](TradingSession::set_active_account).
//! 3. Subscribe instruments, register handlers, place orders, and optionally
//!    [`spawn_reconciler`](TradingSession::spawn_reconciler).
//! 4. [`terminate`](TradingSession::terminate). Every later call fails with
//!    [`FbError::Terminated`].

use std::sync::Arc;

use fb_core::config::AppConfig;
use fb_core::error::{FbError, Result};
use fb_core::gateway::{BrokerSdk, MarketDataConnector};
use fb_core::time_util::now_ms;
use fb_core::types::{Account, ConnectionState, Credentials, FillEvent, OrderSpec, PlaceOrderResponse};
use fb_md::{GatewayPool, PoolConfig, QuoteDispatcher, QuoteHandler, SubscribeOutcome};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::event::{SessionEventReceiver, SessionEventSender, SessionStatus};
use crate::fills::{ActiveAccount, FillHandler, FillHandlerSlot, FillProcessor, FillReceiver, FillSender};
use crate::position::Position;
use crate::reconciler::Reconciler;
use crate::registry::{InstrumentRegistry, InstrumentSnapshot};
use crate::supervisor::Supervisor;

/// A logged-in brokerage session: one trading connection, a pool of
/// market-data connections, and the order and position state built on them.
///
/// All methods take `&self` and may be called from multiple tasks.
pub struct TradingSession {
    config: AppConfig,
    sdk: Arc<dyn BrokerSdk>,
    pool: Arc<GatewayPool>,
    registry: Arc<InstrumentRegistry>,
    supervisor: Arc<Supervisor>,
    active: ActiveAccount,
    fill_handler: FillHandlerSlot,
    fill_tx: FillSender,
    fill_rx: Mutex<Option<FillReceiver>>,
    events: SessionEventSender,
}

impl TradingSession {
    /// Create a session over `sdk`.
    ///
    /// Returns the session and a receiver for
    /// [`SessionEvent`](crate::SessionEvent)s. Nothing touches the network
    /// until [`login`](Self::login).
    pub fn new<S: BrokerSdk + 'static>(sdk: Arc<S>, config: AppConfig) -> (Self, SessionEventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (fill_tx, fill_rx) = mpsc::unbounded_channel();

        let connector: Arc<dyn MarketDataConnector> = sdk.clone();
        let sdk: Arc<dyn BrokerSdk> = sdk;

        let dispatcher = Arc::new(QuoteDispatcher::new());
        let (pool, pool_signals) = GatewayPool::new(
            connector,
            PoolConfig::from_config(&config.marketdata, &config.reconnect),
            dispatcher,
        );
        let pool = Arc::new(pool);
        let active: ActiveAccount = Arc::new(RwLock::new(None));

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&sdk),
            Arc::clone(&pool),
            pool_signals,
            config.reconnect.trade_policy(),
            Arc::clone(&active),
            events.clone(),
            fill_tx.clone(),
        ));

        let session = Self {
            config,
            sdk,
            pool,
            registry: Arc::new(InstrumentRegistry::new()),
            supervisor,
            active,
            fill_handler: Arc::new(RwLock::new(None)),
            fill_tx,
            fill_rx: Mutex::new(Some(fill_rx)),
            events,
        };
        (session, events_rx)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.supervisor.is_terminated() {
            return Err(FbError::Terminated);
        }
        Ok(())
    }

    fn ensure_login(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.supervisor.is_login() {
            return Err(FbError::NotLoggedIn);
        }
        Ok(())
    }

    // -- Connection ----------------------------------------------------------

    /// Log in and connect market data. If the config names an account it is
    /// activated right away.
    pub async fn login(&self, credentials: Credentials) -> Result<Vec<Account>> {
        self.ensure_open()?;
        self.start_fill_processor();
        let accounts = self.supervisor.login(credentials).await?;
        if let Some(account_no) = self.config.account.as_deref() {
            self.supervisor.set_active_account(account_no)?;
        }
        Ok(accounts)
    }

    fn start_fill_processor(&self) {
        let Some(fill_rx) = self.fill_rx.lock().take() else {
            return;
        };
        let processor = FillProcessor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.active),
            Arc::clone(&self.fill_handler),
            self.events.clone(),
        );
        self.supervisor.track(processor.spawn(fill_rx, self.supervisor.shutdown_signal()));
    }

    pub fn set_active_account(&self, account_no: &str) -> Result<Account> {
        self.ensure_open()?;
        self.supervisor.set_active_account(account_no)
    }

    pub fn active_account(&self) -> Option<Account> {
        self.supervisor.active_account()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.supervisor.accounts()
    }

    pub fn is_login(&self) -> bool {
        self.supervisor.is_login()
    }

    pub fn is_alive(&self) -> bool {
        self.supervisor.is_alive()
    }

    /// Trading connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.watch_state()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            trading: self.supervisor.state(),
            alive: self.supervisor.is_alive(),
            active_account: self.active_account().map(|a| a.account_no),
            marketdata: self.pool.status(),
        }
    }

    // -- Market data ---------------------------------------------------------

    pub async fn subscribe_realtime_trades(&self, instrument: &str) -> Result<SubscribeOutcome> {
        self.ensure_login()?;
        self.pool.subscribe(instrument).await
    }

    /// Returns `false` if `instrument` was not subscribed.
    pub async fn unsubscribe_realtime_trades(&self, instrument: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.pool.unsubscribe(instrument).await)
    }

    pub fn set_quote_handler(&self, handler: Arc<dyn QuoteHandler>) {
        self.pool.dispatcher().set_handler(handler);
    }

    pub fn set_fill_handler(&self, handler: Arc<dyn FillHandler>) {
        *self.fill_handler.write() = Some(handler);
    }

    // -- Orders --------------------------------------------------------------

    /// Place an order for the active account.
    ///
    /// The instrument is reserved before the gateway call, so a second
    /// placement for it fails with [`FbError::OutstandingOrder`] until this
    /// order reaches a terminal status.
    ///
    /// # Errors
    ///
    /// - [`FbError::OutstandingOrder`] if an order for the instrument is in flight.
    /// - [`FbError::PlacementRejected`] if the gateway refuses the order.
    /// - Any transport error from the gateway call.
    pub async fn place_order(&self, order: OrderSpec) -> Result<PlaceOrderResponse> {
        self.ensure_login()?;
        let account = self.active_account().ok_or(FbError::NoActiveAccount)?;
        let instrument = order.instrument.clone();

        self.registry.reserve(&instrument)?;

        let response = match self.sdk.place_order(&account, &order).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[session] {instrument} placement failed: {e}");
                self.requeue(self.registry.release(&instrument));
                return Err(e);
            }
        };

        let order_no = match response.order_no.clone() {
            Some(no) if response.is_success => no,
            _ => {
                self.requeue(self.registry.release(&instrument));
                let reason = response.message.unwrap_or_else(|| "no order number returned".into());
                warn!("[session] {instrument} placement rejected: {reason}");
                return Err(FbError::PlacementRejected(reason));
            }
        };

        let deferred = self.registry.record_placed(&instrument, &order_no, order.intent, now_ms());
        info!(
            "[session] {instrument} {} order {order_no} placed ({:?} {})",
            order.intent, order.side, order.quantity
        );
        self.requeue(deferred);
        Ok(response)
    }

    /// Feed fills that were held back during a placement into the fill queue.
    fn requeue(&self, fills: Vec<FillEvent>) {
        for fill in fills {
            let _ = self.fill_tx.send(fill);
        }
    }

    pub fn has_outstanding(&self, instrument: &str) -> bool {
        self.registry.has_outstanding(instrument)
    }

    pub fn position(&self, instrument: &str) -> Option<Position> {
        self.registry.position(instrument)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.registry.positions()
    }

    pub fn instrument(&self, instrument: &str) -> Option<InstrumentSnapshot> {
        self.registry.snapshot(instrument)
    }

    // -- Background work -----------------------------------------------------

    /// Start the order-status reconciler. It runs until `end_of_session`
    /// turns `true` or the session terminates.
    pub fn spawn_reconciler(&self, end_of_session: watch::Receiver<bool>) -> Result<()> {
        self.ensure_open()?;
        let reconciler = Reconciler::new(
            Arc::clone(&self.sdk),
            Arc::clone(&self.registry),
            Arc::clone(&self.active),
            self.config.reconciler.interval(),
        );
        self.supervisor.track(reconciler.spawn(self.supervisor.shutdown_signal(), end_of_session));
        Ok(())
    }

    /// Stop all background work, disconnect market data and log out.
    pub async fn terminate(&self) {
        self.supervisor.terminate().await;
    }
}
