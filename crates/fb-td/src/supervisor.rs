//! Connection supervision for the trading session.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//! ├── trade-event pump     (fills → fill channel, lost-connection codes → relogin)
//! ├── relogin task         (logout, login with backoff, restore account, rebuild market data)
//! ├── market-data watcher  (PoolSignal::Disconnected → probe → slot reconnect)
//! └── slot reconnect tasks (one per dropped market-data connection)
//! ```
//!
//! The trading connection state is published on a `watch` channel. Recovery
//! always runs in spawned tasks so the detector (pump or watcher) never
//! blocks on it. At most one relogin runs at a time. Until the new login is
//! live, market-data disconnects are left to it, since it rebuilds every
//! market-data connection anyway. Once the new trade-event pump is installed
//! the relogin no longer counts as running: drops of the rebuilt connections
//! and further trading drops are recovered as usual, and a new relogin
//! supersedes the rebuild still in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use fb_core::backoff::{self, BackoffPolicy};
use fb_core::error::{FbError, Result};
use fb_core::gateway::{BrokerSdk, LoginSession, TradeEvent, TradeEventReceiver};
use fb_core::types::{Account, ConnectionState, Credentials};
use fb_md::{GatewayPool, PoolSignal, PoolSignalReceiver};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::{ConnectionTarget, SessionEvent, SessionEventSender};
use crate::fills::{ActiveAccount, FillSender};

pub struct Supervisor {
    sdk: Arc<dyn BrokerSdk>,
    pool: Arc<GatewayPool>,
    trade_policy: BackoffPolicy,

    credentials: Mutex<Option<Credentials>>,
    accounts: RwLock<Vec<Account>>,
    active: ActiveAccount,

    trade_state: watch::Sender<ConnectionState>,
    md_started: AtomicBool,
    relogin_running: AtomicBool,
    terminated: AtomicBool,

    events: SessionEventSender,
    fill_tx: FillSender,
    shutdown_tx: watch::Sender<bool>,
    pool_signals: Mutex<Option<PoolSignalReceiver>>,

    pump: Mutex<Option<JoinHandle<()>>>,
    relogin_task: Mutex<Option<JoinHandle<()>>>,
    md_reconnects: Mutex<AHashMap<usize, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub(crate) fn new(
        sdk: Arc<dyn BrokerSdk>,
        pool: Arc<GatewayPool>,
        pool_signals: PoolSignalReceiver,
        trade_policy: BackoffPolicy,
        active: ActiveAccount,
        events: SessionEventSender,
        fill_tx: FillSender,
    ) -> Self {
        let (trade_state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            sdk,
            pool,
            trade_policy,
            credentials: Mutex::new(None),
            accounts: RwLock::new(Vec::new()),
            active,
            trade_state,
            md_started: AtomicBool::new(false),
            relogin_running: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            events,
            fill_tx,
            shutdown_tx,
            pool_signals: Mutex::new(Some(pool_signals)),
            pump: Mutex::new(None),
            relogin_task: Mutex::new(None),
            md_reconnects: Mutex::new(AHashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // -- State ---------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.trade_state.borrow()
    }

    /// Watch the trading connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.trade_state.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_login(&self) -> bool {
        self.state().is_live()
    }

    /// False once recovery has given up on the trading connection or the
    /// session was terminated.
    pub fn is_alive(&self) -> bool {
        !self.is_terminated() && self.state() != ConnectionState::Failed
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_relogin_running(&self) -> bool {
        self.relogin_running.load(Ordering::SeqCst)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.read().clone()
    }

    pub fn active_account(&self) -> Option<Account> {
        self.active.read().clone()
    }

    /// Select the account used for orders, fills and reconciliation.
    pub fn set_active_account(&self, account_no: &str) -> Result<Account> {
        let accounts = self.accounts.read();
        if accounts.is_empty() {
            return Err(FbError::NotLoggedIn);
        }
        let account = accounts
            .iter()
            .find(|a| a.account_no == account_no)
            .cloned()
            .ok_or_else(|| FbError::AccountNotFound(account_no.to_string()))?;
        *self.active.write() = Some(account.clone());
        info!("[supervisor] active account set to {account_no}");
        Ok(account)
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.trade_state.send_replace(state);
        if prev != state {
            debug!("[supervisor] trading connection {prev} -> {state}");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Keep a background task so [`terminate`](Self::terminate) can stop it.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // -- Login ---------------------------------------------------------------

    /// Log in, start the trade-event pump and, on the first login, connect
    /// every market-data slot.
    ///
    /// Connectivity failures are retried with backoff; an `Auth` failure is
    /// returned at once.
    pub async fn login(self: &Arc<Self>, credentials: Credentials) -> Result<Vec<Account>> {
        if self.is_terminated() {
            return Err(FbError::Terminated);
        }
        self.set_state(ConnectionState::Connecting);
        info!("[supervisor] logging in as {}", credentials.id);

        let session = backoff::retry("supervisor-login", self.trade_policy, |_| self.sdk.login(&credentials)).await;
        let LoginSession { accounts, events } = match session {
            Ok(s) => s,
            Err(e) => {
                error!("[supervisor] login failed: {e}");
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        info!("[supervisor] logged in, {} account(s)", accounts.len());
        *self.credentials.lock() = Some(credentials);
        *self.accounts.write() = accounts.clone();
        self.set_state(ConnectionState::Live);
        self.install_pump(events);
        self.emit(SessionEvent::Connected { accounts: accounts.len() });

        if !self.md_started.swap(true, Ordering::SeqCst) {
            self.spawn_md_watcher();
            if let Err(e) = self.pool.connect_all().await {
                self.md_started.store(false, Ordering::SeqCst);
                self.rollback_login(&e).await;
                return Err(e);
            }
        }
        Ok(accounts)
    }

    /// Undo a login whose market data could not be brought up, so the
    /// caller's error matches the session state.
    async fn rollback_login(&self, cause: &FbError) {
        error!("[supervisor] market data unavailable, rolling back login: {cause}");
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.credentials.lock().take();
        self.accounts.write().clear();
        self.active.write().take();
        if let Err(e) = self.sdk.logout().await {
            debug!("[supervisor] logout during rollback failed: {e}");
        }
        self.set_state(ConnectionState::Failed);
    }

    fn install_pump(self: &Arc<Self>, events: TradeEventReceiver) {
        let handle = tokio::spawn(run_pump(Arc::clone(self), events, self.shutdown_tx.subscribe()));
        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }
    }

    // -- Trading recovery ----------------------------------------------------

    /// Start a background relogin unless one is already running.
    pub(crate) fn spawn_relogin(self: &Arc<Self>, reason: String) {
        if self.is_terminated() {
            return;
        }
        if self.relogin_running.swap(true, Ordering::SeqCst) {
            debug!("[supervisor] relogin already running, ignoring: {reason}");
            return;
        }
        warn!("[supervisor] trading connection lost: {reason}");
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected { target: ConnectionTarget::Trading, reason });

        // The relogin rebuilds every market-data slot itself.
        for (_, handle) in self.md_reconnects.lock().drain() {
            handle.abort();
        }

        let sup = Arc::clone(self);
        let handle = tokio::spawn(async move { sup.relogin().await });
        // A previous relogin can only still be running its market-data
        // rebuild; this one redoes it on the new login.
        if let Some(previous) = self.relogin_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn finish_relogin(&self) {
        self.relogin_running.store(false, Ordering::SeqCst);
    }

    async fn relogin(self: &Arc<Self>) {
        self.emit(SessionEvent::Reconnecting { target: ConnectionTarget::Trading });
        if let Err(e) = self.sdk.logout().await {
            debug!("[supervisor] logout before relogin failed: {e}");
        }

        let Some(credentials) = self.credentials.lock().clone() else {
            self.finish_relogin();
            self.fail_trading("no stored credentials for relogin".into());
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let session = backoff::retry("supervisor-relogin", self.trade_policy, |_| self.sdk.login(&credentials)).await;
        let LoginSession { accounts, events } = match session {
            Ok(s) => s,
            Err(e) => {
                self.finish_relogin();
                self.fail_trading(format!("relogin failed: {e}"));
                return;
            }
        };

        let previous = self.active.read().as_ref().map(|a| a.account_no.clone());
        *self.accounts.write() = accounts.clone();
        if let Some(account_no) = previous {
            let restored = accounts.iter().find(|a| a.account_no == account_no).cloned();
            match &restored {
                Some(_) => info!("[supervisor] active account {account_no} restored"),
                None => {
                    error!("[supervisor] account {account_no} missing after relogin");
                    self.emit(SessionEvent::Error {
                        message: FbError::AccountNotFound(account_no.clone()).to_string(),
                    });
                }
            }
            *self.active.write() = restored;
        }

        self.set_state(ConnectionState::Live);
        // Cleared before the new pump exists so a drop it reports starts a
        // fresh relogin, and before the rebuild so rebuilt slots that drop
        // are reconnected.
        self.finish_relogin();
        self.install_pump(events);
        info!("[supervisor] relogin complete");
        self.emit(SessionEvent::Reconnected { target: ConnectionTarget::Trading });

        if self.md_started.load(Ordering::SeqCst) {
            if let Err(e) = self.pool.reconnect_all().await {
                error!("[supervisor] market-data rebuild after relogin failed: {e}");
                self.report_failed_slots(&e);
            }
        }
    }

    fn fail_trading(&self, message: String) {
        error!("[supervisor] giving up on trading connection: {message}");
        self.set_state(ConnectionState::Failed);
        self.emit(SessionEvent::Fatal { target: ConnectionTarget::Trading, message });
    }

    fn report_failed_slots(&self, cause: &FbError) {
        for status in self.pool.status() {
            if status.state == ConnectionState::Failed {
                self.emit(SessionEvent::Fatal {
                    target: ConnectionTarget::MarketData { slot: status.slot },
                    message: cause.to_string(),
                });
            }
        }
    }

    // -- Market-data recovery ------------------------------------------------

    fn spawn_md_watcher(self: &Arc<Self>) {
        let Some(mut signals) = self.pool_signals.lock().take() else {
            return;
        };
        let sup = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => sup.on_pool_signal(signal).await,
                        None => break,
                    },
                }
            }
            debug!("[supervisor] market-data watcher exited");
        });
        self.track(handle);
    }

    async fn on_pool_signal(self: &Arc<Self>, signal: PoolSignal) {
        let PoolSignal::Disconnected { slot, generation, reason } = signal;
        if self.is_terminated() {
            return;
        }
        if !self.pool.is_current(slot, generation) {
            debug!("[supervisor] slot {slot} generation {generation} already replaced, ignoring drop");
            return;
        }
        let target = ConnectionTarget::MarketData { slot };
        self.emit(SessionEvent::Disconnected { target, reason });

        if self.is_relogin_running() {
            info!("[supervisor] relogin in progress, leaving slot {slot} to it");
            return;
        }

        // A dead market-data socket often means the whole login is gone.
        let account = self.active_account();
        if let Some(account) = account {
            match self.sdk.probe(&account).await {
                Ok(()) => {}
                Err(e @ FbError::Auth(_)) => {
                    warn!("[supervisor] login lost (found after slot {slot} drop): {e}");
                    self.spawn_relogin(format!("login check failed: {e}"));
                    return;
                }
                Err(e) => {
                    warn!("[supervisor] login check inconclusive after slot {slot} drop: {e}");
                }
            }
        }
        self.spawn_md_reconnect(slot);
    }

    fn spawn_md_reconnect(self: &Arc<Self>, slot: usize) {
        if !self.pool.begin_reconnect(slot) {
            debug!("[supervisor] slot {slot} already recovering");
            return;
        }
        let target = ConnectionTarget::MarketData { slot };
        self.emit(SessionEvent::Reconnecting { target });

        let sup = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match sup.pool.reopen_slot(slot).await {
                Ok(()) => sup.emit(SessionEvent::Reconnected { target }),
                Err(e) => {
                    error!("[supervisor] slot {slot} reconnect gave up: {e}");
                    sup.emit(SessionEvent::Fatal { target, message: e.to_string() });
                }
            }
        });

        let mut running = self.md_reconnects.lock();
        running.retain(|_, h| !h.is_finished());
        running.insert(slot, handle);
    }

    // -- Shutdown ------------------------------------------------------------

    /// Stop every task, disconnect market data and log out. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[supervisor] terminating session");
        let _ = self.shutdown_tx.send(true);

        if let Some(h) = self.pump.lock().take() {
            h.abort();
        }
        if let Some(h) = self.relogin_task.lock().take() {
            h.abort();
        }
        for (_, h) in self.md_reconnects.lock().drain() {
            h.abort();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for h in tasks {
            h.abort();
        }

        self.pool.shutdown().await;

        let logged_in = self.credentials.lock().take().is_some();
        if logged_in {
            if let Err(e) = self.sdk.logout().await {
                warn!("[supervisor] logout failed: {e}");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("[supervisor] session terminated");
    }
}

/// Forward trading events until the connection is lost or shutdown.
async fn run_pump(sup: Arc<Supervisor>, mut events: TradeEventReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            event = events.recv() => match event {
                Some(TradeEvent::Filled(fill)) => {
                    let _ = sup.fill_tx.send(fill);
                }
                Some(event @ TradeEvent::Event { .. }) if event.is_connection_lost() => {
                    if let TradeEvent::Event { code, message } = event {
                        sup.spawn_relogin(format!("gateway event {code}: {message}"));
                    }
                    return;
                }
                Some(TradeEvent::Event { code, message }) => {
                    info!("[supervisor] gateway event {code}: {message}");
                }
                Some(TradeEvent::Disconnected { reason }) => {
                    sup.spawn_relogin(reason);
                    return;
                }
                None => {
                    if !sup.is_terminated() {
                        sup.spawn_relogin("trade event stream closed".into());
                    }
                    return;
                }
            },
        }
    }
}
