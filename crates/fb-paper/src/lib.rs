//! # fb-paper
//!
//! In-memory broker implementing [`BrokerSdk`] and [`QuoteFeed`].
//!
//! Used by the runner for dry runs and by integration tests, which drive it
//! through hooks that stand in for the venue: pushing quotes, filling orders,
//! dropping connections and failing logins.
//!
//! ```text
//! PaperBroker (shared state)
//! ├── trading channel      → TradeEvent (fills, status events, disconnects)
//! ├── md connection 0      → MdEvent (quotes for its subscriptions)
//! └── md connection 1 ...
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use fb_core::error::{FbError, Result};
use fb_core::gateway::{
    BrokerSdk, LoginSession, MarketDataConnector, MdConnection, MdEvent, MdEventSender, QuoteFeed,
    TradeEvent, TradeEventSender,
};
use fb_core::time_util::{now_ms, now_us};
use fb_core::types::{
    Account, Credentials, FillEvent, OrderResult, OrderSpec, OrderStatus, PlaceOrderResponse, Quote, Side,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Account number of the default paper account.
pub const PAPER_ACCOUNT: &str = "9809789";

const PAPER_PASSWORD: &str = "paper";

/// When placed orders fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Only through [`PaperBroker::fill`].
    #[default]
    Manual,
    /// In full at placement, pushed before the placement call returns.
    Immediate,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    account_no: String,
    instrument: String,
    side: Side,
    quantity: u64,
    filled: u64,
    status: OrderStatus,
    user_def: Option<String>,
}

struct PaperConnection {
    id: u64,
    tx: MdEventSender,
    subscriptions: Vec<String>,
}

struct PaperState {
    accounts: Vec<Account>,
    logged_in: bool,
    trade_tx: Option<TradeEventSender>,
    connections: Vec<PaperConnection>,
    next_conn_id: u64,
    next_order: u64,
    orders: AHashMap<String, PaperOrder>,
    fill_mode: FillMode,
    login_failures: VecDeque<FbError>,
    check_failures: VecDeque<FbError>,
    connect_failures: u32,
    reject_next: Option<String>,
    last_prices: AHashMap<String, f64>,
    logins: u32,
}

impl PaperState {
    fn connection(&mut self, id: u64) -> Option<&mut PaperConnection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    fn send_trade(&self, event: TradeEvent) -> bool {
        match &self.trade_tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Fill `qty` of `order_no` at `price` and push the execution.
    fn execute(&mut self, order_no: &str, qty: u64, price: f64) -> Result<FillEvent> {
        let order = self.orders.get_mut(order_no).ok_or_else(|| FbError::UnknownOrder {
            instrument: String::new(),
            order_no: order_no.to_string(),
        })?;
        order.filled = (order.filled + qty).min(order.quantity);
        order.status = if order.filled >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let fill = FillEvent {
            account_no: order.account_no.clone(),
            order_no: order_no.to_string(),
            instrument: order.instrument.clone(),
            side: order.side,
            filled_qty: qty,
            filled_price: price,
            user_def: order.user_def.clone(),
            filled_at: now_ms(),
        };
        self.send_trade(TradeEvent::Filled(fill.clone()));
        Ok(fill)
    }
}

/// Simulated broker. Cloning shares the same venue state.
#[derive(Clone)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
}

impl PaperBroker {
    /// A broker with one account, [`PAPER_ACCOUNT`].
    pub fn new() -> Self {
        Self::with_accounts(vec![Account {
            account_no: PAPER_ACCOUNT.to_string(),
            name: "paper".to_string(),
            branch: "0000".to_string(),
        }])
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        let state = PaperState {
            accounts,
            logged_in: false,
            trade_tx: None,
            connections: Vec::new(),
            next_conn_id: 0,
            next_order: 1,
            orders: AHashMap::new(),
            fill_mode: FillMode::default(),
            login_failures: VecDeque::new(),
            check_failures: VecDeque::new(),
            connect_failures: 0,
            reject_next: None,
            last_prices: AHashMap::new(),
            logins: 0,
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Credentials the paper broker accepts.
    pub fn credentials() -> Credentials {
        Credentials {
            id: "PAPER".to_string(),
            password: PAPER_PASSWORD.to_string(),
            cert_path: String::new(),
            cert_password: String::new(),
            connection_addr: None,
        }
    }

    // -- Behaviour switches --------------------------------------------------

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().fill_mode = mode;
    }

    /// Fail the next logins with these errors, in order.
    pub fn fail_next_logins(&self, errors: impl IntoIterator<Item = FbError>) {
        self.state.lock().login_failures.extend(errors);
    }

    /// Fail the next login checks with these errors, in order.
    pub fn fail_next_login_checks(&self, errors: impl IntoIterator<Item = FbError>) {
        self.state.lock().check_failures.extend(errors);
    }

    /// Refuse the next `n` market-data connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    /// Reject the next placement with `message`.
    pub fn reject_next_order(&self, message: impl Into<String>) {
        self.state.lock().reject_next = Some(message.into());
    }

    // -- Venue events --------------------------------------------------------

    /// Deliver a quote on every connection subscribed to its instrument.
    /// Returns the number of connections it was sent on.
    pub fn push_quote(&self, quote: Quote) -> usize {
        let mut st = self.state.lock();
        st.last_prices.insert(quote.instrument.clone(), quote.price);
        let mut sent = 0;
        for conn in &st.connections {
            if conn.subscriptions.iter().any(|s| *s == quote.instrument)
                && conn.tx.send(MdEvent::Quote(quote.clone())).is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// Fill `qty` of an open order at `price`.
    pub fn fill(&self, order_no: &str, qty: u64, price: f64) -> Result<FillEvent> {
        self.state.lock().execute(order_no, qty, price)
    }

    /// Push an arbitrary fill, bypassing the order book.
    pub fn push_fill(&self, fill: FillEvent) -> bool {
        self.state.lock().send_trade(TradeEvent::Filled(fill))
    }

    /// Change an order's status without a fill (e.g. a cancel).
    pub fn set_order_status(&self, order_no: &str, status: OrderStatus) -> bool {
        match self.state.lock().orders.get_mut(order_no) {
            Some(order) => {
                order.status = status;
                true
            }
            None => false,
        }
    }

    /// Kill the `index`-th live market-data connection (creation order).
    pub fn drop_marketdata(&self, index: usize) -> bool {
        let mut st = self.state.lock();
        if index >= st.connections.len() {
            return false;
        }
        let conn = st.connections.remove(index);
        let _ = conn.tx.send(MdEvent::Disconnected { code: 1006, reason: "paper drop".into() });
        info!("[paper] dropped market-data connection {}", conn.id);
        true
    }

    /// Push a trading status event with `code` and end the login.
    pub fn drop_trading(&self, code: &str) {
        let mut st = self.state.lock();
        st.send_trade(TradeEvent::Event { code: code.to_string(), message: "connection lost".into() });
        st.logged_in = false;
        st.trade_tx = None;
        info!("[paper] dropped trading connection ({code})");
    }

    /// Expire the login without telling the client.
    pub fn expire_login(&self) {
        self.state.lock().logged_in = false;
    }

    // -- Inspection ----------------------------------------------------------

    pub fn login_count(&self) -> u32 {
        self.state.lock().logins
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Subscriptions of every live connection, in creation order.
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.state.lock().connections.iter().map(|c| c.subscriptions.clone()).collect()
    }

    pub fn order_status(&self, order_no: &str) -> Option<OrderStatus> {
        self.state.lock().orders.get(order_no).map(|o| o.status)
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a quote with a one-tick spread around `price`.
pub fn paper_quote(instrument: &str, price: f64, timestamp: u64) -> Quote {
    Quote {
        instrument: instrument.to_string(),
        bid: price - 0.05,
        ask: price + 0.05,
        price,
        size: 1,
        timestamp,
        is_continuous: true,
    }
}

/// Current wall-clock time in the unit paper quotes use.
pub fn paper_timestamp() -> u64 {
    now_us()
}

// ---------------------------------------------------------------------------
// Capability impls
// ---------------------------------------------------------------------------

/// Subscription handle for one paper connection.
struct PaperFeed {
    conn_id: u64,
    state: Arc<Mutex<PaperState>>,
}

#[async_trait]
impl QuoteFeed for PaperFeed {
    async fn subscribe(&self, instrument: &str) -> Result<()> {
        let mut st = self.state.lock();
        let conn = st
            .connection(self.conn_id)
            .ok_or_else(|| FbError::Connectivity(format!("paper connection {} closed", self.conn_id)))?;
        if !conn.subscriptions.iter().any(|s| s == instrument) {
            conn.subscriptions.push(instrument.to_string());
        }
        let _ = conn.tx.send(MdEvent::Subscribed { instrument: instrument.to_string() });
        Ok(())
    }

    async fn unsubscribe(&self, instrument: &str) -> Result<()> {
        let mut st = self.state.lock();
        let conn = st
            .connection(self.conn_id)
            .ok_or_else(|| FbError::Connectivity(format!("paper connection {} closed", self.conn_id)))?;
        conn.subscriptions.retain(|s| s != instrument);
        let _ = conn.tx.send(MdEvent::Unsubscribed { instrument: instrument.to_string() });
        Ok(())
    }

    async fn disconnect(&self) {
        let mut st = self.state.lock();
        st.connections.retain(|c| c.id != self.conn_id);
        debug!("[paper] connection {} closed by client", self.conn_id);
    }
}

#[async_trait]
impl MarketDataConnector for PaperBroker {
    async fn connect_marketdata(&self) -> Result<MdConnection> {
        let mut st = self.state.lock();
        if st.connect_failures > 0 {
            st.connect_failures -= 1;
            return Err(FbError::Connectivity("paper market-data connect refused".into()));
        }
        if !st.logged_in {
            return Err(FbError::Connectivity("market data requires a login".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = st.next_conn_id;
        st.next_conn_id += 1;
        st.connections.push(PaperConnection { id, tx, subscriptions: Vec::new() });
        debug!("[paper] market-data connection {id} opened");
        let feed = Arc::new(PaperFeed { conn_id: id, state: Arc::clone(&self.state) });
        Ok(MdConnection { feed, events: rx })
    }
}

#[async_trait]
impl BrokerSdk for PaperBroker {
    async fn login(&self, credentials: &Credentials) -> Result<LoginSession> {
        let mut st = self.state.lock();
        if let Some(err) = st.login_failures.pop_front() {
            return Err(err);
        }
        if credentials.password != PAPER_PASSWORD {
            return Err(FbError::Auth("invalid password".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        st.trade_tx = Some(tx);
        st.logged_in = true;
        st.logins += 1;
        info!("[paper] login #{} for {}", st.logins, credentials.id);
        Ok(LoginSession { accounts: st.accounts.clone(), events: rx })
    }

    async fn logout(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.logged_in = false;
        st.trade_tx = None;
        Ok(())
    }

    async fn probe(&self, _account: &Account) -> Result<()> {
        let mut st = self.state.lock();
        if let Some(err) = st.check_failures.pop_front() {
            return Err(err);
        }
        if st.logged_in {
            Ok(())
        } else {
            Err(FbError::Auth("login expired".into()))
        }
    }

    async fn place_order(&self, account: &Account, order: &OrderSpec) -> Result<PlaceOrderResponse> {
        let mut st = self.state.lock();
        if !st.logged_in {
            return Err(FbError::Connectivity("not logged in".into()));
        }
        if let Some(message) = st.reject_next.take() {
            return Ok(PlaceOrderResponse::rejected(message));
        }
        if !st.accounts.iter().any(|a| a.account_no == account.account_no) {
            return Ok(PlaceOrderResponse::rejected(format!("unknown account {}", account.account_no)));
        }

        let order_no = format!("P{:06}", st.next_order);
        st.next_order += 1;
        st.orders.insert(
            order_no.clone(),
            PaperOrder {
                account_no: account.account_no.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                quantity: order.quantity,
                filled: 0,
                status: OrderStatus::Pending,
                user_def: order.user_def.clone(),
            },
        );

        if st.fill_mode == FillMode::Immediate {
            let price = order
                .price
                .or_else(|| st.last_prices.get(&order.instrument).copied())
                .unwrap_or_default();
            if let Err(e) = st.execute(&order_no, order.quantity, price) {
                warn!("[paper] immediate fill of {order_no} failed: {e}");
            }
        }
        Ok(PlaceOrderResponse::accepted(order_no))
    }

    async fn get_order_results(&self, account: &Account) -> Result<Vec<OrderResult>> {
        let st = self.state.lock();
        if !st.logged_in {
            return Err(FbError::Connectivity("not logged in".into()));
        }
        Ok(st
            .orders
            .iter()
            .filter(|(_, o)| o.account_no == account.account_no)
            .map(|(no, o)| OrderResult { order_no: no.clone(), instrument: o.instrument.clone(), status: o.status })
            .collect())
    }
}
