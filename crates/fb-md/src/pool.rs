//! Market-data gateway pool.
//!
//! [`GatewayPool`] owns N independent market-data connections ("slots"),
//! each with a fixed subscription capacity. It is the only holder of the
//! [`QuoteFeed`] handles; callers subscribe and unsubscribe through it.
//!
//! # Architecture
//!
//! ```text
//! GatewayPool
//! ├── slot 0 ── QuoteFeed + reader task ──► QuoteDispatcher lanes
//! ├── slot 1 ── QuoteFeed + reader task ──► QuoteDispatcher lanes
//! ├── SubscriptionRouter (instrument → slot)
//! └── PoolSignal channel ──► session supervisor (disconnect notifications)
//! ```
//!
//! When a slot's event stream reports a disconnect, the reader marks the slot
//! `Disconnected` and emits [`PoolSignal::Disconnected`]. Assignments are kept,
//! so [`GatewayPool::reconnect_slot`] can reopen the slot and replay exactly
//! the instruments it held before the drop.
//!
//! The pool lock is only held around in-memory bookkeeping, never across a
//! network call or backoff sleep. An instrument whose gateway subscribe is
//! still in flight is marked pending; a concurrent subscribe or unsubscribe
//! of it waits for that call to finish and then acts on the outcome.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use fb_core::backoff::{self, BackoffPolicy};
use fb_core::config::{MarketDataConfig, ReconnectConfig};
use fb_core::error::{FbError, Result};
use fb_core::gateway::{MarketDataConnector, MdConnection, MdEvent, MdEventReceiver, QuoteFeed};
use fb_core::types::ConnectionState;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::QuoteDispatcher;
use crate::router::SubscriptionRouter;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Pool sizing and retry settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of market-data connections.
    pub connections: usize,
    /// Subscriptions per connection.
    pub capacity: usize,
    /// Pause between resubscriptions during replay.
    pub replay_interval: Duration,
    /// Retry policy for connecting and for replay subscriptions.
    pub backoff: BackoffPolicy,
}

impl PoolConfig {
    pub fn from_config(md: &MarketDataConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            connections: md.effective_connections(),
            capacity: md.capacity,
            replay_interval: md.replay_interval(),
            backoff: reconnect.md_policy(),
        }
    }
}

/// Notifications from the pool to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSignal {
    /// A slot's connection dropped unexpectedly.
    Disconnected { slot: usize, generation: u64, reason: String },
}

/// Receiver half of the pool signal channel.
pub type PoolSignalReceiver = mpsc::UnboundedReceiver<PoolSignal>;

/// Snapshot of one slot for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub slot: usize,
    pub state: ConnectionState,
    pub subscriptions: usize,
    pub capacity: usize,
}

/// Result of a successful [`GatewayPool::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed { slot: usize },
    AlreadySubscribed { slot: usize },
}

impl SubscribeOutcome {
    pub fn slot(&self) -> usize {
        match *self {
            Self::Subscribed { slot } | Self::AlreadySubscribed { slot } => slot,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    state: ConnectionState,
    /// Bumped every time the slot gets a new connection; stale readers compare
    /// against it before touching the slot.
    generation: u64,
    feed: Option<Arc<dyn QuoteFeed>>,
    reader: Option<JoinHandle<()>>,
}

struct PoolState {
    slots: Vec<Slot>,
    router: SubscriptionRouter,
    /// Instruments with a gateway subscribe in flight. The sender half is
    /// held by the subscribing call and dropped when it finishes.
    pending: AHashMap<String, watch::Receiver<()>>,
}

type SharedState = Arc<Mutex<PoolState>>;

// ---------------------------------------------------------------------------
// GatewayPool
// ---------------------------------------------------------------------------

/// Owns every market-data connection and the subscription routing table.
pub struct GatewayPool {
    connector: Arc<dyn MarketDataConnector>,
    config: PoolConfig,
    state: SharedState,
    dispatcher: Arc<QuoteDispatcher>,
    signal_tx: mpsc::UnboundedSender<PoolSignal>,
}

impl GatewayPool {
    /// Create a pool with all slots `Disconnected`.
    ///
    /// Returns the pool and the receiver for [`PoolSignal`]s that the session
    /// supervisor should poll.
    pub fn new(
        connector: Arc<dyn MarketDataConnector>,
        config: PoolConfig,
        dispatcher: Arc<QuoteDispatcher>,
    ) -> (Self, PoolSignalReceiver) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let n = config.connections.max(1);
        let state = PoolState {
            slots: (0..n).map(|_| Slot::default()).collect(),
            router: SubscriptionRouter::new(n, config.capacity),
            pending: AHashMap::new(),
        };
        let pool = Self {
            connector,
            config,
            state: Arc::new(Mutex::new(state)),
            dispatcher,
            signal_tx,
        };
        (pool, signal_rx)
    }

    pub fn dispatcher(&self) -> &Arc<QuoteDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Open every slot (concurrently) and replay whatever each slot already
    /// holds. Slots that exhaust their retry bound are marked `Failed`.
    ///
    /// Returns the number of live slots; fails only if none came up.
    pub async fn connect_all(&self) -> Result<usize> {
        let n = self.slot_count();
        {
            let mut st = self.state.lock();
            for slot in &mut st.slots {
                slot.state = ConnectionState::Connecting;
            }
        }
        info!("[pool] connecting {n} market-data connection(s)");

        let results = join_all((0..n).map(|i| self.open_and_replay(i))).await;
        let live = results.iter().filter(|r| r.is_ok()).count();
        if live == 0 {
            let reason = results
                .into_iter()
                .find_map(|r| r.err())
                .unwrap_or_else(|| FbError::Connectivity("no market-data connections".into()));
            error!("[pool] no market-data connection could be established: {reason}");
            return Err(reason);
        }
        info!("[pool] {live}/{n} market-data connection(s) live");
        Ok(live)
    }

    /// Claim `slot` for reconnection. Returns `false` if it is already live
    /// or another reconnect is in progress.
    pub fn begin_reconnect(&self, slot: usize) -> bool {
        let mut st = self.state.lock();
        match st.slots.get_mut(slot) {
            Some(s) if matches!(s.state, ConnectionState::Disconnected | ConnectionState::Failed) => {
                s.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Reopen a dropped slot with backoff and replay its subscriptions.
    ///
    /// Returns `Ok(false)` without doing anything if the slot was not
    /// claimable (see [`begin_reconnect`](Self::begin_reconnect)).
    pub async fn reconnect_slot(&self, slot: usize) -> Result<bool> {
        if !self.begin_reconnect(slot) {
            debug!("[pool] slot {slot} reconnect skipped (live or already connecting)");
            return Ok(false);
        }
        self.reopen_slot(slot).await?;
        Ok(true)
    }

    /// Reopen a slot already claimed with
    /// [`begin_reconnect`](Self::begin_reconnect) and replay its
    /// subscriptions. On exhaustion the slot is left `Failed`.
    pub async fn reopen_slot(&self, slot: usize) -> Result<()> {
        info!("[pool] slot {slot} reconnecting");
        self.open_and_replay(slot).await
    }

    /// Tear down every slot and open fresh connections, keeping all
    /// assignments. Used after the trading session logs in again.
    pub async fn reconnect_all(&self) -> Result<()> {
        let stale = self.detach_all(ConnectionState::Connecting);
        for feed in stale {
            feed.disconnect().await;
        }
        let n = self.slot_count();
        info!("[pool] rebuilding all {n} market-data connection(s)");
        let results = join_all((0..n).map(|i| self.open_and_replay(i))).await;
        match results.into_iter().find_map(|r| r.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disconnect every slot and stop all dispatcher lanes.
    pub async fn shutdown(&self) {
        let feeds = self.detach_all(ConnectionState::Disconnected);
        for feed in feeds {
            feed.disconnect().await;
        }
        self.dispatcher.shutdown();
        info!("[pool] stopped");
    }

    /// Mark a slot `Failed` (retry bound exhausted).
    pub fn mark_failed(&self, slot: usize) {
        if let Some(s) = self.state.lock().slots.get_mut(slot) {
            s.state = ConnectionState::Failed;
        }
    }

    // -- Subscriptions -------------------------------------------------------

    /// Subscribe `instrument` on the first live connection with free capacity.
    ///
    /// # Errors
    ///
    /// - [`FbError::Connectivity`] if no connection is live.
    /// - [`FbError::NoCapacity`] if every live connection is full.
    /// - Whatever the gateway returns for the subscribe call; the assignment
    ///   is rolled back in that case.
    pub async fn subscribe(&self, instrument: &str) -> Result<SubscribeOutcome> {
        let (slot, feed, _in_flight) = loop {
            let wait = {
                let mut st = self.state.lock();
                match st.pending.get(instrument).cloned() {
                    Some(wait) => wait,
                    None => {
                        if let Some(slot) = st.router.slot_of(instrument) {
                            return Ok(SubscribeOutcome::AlreadySubscribed { slot });
                        }
                        let PoolState { slots, router, pending } = &mut *st;
                        if !slots.iter().any(|s| s.state.is_live()) {
                            return Err(FbError::Connectivity("no live market-data connection".into()));
                        }
                        let slot = router.assign(instrument, |i| slots[i].state.is_live())?;
                        let (done, wait) = watch::channel(());
                        pending.insert(instrument.to_string(), wait);
                        let in_flight = InFlight {
                            state: Arc::clone(&self.state),
                            instrument: instrument.to_string(),
                            _done: done,
                        };
                        break (slot, slots[slot].feed.clone(), in_flight);
                    }
                }
            };
            wait_in_flight(wait).await;
        };

        self.dispatcher.open_lane(instrument);

        let result = match feed {
            Some(feed) => feed.subscribe(instrument).await,
            None => Err(FbError::Connectivity(format!("slot {slot} has no feed"))),
        };
        if let Err(e) = result {
            warn!("[pool] subscribe {instrument} on slot {slot} failed: {e}");
            self.state.lock().router.release(instrument);
            self.dispatcher.close_lane(instrument);
            return Err(e);
        }

        info!("[pool] subscribed {instrument} on slot {slot}");
        Ok(SubscribeOutcome::Subscribed { slot })
    }

    /// Remove `instrument`'s subscription. Returns `false` if it was not
    /// subscribed. Gateway errors are logged; the assignment is removed either way.
    ///
    /// If a subscribe of `instrument` is in flight, waits for it first.
    pub async fn unsubscribe(&self, instrument: &str) -> bool {
        let (slot, feed) = loop {
            let wait = {
                let mut st = self.state.lock();
                match st.pending.get(instrument).cloned() {
                    Some(wait) => wait,
                    None => {
                        let Some(slot) = st.router.release(instrument) else {
                            debug!("[pool] unsubscribe {instrument}: not subscribed");
                            return false;
                        };
                        let s = &st.slots[slot];
                        break (slot, if s.state.is_live() { s.feed.clone() } else { None });
                    }
                }
            };
            wait_in_flight(wait).await;
        };

        self.dispatcher.close_lane(instrument);

        if let Some(feed) = feed {
            if let Err(e) = feed.unsubscribe(instrument).await {
                warn!("[pool] unsubscribe {instrument} on slot {slot} failed: {e}");
            }
        }
        info!("[pool] unsubscribed {instrument} from slot {slot}");
        true
    }

    // -- Queries -------------------------------------------------------------

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn slot_of(&self, instrument: &str) -> Option<usize> {
        self.state.lock().router.slot_of(instrument)
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.slot_of(instrument).is_some()
    }

    /// Instruments assigned to `slot`, in subscription order.
    pub fn subscriptions(&self, slot: usize) -> Vec<String> {
        self.state.lock().router.instruments_of(slot).to_vec()
    }

    /// Every subscribed instrument.
    pub fn all_subscriptions(&self) -> Vec<String> {
        self.state.lock().router.all_instruments()
    }

    /// Whether `generation` is still the slot's current connection. Signals
    /// from replaced connections fail this check.
    pub fn is_current(&self, slot: usize, generation: u64) -> bool {
        self.state.lock().slots.get(slot).is_some_and(|s| s.generation == generation)
    }

    pub fn status(&self) -> Vec<ConnectionStatus> {
        let st = self.state.lock();
        st.slots
            .iter()
            .enumerate()
            .map(|(i, s)| ConnectionStatus {
                slot: i,
                state: s.state,
                subscriptions: st.router.count(i),
                capacity: st.router.capacity(),
            })
            .collect()
    }

    // -- Internals -----------------------------------------------------------

    /// Connect `slot` with backoff, then replay its assignments.
    async fn open_and_replay(&self, slot: usize) -> Result<()> {
        let label = format!("pool-slot-{slot}");
        let opened = backoff::retry(&label, self.config.backoff, |_| self.open_slot(slot)).await;
        let generation = match opened {
            Ok(g) => g,
            Err(e) => {
                self.mark_failed(slot);
                return Err(e);
            }
        };
        let replayed = self.replay_slot(slot, generation).await;
        if replayed > 0 {
            info!("[pool] slot {slot} replayed {replayed} subscription(s)");
        }
        Ok(())
    }

    /// One connect attempt. Installs the feed and reader on success.
    async fn open_slot(&self, slot: usize) -> Result<u64> {
        let MdConnection { feed, events } = self.connector.connect_marketdata().await?;

        let mut st = self.state.lock();
        let s = &mut st.slots[slot];
        s.generation += 1;
        let generation = s.generation;
        if let Some(old) = s.reader.take() {
            old.abort();
        }
        s.feed = Some(feed);
        s.state = ConnectionState::Live;
        s.reader = Some(tokio::spawn(run_reader(
            slot,
            generation,
            events,
            Arc::clone(&self.state),
            Arc::clone(&self.dispatcher),
            self.signal_tx.clone(),
        )));
        info!("[pool] slot {slot} live (generation {generation})");
        Ok(generation)
    }

    /// Resubscribe every instrument still assigned to `slot`. Failures are
    /// retried with the pool's backoff policy and then logged; assignments are
    /// kept so the next reconnect tries again.
    async fn replay_slot(&self, slot: usize, generation: u64) -> usize {
        let instruments = self.subscriptions(slot);
        let mut replayed = 0;

        for (i, instrument) in instruments.iter().enumerate() {
            if i > 0 && !self.config.replay_interval.is_zero() {
                tokio::time::sleep(self.config.replay_interval).await;
            }

            let feed = {
                let st = self.state.lock();
                let s = &st.slots[slot];
                if s.generation != generation || !s.state.is_live() {
                    warn!("[pool] slot {slot} changed during replay, stopping");
                    return replayed;
                }
                if st.router.slot_of(instrument) != Some(slot) {
                    continue; // unsubscribed meanwhile
                }
                s.feed.clone()
            };
            let Some(feed) = feed else {
                return replayed;
            };

            self.dispatcher.open_lane(instrument);
            let label = format!("pool-slot-{slot}-replay");
            match backoff::retry(&label, self.config.backoff, |_| feed.subscribe(instrument)).await {
                Ok(()) => replayed += 1,
                Err(e) => error!("[pool] replay of {instrument} on slot {slot} failed: {e}"),
            }
        }
        replayed
    }

    /// Detach every slot's feed and reader, setting `next` as the new state.
    fn detach_all(&self, next: ConnectionState) -> Vec<Arc<dyn QuoteFeed>> {
        let mut st = self.state.lock();
        let mut feeds = Vec::new();
        for s in &mut st.slots {
            if let Some(reader) = s.reader.take() {
                reader.abort();
            }
            if let Some(feed) = s.feed.take() {
                feeds.push(feed);
            }
            s.generation += 1;
            s.state = next;
        }
        feeds
    }
}

/// Marks an instrument's subscribe as in flight. Dropping it (on completion
/// or cancellation) clears the mark and wakes every waiter.
struct InFlight {
    state: SharedState,
    instrument: String,
    _done: watch::Sender<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.instrument);
    }
}

/// Resolves once the subscribe that owns the matching sender finishes.
async fn wait_in_flight(mut wait: watch::Receiver<()>) {
    // Only ever completes with `Err`, when the sender is dropped.
    let _ = wait.changed().await;
}

/// Read loop for one connection: forwards quotes to the dispatcher and
/// reports an unexpected disconnect.
async fn run_reader(
    slot: usize,
    generation: u64,
    mut events: MdEventReceiver,
    state: SharedState,
    dispatcher: Arc<QuoteDispatcher>,
    signal_tx: mpsc::UnboundedSender<PoolSignal>,
) {
    let reason = loop {
        match events.recv().await {
            Some(MdEvent::Quote(quote)) => {
                dispatcher.publish(quote);
            }
            Some(MdEvent::Subscribed { instrument }) => {
                debug!("[pool] slot {slot}: subscribed ack for {instrument}");
            }
            Some(MdEvent::Unsubscribed { instrument }) => {
                debug!("[pool] slot {slot}: unsubscribed ack for {instrument}");
            }
            Some(MdEvent::Error(e)) => {
                warn!("[pool] slot {slot}: gateway error: {e}");
            }
            Some(MdEvent::Disconnected { code, reason }) => {
                break format!("code {code}: {reason}");
            }
            None => break "event stream closed".to_string(),
        }
    };

    let current = {
        let mut st = state.lock();
        let s = &mut st.slots[slot];
        if s.generation == generation && s.state.is_live() {
            s.state = ConnectionState::Disconnected;
            s.feed = None;
            s.reader = None;
            true
        } else {
            false
        }
    };

    if current {
        warn!("[pool] slot {slot} disconnected ({reason})");
        let _ = signal_tx.send(PoolSignal::Disconnected { slot, generation, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fb_core::gateway::MdEventSender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Connector whose connections record subscriptions and expose their
    /// event senders so tests can inject disconnects.
    #[derive(Default)]
    struct MockConnector {
        opened: AtomicUsize,
        fail_connects: AtomicUsize,
        feeds: Mutex<Vec<(Arc<MockFeed>, MdEventSender)>>,
    }

    #[derive(Default)]
    struct MockFeed {
        subscribed: Mutex<Vec<String>>,
        reject: Mutex<Vec<String>>,
        /// When set, subscribe calls park until notified.
        hold: Mutex<Option<Arc<Notify>>>,
    }

    #[async_trait]
    impl QuoteFeed for MockFeed {
        async fn subscribe(&self, instrument: &str) -> Result<()> {
            let hold = self.hold.lock().clone();
            if let Some(gate) = hold {
                gate.notified().await;
            }
            if self.reject.lock().iter().any(|r| r == instrument) {
                return Err(FbError::Connectivity("refused".into()));
            }
            self.subscribed.lock().push(instrument.to_string());
            Ok(())
        }
        async fn unsubscribe(&self, instrument: &str) -> Result<()> {
            self.subscribed.lock().retain(|s| s != instrument);
            Ok(())
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl MarketDataConnector for MockConnector {
        async fn connect_marketdata(&self) -> Result<MdConnection> {
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(FbError::Connectivity("connect refused".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let feed = Arc::new(MockFeed::default());
            self.feeds.lock().push((Arc::clone(&feed), tx));
            Ok(MdConnection { feed, events: rx })
        }
    }

    fn config(connections: usize, capacity: usize) -> PoolConfig {
        PoolConfig {
            connections,
            capacity,
            replay_interval: Duration::ZERO,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3),
        }
    }

    fn pool(connector: &Arc<MockConnector>, connections: usize, capacity: usize) -> (GatewayPool, PoolSignalReceiver) {
        GatewayPool::new(
            Arc::clone(connector) as Arc<dyn MarketDataConnector>,
            config(connections, capacity),
            Arc::new(QuoteDispatcher::new()),
        )
    }

    #[tokio::test]
    async fn fifth_goes_to_first_connection_sixth_to_second() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 2, 5);
        assert_eq!(pool.connect_all().await.unwrap(), 2);

        for s in ["s1", "s2", "s3", "s4"] {
            assert_eq!(pool.subscribe(s).await.unwrap().slot(), 0);
        }
        assert_eq!(pool.subscribe("s5").await.unwrap(), SubscribeOutcome::Subscribed { slot: 0 });
        assert_eq!(pool.subscribe("s6").await.unwrap(), SubscribeOutcome::Subscribed { slot: 1 });
        assert_eq!(
            pool.subscribe("s6").await.unwrap(),
            SubscribeOutcome::AlreadySubscribed { slot: 1 }
        );
        let status = pool.status();
        assert_eq!(status[0].subscriptions, 5);
        assert_eq!(status[1].subscriptions, 1);
    }

    #[tokio::test]
    async fn subscribe_fails_deterministically_when_full() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 2, 1);
        pool.connect_all().await.unwrap();
        pool.subscribe("a").await.unwrap();
        pool.subscribe("b").await.unwrap();
        let err = pool.subscribe("c").await.unwrap_err();
        assert_eq!(err, FbError::NoCapacity { instrument: "c".into() });
        assert!(!pool.is_subscribed("c"));
        assert!(!pool.dispatcher().has_lane("c"));
    }

    #[tokio::test]
    async fn subscribe_before_connect_is_a_connectivity_error() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        assert!(matches!(pool.subscribe("a").await, Err(FbError::Connectivity(_))));
    }

    #[tokio::test]
    async fn gateway_refusal_rolls_back_assignment() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        pool.connect_all().await.unwrap();
        connector.feeds.lock()[0].0.reject.lock().push("bad".into());
        assert!(pool.subscribe("bad").await.is_err());
        assert!(!pool.is_subscribed("bad"));
        assert_eq!(pool.status()[0].subscriptions, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_noop_when_absent() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        pool.connect_all().await.unwrap();
        assert!(!pool.unsubscribe("nope").await);
        pool.subscribe("x").await.unwrap();
        assert!(pool.unsubscribe("x").await);
        assert!(connector.feeds.lock()[0].0.subscribed.lock().is_empty());
        assert!(!pool.dispatcher().has_lane("x"));
    }

    #[tokio::test]
    async fn reconnect_replays_exactly_the_dropped_subscriptions() {
        let connector = Arc::new(MockConnector::default());
        let (pool, mut rx) = pool(&connector, 2, 3);
        pool.connect_all().await.unwrap();
        for s in ["a", "b", "c", "d"] {
            pool.subscribe(s).await.unwrap();
        }
        let before = pool.subscriptions(0);
        assert_eq!(before, vec!["a", "b", "c"]);

        // Drop slot 0.
        let tx = connector.feeds.lock()[0].1.clone();
        tx.send(MdEvent::Disconnected { code: 1006, reason: "abnormal".into() }).unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let PoolSignal::Disconnected { slot, .. } = signal;
        assert_eq!(slot, 0);
        assert_eq!(pool.status()[0].state, ConnectionState::Disconnected);
        // Assignments survive the drop.
        assert_eq!(pool.subscriptions(0), before);

        assert!(pool.reconnect_slot(0).await.unwrap());
        assert_eq!(pool.status()[0].state, ConnectionState::Live);
        let feeds = connector.feeds.lock();
        let recovered = feeds.last().unwrap().0.subscribed.lock().clone();
        assert_eq!(recovered, before);
        // Slot 1 untouched.
        assert_eq!(feeds[1].0.subscribed.lock().clone(), vec!["d"]);
    }

    #[tokio::test]
    async fn reconnect_of_live_slot_is_skipped() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 3);
        pool.connect_all().await.unwrap();
        assert!(!pool.reconnect_slot(0).await.unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_reconnect_marks_slot_failed() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 3);
        connector.fail_connects.store(10, Ordering::SeqCst);
        assert!(pool.connect_all().await.is_err());
        assert_eq!(pool.status()[0].state, ConnectionState::Failed);
        // A failed slot can be claimed again later.
        connector.fail_connects.store(0, Ordering::SeqCst);
        assert!(pool.reconnect_slot(0).await.unwrap());
        assert_eq!(pool.status()[0].state, ConnectionState::Live);
    }

    #[tokio::test]
    async fn reconnect_all_keeps_every_assignment() {
        let connector = Arc::new(MockConnector::default());
        let (pool, mut rx) = pool(&connector, 2, 1);
        pool.connect_all().await.unwrap();
        pool.subscribe("a").await.unwrap();
        pool.subscribe("b").await.unwrap();

        pool.reconnect_all().await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 4);
        assert_eq!(pool.subscriptions(0), vec!["a"]);
        assert_eq!(pool.subscriptions(1), vec!["b"]);
        // Planned teardown does not signal a disconnect.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    /// Hold slot 0's gateway subscribe calls; returns the release gate.
    fn hold_subscribes(connector: &MockConnector) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *connector.feeds.lock()[0].0.hold.lock() = Some(Arc::clone(&gate));
        gate
    }

    fn release_subscribes(connector: &MockConnector, gate: &Notify) {
        connector.feeds.lock()[0].0.hold.lock().take();
        gate.notify_one();
    }

    async fn until_pending(pool: &GatewayPool, instrument: &str) {
        for _ in 0..400 {
            if pool.is_subscribed(instrument) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{instrument} never became pending");
    }

    #[tokio::test]
    async fn concurrent_subscribe_waits_for_the_gateway_answer() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        let pool = Arc::new(pool);
        pool.connect_all().await.unwrap();
        connector.feeds.lock()[0].0.reject.lock().push("bad".into());
        let gate = hold_subscribes(&connector);

        let first = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("bad").await }
        });
        until_pending(&pool, "bad").await;
        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("bad").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second caller must not answer before the gateway does");

        release_subscribes(&connector, &gate);
        assert!(first.await.unwrap().is_err());
        // The refused subscription is not reported as already subscribed.
        assert!(matches!(second.await.unwrap(), Err(FbError::Connectivity(_))));
        assert!(!pool.is_subscribed("bad"));
        assert_eq!(pool.status()[0].subscriptions, 0);
    }

    #[tokio::test]
    async fn concurrent_subscribe_sees_accepted_subscription() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        let pool = Arc::new(pool);
        pool.connect_all().await.unwrap();
        let gate = hold_subscribes(&connector);

        let first = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("x").await }
        });
        until_pending(&pool, "x").await;
        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("x").await }
        });

        release_subscribes(&connector, &gate);
        assert_eq!(first.await.unwrap().unwrap(), SubscribeOutcome::Subscribed { slot: 0 });
        assert_eq!(second.await.unwrap().unwrap(), SubscribeOutcome::AlreadySubscribed { slot: 0 });
        assert_eq!(connector.feeds.lock()[0].0.subscribed.lock().clone(), vec!["x"]);
    }

    #[tokio::test]
    async fn unsubscribe_during_subscribe_leaves_gateway_clean() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        let pool = Arc::new(pool);
        pool.connect_all().await.unwrap();
        let gate = hold_subscribes(&connector);

        let sub = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("y").await }
        });
        until_pending(&pool, "y").await;
        let unsub = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.unsubscribe("y").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!unsub.is_finished());

        release_subscribes(&connector, &gate);
        assert!(sub.await.unwrap().is_ok());
        assert!(unsub.await.unwrap());
        assert!(!pool.is_subscribed("y"));
        assert!(connector.feeds.lock()[0].0.subscribed.lock().is_empty());
        assert!(!pool.dispatcher().has_lane("y"));
    }

    #[tokio::test]
    async fn cancelled_subscribe_does_not_block_later_callers() {
        let connector = Arc::new(MockConnector::default());
        let (pool, _rx) = pool(&connector, 1, 5);
        let pool = Arc::new(pool);
        pool.connect_all().await.unwrap();
        let _gate = hold_subscribes(&connector);

        let stuck = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.subscribe("z").await }
        });
        until_pending(&pool, "z").await;
        stuck.abort();
        let _ = stuck.await;

        // The abandoned call keeps its assignment but no longer blocks.
        let outcome = tokio::time::timeout(Duration::from_secs(1), pool.subscribe("z")).await.unwrap();
        assert_eq!(outcome.unwrap(), SubscribeOutcome::AlreadySubscribed { slot: 0 });
    }
}
