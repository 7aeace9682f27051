//! Per-instrument quote fan-out with latest-wins back-pressure.
//!
//! Every subscribed instrument gets a *lane*: a single-slot
//! [`tokio::sync::watch`] channel plus one worker task. The connection read
//! loop publishes into the slot and returns immediately; if the worker is
//! still running the handler for the previous quote, the new quote simply
//! overwrites whatever is pending. The handler therefore always sees the
//! freshest price, at most one invocation per instrument runs at a time, and
//! nothing ever queues without bound.
//!
//! ```text
//! reader task ──publish──► lane[0050] (watch slot) ──► worker ──► QuoteHandler
//!             ──publish──► lane[2330] (watch slot) ──► worker ──► QuoteHandler
//! ```

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use fb_core::dedup::LatestTimestampFilter;
use fb_core::types::Quote;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Strategy-side receiver of quote updates.
#[async_trait]
pub trait QuoteHandler: Send + Sync {
    async fn on_quote(&self, quote: Quote);
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn QuoteHandler>>>>;

struct Lane {
    tx: watch::Sender<Option<Quote>>,
    task: JoinHandle<()>,
}

/// Routes quotes to the registered [`QuoteHandler`], one lane per instrument.
pub struct QuoteDispatcher {
    handler: HandlerSlot,
    lanes: Mutex<AHashMap<String, Lane>>,
}

impl QuoteDispatcher {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(RwLock::new(None)),
            lanes: Mutex::new(AHashMap::new()),
        }
    }

    /// Register (or replace) the quote handler. Takes effect on the next
    /// delivery of every lane.
    pub fn set_handler(&self, handler: Arc<dyn QuoteHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Create the lane for `instrument` if it does not exist yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_lane(&self, instrument: &str) {
        let mut lanes = self.lanes.lock();
        if lanes.contains_key(instrument) {
            return;
        }
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run_lane(instrument.to_string(), rx, Arc::clone(&self.handler)));
        lanes.insert(instrument.to_string(), Lane { tx, task });
        debug!("[dispatcher] lane opened for {instrument}");
    }

    /// Close the lane for `instrument`. A handler invocation already in
    /// progress runs to completion; pending quotes are discarded.
    pub fn close_lane(&self, instrument: &str) -> bool {
        // Dropping the sender ends the worker loop.
        let removed = self.lanes.lock().remove(instrument).is_some();
        if removed {
            debug!("[dispatcher] lane closed for {instrument}");
        }
        removed
    }

    /// Hand a quote to its instrument's lane, superseding any pending quote.
    ///
    /// Never blocks. Returns `false` (and drops the quote) if the instrument
    /// has no lane.
    pub fn publish(&self, quote: Quote) -> bool {
        let lanes = self.lanes.lock();
        match lanes.get(&quote.instrument) {
            Some(lane) => {
                lane.tx.send_replace(Some(quote));
                true
            }
            None => false,
        }
    }

    /// Whether `instrument` currently has a lane.
    pub fn has_lane(&self, instrument: &str) -> bool {
        self.lanes.lock().contains_key(instrument)
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Abort every lane worker.
    pub fn shutdown(&self) {
        let lanes: Vec<Lane> = self.lanes.lock().drain().map(|(_, lane)| lane).collect();
        let n = lanes.len();
        for lane in lanes {
            lane.task.abort();
        }
        info!("[dispatcher] stopped {n} lanes");
    }
}

impl Default for QuoteDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker loop for one instrument lane.
async fn run_lane(instrument: String, mut rx: watch::Receiver<Option<Quote>>, handler: HandlerSlot) {
    let mut filter = LatestTimestampFilter::new();

    while rx.changed().await.is_ok() {
        let Some(quote) = rx.borrow_and_update().clone() else {
            continue;
        };
        if !filter.check_and_update(&quote.instrument, quote.timestamp) {
            debug!("[dispatcher] {instrument}: dropping stale quote ts={}", quote.timestamp);
            continue;
        }
        let current = handler.read().clone();
        if let Some(h) = current {
            h.on_quote(quote).await;
        }
    }

    debug!("[dispatcher] {instrument}: lane worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    fn quote(instrument: &str, ts: u64, price: f64) -> Quote {
        Quote {
            instrument: instrument.into(),
            bid: price - 0.05,
            ask: price + 0.05,
            price,
            size: 1,
            timestamp: ts,
            is_continuous: true,
        }
    }

    /// Forwards every quote to a channel; optionally blocks the first
    /// invocation until released.
    struct Recorder {
        tx: mpsc::UnboundedSender<Quote>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl QuoteHandler for Recorder {
        async fn on_quote(&self, quote: Quote) {
            let first = quote.timestamp == 1;
            let _ = self.tx.send(quote);
            if first {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Quote>) -> Quote {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for quote")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn drops_superseded_quotes_while_handler_busy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let d = QuoteDispatcher::new();
        d.set_handler(Arc::new(Recorder { tx, gate: Some(gate.clone()) }));
        d.open_lane("0050");

        assert!(d.publish(quote("0050", 1, 100.0)));
        assert_eq!(recv(&mut rx).await.timestamp, 1);

        // Handler is parked on the first quote; these pile onto one slot.
        for ts in 2..=5 {
            d.publish(quote("0050", ts, 100.0 + ts as f64));
        }
        gate.notify_one();

        let next = recv(&mut rx).await;
        assert_eq!(next.timestamp, 5, "only the newest pending quote is delivered");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_quotes_never_reach_the_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let d = QuoteDispatcher::new();
        d.set_handler(Arc::new(Recorder { tx, gate: None }));
        d.open_lane("2330");

        d.publish(quote("2330", 10, 600.0));
        assert_eq!(recv(&mut rx).await.timestamp, 10);
        d.publish(quote("2330", 9, 599.0));
        d.publish(quote("2330", 10, 599.5));
        d.publish(quote("2330", 11, 601.0));
        assert_eq!(recv(&mut rx).await.timestamp, 11);
    }

    #[tokio::test]
    async fn quotes_without_a_lane_are_dropped() {
        let d = QuoteDispatcher::new();
        assert!(!d.publish(quote("9999", 1, 1.0)));
        d.open_lane("9999");
        d.open_lane("9999");
        assert_eq!(d.lane_count(), 1);
        assert!(d.close_lane("9999"));
        assert!(!d.close_lane("9999"));
        assert!(!d.publish(quote("9999", 2, 1.0)));
    }

    #[tokio::test]
    async fn lanes_run_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let d = QuoteDispatcher::new();
        d.set_handler(Arc::new(Recorder { tx, gate: Some(gate.clone()) }));
        d.open_lane("A");
        d.open_lane("B");

        // Lane A blocks on its first quote; lane B must still deliver.
        d.publish(quote("A", 1, 1.0));
        assert_eq!(recv(&mut rx).await.instrument, "A");
        d.publish(quote("B", 2, 2.0));
        assert_eq!(recv(&mut rx).await.instrument, "B");
        gate.notify_one();
        d.shutdown();
        assert_eq!(d.lane_count(), 0);
    }
}
