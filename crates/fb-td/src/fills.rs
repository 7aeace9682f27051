//! Fill processing.
//!
//! Fills arrive on an unbounded FIFO channel and are applied one at a time by
//! a single task, so no fill is ever coalesced or reordered. Each fill is
//! applied under its instrument's lock; a position that goes flat releases
//! its market-data subscription afterwards, outside the lock.

use std::sync::Arc;

use async_trait::async_trait;
use fb_core::types::{Account, FillEvent};
use fb_md::GatewayPool;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::{SessionEvent, SessionEventSender};
use crate::registry::{FillOutcome, InstrumentRegistry};

/// Strategy-side receiver of applied fills.
#[async_trait]
pub trait FillHandler: Send + Sync {
    async fn on_fill(&self, fill: FillEvent, outcome: FillOutcome);
}

pub(crate) type FillHandlerSlot = Arc<RwLock<Option<Arc<dyn FillHandler>>>>;
pub(crate) type ActiveAccount = Arc<RwLock<Option<Account>>>;

pub type FillSender = mpsc::UnboundedSender<FillEvent>;
pub type FillReceiver = mpsc::UnboundedReceiver<FillEvent>;

/// Applies fills to the instrument registry.
pub struct FillProcessor {
    registry: Arc<InstrumentRegistry>,
    pool: Arc<GatewayPool>,
    active: ActiveAccount,
    handler: FillHandlerSlot,
    events: SessionEventSender,
}

impl FillProcessor {
    pub(crate) fn new(
        registry: Arc<InstrumentRegistry>,
        pool: Arc<GatewayPool>,
        active: ActiveAccount,
        handler: FillHandlerSlot,
        events: SessionEventSender,
    ) -> Self {
        Self { registry, pool, active, handler, events }
    }

    /// Run until the fill channel closes or shutdown is signalled.
    pub fn spawn(self, mut fills: FillReceiver, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    fill = fills.recv() => match fill {
                        Some(fill) => {
                            self.process(fill).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("[fills] processor exited");
        })
    }

    /// Apply one fill and run its follow-ups.
    pub async fn process(&self, fill: FillEvent) -> FillOutcome {
        let active_no = self.active.read().as_ref().map(|a| a.account_no.clone());
        if active_no.as_deref() != Some(fill.account_no.as_str()) {
            debug!(
                "[fills] ignoring fill {} for inactive account {}",
                fill.order_no, fill.account_no
            );
            return FillOutcome::Unknown;
        }

        let outcome = self.registry.apply_fill(&fill);
        match &outcome {
            FillOutcome::Opened(p) | FillOutcome::Increased(p) | FillOutcome::Reduced(p) => {
                info!(
                    "[fills] {} {} {}@{} -> size={} avg={:.4}",
                    p.instrument, fill.order_no, fill.filled_qty, fill.filled_price, p.size, p.avg_price
                );
            }
            FillOutcome::Closed { instrument } => {
                info!("[fills] {instrument} {} closed position", fill.order_no);
                self.pool.unsubscribe(instrument).await;
                let _ = self.events.send(SessionEvent::PositionClosed { instrument: instrument.clone() });
            }
            FillOutcome::Deferred | FillOutcome::Unknown | FillOutcome::ExitWhileFlat => {}
        }

        if !matches!(outcome, FillOutcome::Deferred | FillOutcome::Unknown) {
            let handler = self.handler.read().clone();
            if let Some(h) = handler {
                h.on_fill(fill, outcome.clone()).await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fb_core::backoff::BackoffPolicy;
    use fb_core::gateway::MarketDataConnector;
    use fb_core::types::{Intent, Side};
    use fb_md::{PoolConfig, QuoteDispatcher};
    use fb_paper::{PAPER_ACCOUNT, PaperBroker};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Outcomes(mpsc::UnboundedSender<FillOutcome>);

    #[async_trait]
    impl FillHandler for Outcomes {
        async fn on_fill(&self, _fill: FillEvent, outcome: FillOutcome) {
            let _ = self.0.send(outcome);
        }
    }

    fn fill(order_no: &str, account_no: &str, qty: u64, price: f64) -> FillEvent {
        FillEvent {
            account_no: account_no.into(),
            order_no: order_no.into(),
            instrument: "0050".into(),
            side: Side::Buy,
            filled_qty: qty,
            filled_price: price,
            user_def: None,
            filled_at: 0,
        }
    }

    fn processor() -> (FillProcessor, Arc<InstrumentRegistry>, UnboundedReceiver<FillOutcome>) {
        let connector: Arc<dyn MarketDataConnector> = Arc::new(PaperBroker::new());
        let config = PoolConfig {
            connections: 1,
            capacity: 5,
            replay_interval: Duration::ZERO,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 1),
        };
        let (pool, _signals) = GatewayPool::new(connector, config, Arc::new(QuoteDispatcher::new()));
        let registry = Arc::new(InstrumentRegistry::new());
        let active = Arc::new(RwLock::new(Some(Account {
            account_no: PAPER_ACCOUNT.into(),
            name: "paper".into(),
            branch: "0000".into(),
        })));
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: FillHandlerSlot = Arc::new(RwLock::new(Some(Arc::new(Outcomes(tx)) as Arc<dyn FillHandler>)));
        let (events, _events_rx) = mpsc::unbounded_channel();
        let p = FillProcessor::new(Arc::clone(&registry), Arc::new(pool), active, handler, events);
        (p, registry, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<FillOutcome>) -> FillOutcome {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for fill outcome")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn spawned_task_applies_queued_fills_in_order() {
        let (p, registry, mut outcomes) = processor();
        registry.reserve("0050").unwrap();
        registry.record_placed("0050", "E1", Intent::Entry, 1);

        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = p.spawn(fill_rx, shutdown_rx);

        fill_tx.send(fill("E1", "someone-else", 500, 99.0)).unwrap();
        fill_tx.send(fill("E1", PAPER_ACCOUNT, 600, 100.0)).unwrap();
        fill_tx.send(fill("E1", PAPER_ACCOUNT, 400, 105.0)).unwrap();

        // The foreign-account fill never reaches the handler.
        assert!(matches!(next(&mut outcomes).await, FillOutcome::Opened(p) if p.size == 600));
        let FillOutcome::Increased(pos) = next(&mut outcomes).await else {
            panic!("second fill should grow the position");
        };
        assert_eq!(pos.size, 1000);
        assert!((pos.avg_price - 102.0).abs() < 1e-9);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_fill_reports_closed_and_skips_unknown_orders() {
        let (p, registry, _outcomes) = processor();
        registry.reserve("0050").unwrap();
        registry.record_placed("0050", "E1", Intent::Entry, 1);
        assert!(matches!(p.process(fill("E1", PAPER_ACCOUNT, 1000, 100.0)).await, FillOutcome::Opened(_)));

        registry.reserve("0050").unwrap();
        registry.record_placed("0050", "X1", Intent::Exit, 2);
        assert_eq!(
            p.process(fill("X1", PAPER_ACCOUNT, 1000, 101.0)).await,
            FillOutcome::Closed { instrument: "0050".into() }
        );
        assert_eq!(p.process(fill("??", PAPER_ACCOUNT, 1, 1.0)).await, FillOutcome::Unknown);
        assert!(registry.position("0050").is_none());
    }
}
