//! Periodic order-status reconciliation.
//!
//! Orders can reach a terminal status without a fill (cancelled, rejected
//! after ack). The reconciler polls the gateway's order results on a fixed
//! interval and clears those orders from the ledger so the instrument is not
//! blocked forever.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use fb_core::gateway::BrokerSdk;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fills::ActiveAccount;
use crate::registry::InstrumentRegistry;

pub struct Reconciler {
    sdk: Arc<dyn BrokerSdk>,
    registry: Arc<InstrumentRegistry>,
    active: ActiveAccount,
    interval: Duration,
}

impl Reconciler {
    pub(crate) fn new(
        sdk: Arc<dyn BrokerSdk>,
        registry: Arc<InstrumentRegistry>,
        active: ActiveAccount,
        interval: Duration,
    ) -> Self {
        Self { sdk, registry, active, interval }
    }

    /// Start the polling loop. It stops when either `shutdown` or
    /// `end_of_session` turns `true` (or its sender is dropped).
    pub fn spawn(
        self,
        mut shutdown: watch::Receiver<bool>,
        mut end_of_session: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("[reconciler] started (every {:?})", self.interval);

            loop {
                if *shutdown.borrow() || *end_of_session.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    r = shutdown.changed() => if r.is_err() || *shutdown.borrow() { break },
                    r = end_of_session.changed() => if r.is_err() || *end_of_session.borrow() { break },
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            info!("[reconciler] stopped");
        })
    }

    /// One reconciliation pass. Returns the number of orders resolved.
    pub async fn tick(&self) -> usize {
        // Snapshot first; no instrument lock is held during the query.
        let outstanding: AHashMap<String, String> =
            self.registry.outstanding().into_iter().map(|(instrument, no)| (no, instrument)).collect();
        if outstanding.is_empty() {
            return 0;
        }
        let Some(account) = self.active.read().clone() else {
            return 0;
        };

        let results = match self.sdk.get_order_results(&account).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[reconciler] order result query failed: {e}");
                return 0;
            }
        };

        let mut resolved = 0;
        for result in results.iter().filter(|r| r.status.is_terminal()) {
            let Some(instrument) = outstanding.get(&result.order_no) else {
                continue;
            };
            if self.registry.record_terminal(instrument, &result.order_no) {
                debug!("[reconciler] {instrument} {} -> {:?}", result.order_no, result.status);
                resolved += 1;
            }
        }
        resolved
    }
}
