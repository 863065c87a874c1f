//! Fixed-cadence market polling
//!
//! The poller owns the timer; [`MarketAggregator`] only fetches. A mode
//! change restarts the timer and discards whatever fetch was in flight.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::aggregator::{source_for, MarketAggregator, QuoteSource};
use crate::connector::ExchangeConnector;
use crate::market::MarketQuote;
use crate::mode::{ModeController, ModeState};

/// The connector live data is read from, if any. Clones share the slot.
#[derive(Clone, Default)]
pub struct ConnectorSlot {
    inner: Arc<RwLock<Option<Arc<ExchangeConnector>>>>,
}

impl ConnectorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<ExchangeConnector>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Install `next`, returning the previous occupant
    pub fn replace(&self, next: Option<Arc<ExchangeConnector>>) -> Option<Arc<ExchangeConnector>> {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, next)
    }
}

/// Latest published market view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub source: QuoteSource,
    pub quotes: Vec<MarketQuote>,
    /// Error from the most recent poll; the quotes are then from an earlier one
    pub last_error: Option<String>,
    /// Time the quotes were fetched
    pub updated_at: Option<DateTime<Utc>>,
    /// Completed polls, failed ones included
    pub polls: u64,
}

impl Default for MarketSnapshot {
    fn default() -> Self {
        Self {
            source: QuoteSource::Synthetic,
            quotes: Vec::new(),
            last_error: None,
            updated_at: None,
            polls: 0,
        }
    }
}

/// Identifies the configuration a fetch was started under
fn config_key(state: &ModeState) -> (bool, Option<String>) {
    (
        state.demo_mode,
        state.active_credentials.as_ref().map(|c| c.id.clone()),
    )
}

struct PollerShared {
    aggregator: MarketAggregator,
    mode: ModeController,
    slot: ConnectorSlot,
    interval: Duration,
    snapshot_tx: watch::Sender<MarketSnapshot>,
    /// Held for the duration of one fetch
    fetch_lock: tokio::sync::Mutex<()>,
}

impl PollerShared {
    /// One fetch, applied unless the configuration changed meanwhile.
    /// Skipped when another fetch is still running.
    async fn poll_once(&self) -> bool {
        let Ok(_guard) = self.fetch_lock.try_lock() else {
            debug!("Previous fetch still running, skipping poll");
            return false;
        };

        let mode = self.mode.snapshot();
        let key = config_key(&mode);
        let connector = self.slot.get();
        let source = source_for(mode.demo_mode, connector.as_deref());

        let result = self
            .aggregator
            .fetch_ranked(mode.demo_mode, connector.as_deref())
            .await;

        if config_key(&self.mode.snapshot()) != key {
            debug!("Mode changed during fetch, discarding result");
            return false;
        }

        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.polls += 1;
            match result {
                Ok(quotes) => {
                    debug!(count = quotes.len(), source = ?source, "Market snapshot updated");
                    snapshot.source = source;
                    snapshot.quotes = quotes;
                    snapshot.last_error = None;
                    snapshot.updated_at = Some(Utc::now());
                }
                Err(e) => {
                    warn!(error = %e, "Market fetch failed, keeping previous quotes");
                    snapshot.last_error = Some(e.to_string());
                }
            }
        });
        true
    }
}

pub struct MarketPoller {
    shared: Arc<PollerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketPoller {
    pub fn new(
        aggregator: MarketAggregator,
        mode: ModeController,
        slot: ConnectorSlot,
        interval: Duration,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(MarketSnapshot::default());
        Self {
            shared: Arc::new(PollerShared {
                aggregator,
                mode,
                slot,
                interval,
                snapshot_tx,
                fetch_lock: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling loop; a second call while running does nothing
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        info!(interval_ms = self.shared.interval.as_millis() as u64, "Market poller started");
        *task = Some(tokio::spawn(run(self.shared.clone())));
    }

    /// Cancel the timer and any in-flight fetch
    pub fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Market poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscribe(&self) -> watch::Receiver<MarketSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn latest(&self) -> MarketSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Poll now, outside the timer. Returns the snapshot afterwards, which is
    /// unchanged if a fetch was already running.
    pub async fn refresh(&self) -> MarketSnapshot {
        self.shared.poll_once().await;
        self.latest()
    }
}

impl Drop for MarketPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

type PollFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

async fn run(shared: Arc<PollerShared>) {
    let mut mode_rx = shared.mode.subscribe();

    loop {
        mode_rx.borrow_and_update();
        let mut ticker = tokio::time::interval(shared.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<PollFuture<'_>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        debug!("Previous fetch still running, skipping tick");
                    } else {
                        in_flight = Some(Box::pin(shared.poll_once()));
                    }
                }
                _ = async {
                    match in_flight.as_mut() {
                        Some(fetch) => fetch.await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                }
                changed = mode_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // dropping `in_flight` abandons the stale fetch
                    debug!("Mode changed, restarting poll timer");
                    break;
                }
            }
        }
    }
}
