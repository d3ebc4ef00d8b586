//! Strategy event loop
//!
//! Owns the timers around the engine: periodic reconciliation (which also
//! retries the initial ladder until a price is known), processed-event
//! sweeps and status logging. Exchange events are applied as they arrive;
//! a sell fill schedules a forced cycle after a short settle delay.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::{ReconcileOutcome, ReconcileTrigger, SharedGridEngine};
use super::ledger::LedgerEvent;
use crate::config::StrategyConfig;
use crate::error::BotError;
use crate::exchange::inbound::ExchangeEvent;

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub update_interval: Duration,
    pub sell_fill_settle: Duration,
    pub status_interval: Duration,
    pub sweep_interval: Duration,
    pub cancel_retry: Duration,
}

impl RunnerSettings {
    pub fn from_config(strategy: &StrategyConfig) -> Self {
        Self {
            update_interval: Duration::from_millis(strategy.update_interval_ms),
            sell_fill_settle: Duration::from_millis(strategy.sell_fill_settle_ms),
            status_interval: Duration::from_secs(strategy.status_log_interval_secs),
            sweep_interval: Duration::from_secs(strategy.processed_sweep_interval_secs),
            cancel_retry: Duration::from_millis(strategy.cancel_retry_ms),
        }
    }
}

/// Run one cycle unless another holder has the engine; a busy engine means
/// the trigger is dropped, the next timer tick covers it
pub fn try_reconcile(
    engine: &SharedGridEngine,
    price: Option<f64>,
    trigger: ReconcileTrigger,
) -> Option<ReconcileOutcome> {
    let Ok(mut guard) = engine.try_lock() else {
        debug!("[GRID] Engine busy, {:?} trigger skipped", trigger);
        return None;
    };

    if !guard.is_started() {
        if trigger == ReconcileTrigger::Timer {
            match guard.initial_placement(price) {
                Ok(placed) => info!("[GRID] Initial ladder placed: {} orders", placed),
                Err(BotError::NoPrice) => debug!("[GRID] Waiting for first price"),
                Err(e) => warn!("[GRID] Initial placement failed: {}", e),
            }
        }
        return None;
    }

    match guard.reconcile(price, trigger) {
        Ok(outcome) => Some(outcome),
        Err(BotError::NoPrice) => {
            info!("[GRID] No price yet, cycle skipped");
            None
        }
        Err(e) => {
            warn!("[GRID] Reconciliation failed: {}", e);
            None
        }
    }
}

pub struct GridRunner {
    engine: SharedGridEngine,
    price_rx: watch::Receiver<Option<f64>>,
    settings: RunnerSettings,
}

impl GridRunner {
    pub fn new(
        engine: SharedGridEngine,
        price_rx: watch::Receiver<Option<f64>>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            engine,
            price_rx,
            settings,
        }
    }

    fn current_price(&self) -> Option<f64> {
        *self.price_rx.borrow()
    }

    pub fn spawn(
        self,
        events_rx: mpsc::Receiver<ExchangeEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events_rx, shutdown))
    }

    pub async fn run(
        self,
        mut events_rx: mpsc::Receiver<ExchangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let s = self.settings;
        let mut reconcile_tick = tokio::time::interval(s.update_interval);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick =
            tokio::time::interval_at(Instant::now() + s.sweep_interval, s.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_tick =
            tokio::time::interval_at(Instant::now() + s.status_interval, s.status_interval);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "[GRID] Strategy running (cycle every {}ms)",
            s.update_interval.as_millis()
        );

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event, &shutdown).await,
                    None => {
                        warn!("[GRID] Event stream closed");
                        break;
                    }
                },

                _ = reconcile_tick.tick() => {
                    if let Ok(mut guard) = self.engine.try_lock() {
                        guard.ledger_mut().requeue_stale_cancels(Instant::now(), s.cancel_retry);
                    }
                    try_reconcile(&self.engine, self.current_price(), ReconcileTrigger::Timer);
                }

                _ = sweep_tick.tick() => {
                    self.engine.lock().await.ledger_mut().sweep_processed(Instant::now());
                }

                _ = status_tick.tick() => {
                    let status = self.engine.lock().await.status(self.current_price());
                    info!("[GRID] Status: {}", status);
                }

                _ = shutdown.changed() => break,
            }
        }

        info!("[GRID] Strategy stopped");
    }

    async fn handle_event(&self, event: ExchangeEvent, shutdown: &watch::Receiver<bool>) {
        if let ExchangeEvent::PriceUpdate(price) = event {
            debug!("[GRID] Price {}", price);
            return;
        }

        let notice = self.engine.lock().await.apply_event(&event);
        match notice {
            Some(LedgerEvent::BuyFilled {
                client_oid,
                price,
                size,
                sell_price,
                sell_client_oid,
            }) => {
                info!(
                    "[GRID] Buy {} filled {} @ {}, sell {} placed @ {}",
                    client_oid, size, price, sell_client_oid, sell_price
                );
            }
            Some(LedgerEvent::SellFilled {
                client_oid,
                price,
                size,
            }) => {
                info!(
                    "[GRID] Sell {} filled {} @ {}, refilling ladder",
                    client_oid, size, price
                );
                self.schedule_sell_fill_cycle(shutdown.clone());
            }
            None => {}
        }
    }

    /// Forced cycle after the settle delay, dropped if shutdown comes first
    fn schedule_sell_fill_cycle(&self, mut shutdown: watch::Receiver<bool>) {
        let engine = self.engine.clone();
        let price_rx = self.price_rx.clone();
        let settle = self.settings.sell_fill_settle;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            let price = *price_rx.borrow();
            try_reconcile(&engine, price, ReconcileTrigger::SellFill);
        });
    }
}
