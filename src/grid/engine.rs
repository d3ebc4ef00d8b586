//! Grid Reconciliation Engine
//!
//! Keeps a ladder of `max_levels` buys under the price. Each cycle:
//! 1. shift the ladder up when the base rose (or after a sell fill), within
//!    the order budget, swapping far orders for near levels at a 50% margin
//!    when the budget cut candidates;
//! 2. fill holes by swapping the farthest buy for the nearest empty level.
//!
//! A level is never filled while a sell rests one step above it.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ladder::GridParams;
use super::ledger::{LedgerEvent, Order, OrderLedger};
use crate::error::{BotError, BotResult};
use crate::exchange::inbound::ExchangeEvent;
use crate::exchange::types::Side;

/// A farther order must be this much farther than the level it moves to
const SWAP_MARGIN: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    /// Periodic timer: shift only when the base rose
    Timer,
    /// After a sell fill: always run the shift to refill the freed slot
    SellFill,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub shifted: bool,
    pub cancelled: usize,
    pub placed: usize,
    /// Pairs moved by the 50% rule or hole filling
    pub swapped: usize,
}

/// Snapshot for status logging
#[derive(Debug, Clone, PartialEq)]
pub struct GridStatus {
    pub price: Option<f64>,
    pub base: Option<f64>,
    pub buys: usize,
    pub sells: usize,
    /// Tracked orders with a cancel in flight
    pub cancelling: usize,
    /// Time since the last placement or cycle
    pub idle: Option<Duration>,
}

impl fmt::Display for GridStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |p| format!("{:.2}", p));
        let idle = self.idle.map_or_else(|| "-".to_string(), |d| format!("{}s", d.as_secs()));
        write!(
            f,
            "price={} base={} buys={} sells={} total={} cancelling={} idle={}",
            show(self.price),
            show(self.base),
            self.buys,
            self.sells,
            self.buys + self.sells,
            self.cancelling,
            idle
        )
    }
}

/// Buy order with its distance to the current price
struct Ranked {
    client_oid: String,
    distance: f64,
}

fn by_distance(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

pub struct GridEngine {
    params: GridParams,
    ledger: OrderLedger,
    last_base_price: Option<f64>,
    last_price: Option<f64>,
    last_update_at: Option<Instant>,
}

pub type SharedGridEngine = Arc<Mutex<GridEngine>>;

impl GridEngine {
    pub fn new(params: GridParams, ledger: OrderLedger) -> Self {
        Self {
            params,
            ledger,
            last_base_price: None,
            last_price: None,
            last_update_at: None,
        }
    }

    pub fn into_shared(self) -> SharedGridEngine {
        Arc::new(Mutex::new(self))
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut OrderLedger {
        &mut self.ledger
    }

    /// Initial ladder has been placed
    pub fn is_started(&self) -> bool {
        self.last_base_price.is_some()
    }

    #[cfg(test)]
    pub fn last_base_price(&self) -> Option<f64> {
        self.last_base_price
    }

    pub fn generate_ideal_ladder(&self, price: f64) -> Vec<f64> {
        self.params.ideal_ladder(price)
    }

    /// Route an exchange event into the ledger
    pub fn apply_event(&mut self, event: &ExchangeEvent) -> Option<LedgerEvent> {
        self.ledger.apply(event)
    }

    pub fn status(&self, price: Option<f64>) -> GridStatus {
        GridStatus {
            price: price.or(self.last_price),
            base: self.last_base_price,
            buys: self.ledger.active_buy_count(),
            sells: self.ledger.active_sell_count(),
            cancelling: self.ledger.active_count() - self.ledger.committed_count(),
            idle: self.last_update_at.map(|at| at.elapsed()),
        }
    }

    /// Place the full ideal ladder as one bulk buy batch
    pub fn initial_placement(&mut self, price: Option<f64>) -> BotResult<usize> {
        let price = price.ok_or(BotError::NoPrice)?;
        let base = self.params.base_price(price);
        let ladder = self.generate_ideal_ladder(price);

        info!(
            "[GRID] Initial ladder at price {} (base {}): {} levels",
            price,
            base,
            ladder.len()
        );
        let placed = self.place_buys(&ladder);

        self.last_base_price = Some(base);
        self.last_price = Some(price);
        self.last_update_at = Some(Instant::now());
        Ok(placed)
    }

    /// One reconciliation cycle against the given price
    pub fn reconcile(
        &mut self,
        price: Option<f64>,
        trigger: ReconcileTrigger,
    ) -> BotResult<ReconcileOutcome> {
        let price = price.ok_or(BotError::NoPrice)?;
        let base = self.params.base_price(price);
        let mut outcome = ReconcileOutcome::default();

        let base_rose = self
            .last_base_price
            .is_some_and(|last| self.params.key(base) > self.params.key(last));

        if base_rose || trigger == ReconcileTrigger::SellFill {
            if base_rose {
                info!(
                    "[GRID] Base rose to {} (was {:?}), shifting ladder",
                    base, self.last_base_price
                );
            } else {
                debug!("[GRID] Forced shift after sell fill at base {}", base);
            }
            self.shift_up(price, base, &mut outcome);
            outcome.shifted = true;
            if self.last_base_price.map_or(true, |last| base > last) {
                self.last_base_price = Some(base);
            }
        }

        self.fill_holes(price, &mut outcome);

        self.last_update_at = Some(Instant::now());
        self.last_price = Some(price);

        if outcome.cancelled + outcome.placed > 0 {
            info!(
                "[GRID] Cycle ({:?}) @ {}: shifted {}, cancelled {}, placed {}, swapped {}",
                trigger, price, outcome.shifted, outcome.cancelled, outcome.placed, outcome.swapped
            );
        }
        Ok(outcome)
    }

    fn place_buys(&mut self, prices: &[f64]) -> usize {
        let levels: Vec<(f64, f64)> = prices
            .iter()
            .map(|&p| (p, self.params.order_size(p)))
            .collect();
        self.ledger.place_bulk_orders(Side::Buy, &levels).len()
    }

    /// Ideal level is free: no buy on it and no sell one step above
    fn is_open_level(&self, level: f64, occupied: &HashSet<i64>) -> bool {
        !occupied.contains(&self.params.key(level))
            && !self.ledger.has_sell_at(self.params.sell_price_for(level))
    }

    fn ranked(&self, orders: &[Order], price: f64) -> Vec<Ranked> {
        orders
            .iter()
            .map(|o| Ranked {
                client_oid: o.client_oid.clone(),
                distance: (price - o.price).abs(),
            })
            .collect()
    }

    /// Cancel buys that fell out of the ladder and add the nearest missing
    /// levels the budget allows
    fn shift_up(&mut self, price: f64, base: f64, outcome: &mut ReconcileOutcome) {
        let ideal = self.generate_ideal_ladder(base);
        let ideal_keys: HashSet<i64> = ideal.iter().map(|&p| self.params.key(p)).collect();

        let buys = self.ledger.active_buy_orders();
        let sell_count = self.ledger.active_sell_count();
        let occupied: HashSet<i64> = buys.iter().map(|o| self.params.key(o.price)).collect();

        let to_cancel: Vec<String> = buys
            .iter()
            .filter(|o| !ideal_keys.contains(&self.params.key(o.price)))
            .map(|o| o.client_oid.clone())
            .collect();

        let mut candidates: Vec<f64> = ideal
            .iter()
            .copied()
            .filter(|&level| self.is_open_level(level, &occupied))
            .collect();
        candidates.sort_by(|a, b| by_distance((price - a).abs(), (price - b).abs()));

        let committed = (buys.len() + sell_count).saturating_sub(to_cancel.len());
        let available = self.params.max_levels.saturating_sub(committed);
        let budget_cut = candidates.len() > available;
        let unfilled = candidates.split_off(available.min(candidates.len()));

        if !to_cancel.is_empty() {
            info!("[GRID] Cancelling {} buys below the new ladder", to_cancel.len());
            outcome.cancelled += self.ledger.cancel_bulk_orders(&to_cancel);
        }
        if !candidates.is_empty() {
            info!("[GRID] Adding {} levels (slots available {})", candidates.len(), available);
            outcome.placed += self.place_buys(&candidates);
        }

        if budget_cut {
            let keep: Vec<Order> = buys
                .into_iter()
                .filter(|o| !o.cancel_requested() && !to_cancel.contains(&o.client_oid))
                .collect();
            self.swap_far_orders(price, &unfilled, &keep, outcome);
        }
    }

    /// Move the farthest remaining buys onto unfilled levels while the order
    /// is at least 50% farther from the price than the level
    fn swap_far_orders(
        &mut self,
        price: f64,
        unfilled: &[f64],
        buys: &[Order],
        outcome: &mut ReconcileOutcome,
    ) {
        let mut movable = self.ranked(buys, price);
        movable.sort_by(|a, b| by_distance(b.distance, a.distance));
        let mut movable = movable.into_iter();

        let mut cancels = Vec::new();
        let mut places = Vec::new();
        let mut far = movable.next();

        for &level in unfilled {
            let Some(order) = far.as_ref() else { break };
            let level_distance = (price - level).abs();
            if order.distance > 0.0 && order.distance >= level_distance * SWAP_MARGIN {
                cancels.push(order.client_oid.clone());
                places.push(level);
                far = movable.next();
            } else {
                // Levels only get farther from here on
                break;
            }
        }

        if !cancels.is_empty() {
            info!("[GRID] Swapping {} far buys onto nearer levels", cancels.len());
            outcome.cancelled += self.ledger.cancel_bulk_orders(&cancels);
            outcome.placed += self.place_buys(&places);
            outcome.swapped += places.len();
        }
    }

    /// Swap the farthest buys for the nearest empty ladder levels; never
    /// changes the number of resting orders
    fn fill_holes(&mut self, price: f64, outcome: &mut ReconcileOutcome) {
        let ideal = self.generate_ideal_ladder(price);
        let buys = self.ledger.active_buy_orders();
        let occupied: HashSet<i64> = buys.iter().map(|o| self.params.key(o.price)).collect();

        let mut holes: Vec<f64> = ideal
            .iter()
            .copied()
            .filter(|&level| self.is_open_level(level, &occupied))
            .collect();
        if holes.is_empty() {
            return;
        }
        holes.sort_by(|a, b| by_distance((price - a).abs(), (price - b).abs()));

        let movable_orders: Vec<Order> =
            buys.into_iter().filter(|o| !o.cancel_requested()).collect();
        let mut movable = self.ranked(&movable_orders, price);
        movable.sort_by(|a, b| by_distance(b.distance, a.distance));
        let mut movable = movable.into_iter().peekable();

        let mut cancels = Vec::new();
        let mut places = Vec::new();
        for hole in holes {
            let Some(far) = movable.peek() else { break };
            if far.distance > (price - hole).abs() {
                cancels.push(far.client_oid.clone());
                places.push(hole);
                movable.next();
            }
        }

        if !cancels.is_empty() {
            info!("[GRID] Moving {} buys into ladder holes", cancels.len());
            outcome.cancelled += self.ledger.cancel_bulk_orders(&cancels);
            outcome.placed += self.place_buys(&places);
            outcome.swapped += places.len();
        }
    }
}
