//! Order Ledger
//!
//! Tracks resting buy and sell orders by client id. Local state is the
//! optimistic view: orders are recorded as soon as their place command is
//! queued, and only leave the book when the exchange reports a terminal
//! event (fill or cancel). Terminal events are applied at most once per
//! (client id, status) thanks to the processed-event registry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ladder::GridParams;
use crate::exchange::command_queue::{OutboundCommand, SharedCommandQueue};
use crate::exchange::inbound::{CancelNotice, ExchangeEvent, FillNotice, OrderUpdate};
use crate::exchange::types::{Side, new_client_oid};

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Place command queued, no exchange acknowledgement yet
    Pending,
    Active,
}

/// Tracked order
#[derive(Debug, Clone)]
pub struct Order {
    pub client_oid: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub status: OrderStatus,
    pub created_at: Instant,
    /// When the last cancel command for it was queued
    pub cancel_requested_at: Option<Instant>,
}

impl Order {
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }
}

/// Terminal status a processed-event record is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Filled,
    Cancelled,
}

/// Notification raised to the strategy after a fill is applied
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    BuyFilled {
        client_oid: String,
        price: f64,
        size: f64,
        sell_price: f64,
        sell_client_oid: String,
    },
    SellFilled {
        client_oid: String,
        price: f64,
        size: f64,
    },
}

pub struct OrderLedger {
    params: GridParams,
    inst_type: String,
    symbol: String,
    queue: SharedCommandQueue,
    buys: HashMap<String, Order>,
    sells: HashMap<String, Order>,
    processed: HashMap<(String, TerminalStatus), Instant>,
    retention: Duration,
}

impl OrderLedger {
    pub fn new(
        params: GridParams,
        inst_type: &str,
        symbol: &str,
        queue: SharedCommandQueue,
        retention: Duration,
    ) -> Self {
        Self {
            params,
            inst_type: inst_type.to_string(),
            symbol: symbol.to_string(),
            queue,
            buys: HashMap::new(),
            sells: HashMap::new(),
            processed: HashMap::new(),
            retention,
        }
    }

    fn book(&self, side: Side) -> &HashMap<String, Order> {
        match side {
            Side::Buy => &self.buys,
            Side::Sell => &self.sells,
        }
    }

    fn book_mut(&mut self, side: Side) -> &mut HashMap<String, Order> {
        match side {
            Side::Buy => &mut self.buys,
            Side::Sell => &mut self.sells,
        }
    }

    // ======================= COMMANDS =======================

    /// Record a Pending order and queue its place command
    pub fn place_order(&mut self, side: Side, price: f64, size: f64) -> String {
        let client_oid = new_client_oid(side);
        let price = self.params.round_price(price);

        self.queue.enqueue(OutboundCommand::place(
            &self.inst_type,
            &self.symbol,
            side,
            self.params.format_price(price),
            self.params.format_size(size),
            client_oid.clone(),
        ));
        self.book_mut(side).insert(
            client_oid.clone(),
            Order {
                client_oid: client_oid.clone(),
                side,
                price,
                size,
                status: OrderStatus::Pending,
                created_at: Instant::now(),
                cancel_requested_at: None,
            },
        );

        debug!("[LEDGER] {} {} @ {} size {} queued", side, client_oid, price, size);
        client_oid
    }

    /// Queue a cancel; the order stays tracked until the cancel is confirmed.
    /// Returns false when a cancel for it is already in flight.
    pub fn cancel_order(&mut self, client_oid: &str) -> bool {
        let tracked = self
            .buys
            .get_mut(client_oid)
            .or_else(|| self.sells.get_mut(client_oid));

        let now = Instant::now();
        match tracked {
            Some(order) if order.cancel_requested() => {
                debug!("[LEDGER] Cancel for {} already in flight", client_oid);
                return false;
            }
            Some(order) => {
                order.cancel_requested_at = Some(now);
                debug!(
                    "[LEDGER] Cancelling {} after {:.1}s resting",
                    client_oid,
                    now.saturating_duration_since(order.created_at).as_secs_f64()
                );
            }
            None => debug!("[LEDGER] Cancelling untracked order {}", client_oid),
        }

        self.enqueue_cancel(client_oid);
        true
    }

    fn enqueue_cancel(&self, client_oid: &str) {
        self.queue.enqueue(OutboundCommand::cancel(
            &self.inst_type,
            &self.symbol,
            client_oid.to_string(),
        ));
    }

    /// Re-queue cancels still unconfirmed after `after`. A cancel frame can be
    /// lost to a reconnect or a failed send, and the order would otherwise
    /// stay excluded from the grid forever.
    pub fn requeue_stale_cancels(&mut self, now: Instant, after: Duration) -> usize {
        let stale: Vec<String> = self
            .buys
            .values_mut()
            .chain(self.sells.values_mut())
            .filter_map(|order| {
                let requested_at = order.cancel_requested_at?;
                if now.saturating_duration_since(requested_at) < after {
                    return None;
                }
                order.cancel_requested_at = Some(now);
                Some(order.client_oid.clone())
            })
            .collect();

        for client_oid in &stale {
            warn!("[LEDGER] Cancel for {} unconfirmed, re-sending", client_oid);
            self.enqueue_cancel(client_oid);
        }
        stale.len()
    }

    /// `(price, size)` pairs, one place command each
    pub fn place_bulk_orders(&mut self, side: Side, levels: &[(f64, f64)]) -> Vec<String> {
        let ids: Vec<String> = levels
            .iter()
            .map(|&(price, size)| self.place_order(side, price, size))
            .collect();
        if !ids.is_empty() {
            info!("[LEDGER] {} {} orders queued", ids.len(), side);
        }
        ids
    }

    pub fn cancel_bulk_orders(&mut self, client_oids: &[String]) -> usize {
        let queued = client_oids.iter().filter(|id| self.cancel_order(id)).count();
        if queued > 0 {
            info!("[LEDGER] {} cancels queued", queued);
        }
        queued
    }

    pub fn calculate_order_size(&self, price: f64) -> f64 {
        self.params.order_size(price)
    }

    // ======================= EVENTS =======================

    fn already_processed(&self, client_oid: &str, status: TerminalStatus) -> bool {
        self.processed.contains_key(&(client_oid.to_string(), status))
    }

    fn mark_processed(&mut self, client_oid: &str, status: TerminalStatus) {
        self.processed.insert((client_oid.to_string(), status), Instant::now());
    }

    /// Apply any exchange event; fills return a strategy notification
    pub fn apply(&mut self, event: &ExchangeEvent) -> Option<LedgerEvent> {
        match event {
            ExchangeEvent::BuyFilled(fill) => self.on_buy_filled(fill),
            ExchangeEvent::SellFilled(fill) => self.on_sell_filled(fill),
            ExchangeEvent::OrderCancelled(cancel) => {
                self.on_order_cancelled(cancel);
                None
            }
            ExchangeEvent::OrderUpdate(update) => {
                self.on_order_update(update);
                None
            }
            ExchangeEvent::PriceUpdate(_) => None,
        }
    }

    /// Remove the buy and place its paired sell one step above
    pub fn on_buy_filled(&mut self, fill: &FillNotice) -> Option<LedgerEvent> {
        if self.already_processed(&fill.client_oid, TerminalStatus::Filled) {
            info!("[LEDGER] Duplicate fill for {} ignored", fill.client_oid);
            return None;
        }

        let tracked = self.buys.remove(&fill.client_oid);
        if tracked.is_none() {
            info!("[LEDGER] Fill for untracked buy {}", fill.client_oid);
        }
        let size = if fill.size > 0.0 {
            fill.size
        } else {
            tracked
                .map(|o| o.size)
                .unwrap_or_else(|| self.calculate_order_size(fill.price))
        };

        let sell_price = self.params.sell_price_for(fill.price);
        let sell_client_oid = self.place_order(Side::Sell, sell_price, size);
        self.mark_processed(&fill.client_oid, TerminalStatus::Filled);

        info!(
            "[LEDGER] Buy {} filled @ {} size {} -> sell @ {}",
            fill.client_oid, fill.price, size, sell_price
        );
        Some(LedgerEvent::BuyFilled {
            client_oid: fill.client_oid.clone(),
            price: fill.price,
            size,
            sell_price,
            sell_client_oid,
        })
    }

    /// Remove the sell; no order is placed in its place
    pub fn on_sell_filled(&mut self, fill: &FillNotice) -> Option<LedgerEvent> {
        if self.already_processed(&fill.client_oid, TerminalStatus::Filled) {
            info!("[LEDGER] Duplicate fill for {} ignored", fill.client_oid);
            return None;
        }

        if self.sells.remove(&fill.client_oid).is_none() {
            info!("[LEDGER] Fill for untracked sell {}", fill.client_oid);
        }
        self.mark_processed(&fill.client_oid, TerminalStatus::Filled);

        info!("[LEDGER] Sell {} filled @ {} size {}", fill.client_oid, fill.price, fill.size);
        Some(LedgerEvent::SellFilled {
            client_oid: fill.client_oid.clone(),
            price: fill.price,
            size: fill.size,
        })
    }

    /// Returns true when a tracked order was removed
    pub fn on_order_cancelled(&mut self, cancel: &CancelNotice) -> bool {
        if self.already_processed(&cancel.client_oid, TerminalStatus::Cancelled) {
            info!("[LEDGER] Duplicate cancel for {} ignored", cancel.client_oid);
            return false;
        }

        let removed = match cancel.side {
            Some(side) => self.book_mut(side).remove(&cancel.client_oid),
            None => {
                warn!("[LEDGER] Cancel for {} without side", cancel.client_oid);
                None
            }
        };
        self.mark_processed(&cancel.client_oid, TerminalStatus::Cancelled);

        match &removed {
            Some(order) => info!(
                "[LEDGER] {} {} @ {} cancelled",
                order.side, order.client_oid, order.price
            ),
            None => debug!(
                "[LEDGER] Cancel for untracked order {} @ {:?}",
                cancel.client_oid, cancel.price
            ),
        }
        removed.is_some()
    }

    /// Exchange acknowledgement: Pending -> Active
    pub fn on_order_update(&mut self, update: &OrderUpdate) {
        let Some(client_oid) = update.client_oid.as_deref() else {
            return;
        };
        let live = matches!(
            update.status.as_deref(),
            Some("live") | Some("new") | Some("partially_filled") | Some("partial-fill")
        );
        if !live {
            return;
        }
        let tracked = match Side::from_client_oid(client_oid) {
            Some(side) => self.book_mut(side).get_mut(client_oid),
            None => None,
        };
        if let Some(order) = tracked {
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Active;
                debug!("[LEDGER] {} acknowledged", client_oid);
            }
        }
    }

    /// Drop processed-event records older than the retention window
    pub fn sweep_processed(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.processed.len();
        self.processed
            .retain(|_, observed_at| now.saturating_duration_since(*observed_at) < retention);
        let removed = before - self.processed.len();
        if removed > 0 {
            info!(
                "[LEDGER] Swept {} processed-event records ({} kept)",
                removed,
                self.processed.len()
            );
        }
        removed
    }

    #[cfg(test)]
    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    // ======================= QUERIES =======================

    pub fn active_buy_orders(&self) -> Vec<Order> {
        self.buys.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn active_sell_orders(&self) -> Vec<Order> {
        self.sells.values().cloned().collect()
    }

    pub fn active_buy_count(&self) -> usize {
        self.buys.len()
    }

    pub fn active_sell_count(&self) -> usize {
        self.sells.len()
    }

    pub fn active_count(&self) -> usize {
        self.buys.len() + self.sells.len()
    }

    /// Orders expected to keep resting: tracked and not being cancelled
    pub fn committed_count(&self) -> usize {
        self.buys
            .values()
            .chain(self.sells.values())
            .filter(|o| !o.cancel_requested())
            .count()
    }

    #[cfg(test)]
    pub fn get(&self, client_oid: &str) -> Option<&Order> {
        self.buys.get(client_oid).or_else(|| self.sells.get(client_oid))
    }

    fn order_at(&self, side: Side, price: f64) -> Option<&Order> {
        let key = self.params.key(price);
        self.book(side).values().find(|o| self.params.key(o.price) == key)
    }

    #[cfg(test)]
    pub fn buy_order_at(&self, price: f64) -> Option<&Order> {
        self.order_at(Side::Buy, price)
    }

    #[cfg(test)]
    pub fn has_buy_at(&self, price: f64) -> bool {
        self.buy_order_at(price).is_some()
    }

    pub fn sell_order_at(&self, price: f64) -> Option<&Order> {
        self.order_at(Side::Sell, price)
    }

    pub fn has_sell_at(&self, price: f64) -> bool {
        self.sell_order_at(price).is_some()
    }
}
