//! Outbound trade command queue
//!
//! Three FIFO lanes drained strictly cancel → sell → buy, at most
//! `max_batch` commands per flush. Flushing is periodic and gated on the
//! private channel being authenticated; while it is not, commands pile up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::OutboundSink;
use super::types::{Side, TradeMessage};
use crate::error::BotResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    PlaceOrder,
    CancelOrder,
}

/// Priority lane, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Cancel,
    Sell,
    Buy,
}

/// A queued trade command; immutable once enqueued
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub kind: CommandKind,
    pub lane: Lane,
    pub client_oid: String,
    pub payload: TradeMessage,
}

impl OutboundCommand {
    pub fn place(
        inst_type: &str,
        inst_id: &str,
        side: Side,
        price: String,
        size: String,
        client_oid: String,
    ) -> Self {
        let lane = match side {
            Side::Buy => Lane::Buy,
            Side::Sell => Lane::Sell,
        };
        Self {
            kind: CommandKind::PlaceOrder,
            lane,
            payload: TradeMessage::place(inst_type, inst_id, side, price, size, client_oid.clone()),
            client_oid,
        }
    }

    pub fn cancel(inst_type: &str, inst_id: &str, client_oid: String) -> Self {
        Self {
            kind: CommandKind::CancelOrder,
            lane: Lane::Cancel,
            payload: TradeMessage::cancel(inst_type, inst_id, client_oid.clone()),
            client_oid,
        }
    }

    pub fn to_wire(&self) -> BotResult<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

#[derive(Debug, Default)]
struct Lanes {
    cancel: VecDeque<OutboundCommand>,
    sell: VecDeque<OutboundCommand>,
    buy: VecDeque<OutboundCommand>,
}

impl Lanes {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<OutboundCommand> {
        match lane {
            Lane::Cancel => &mut self.cancel,
            Lane::Sell => &mut self.sell,
            Lane::Buy => &mut self.buy,
        }
    }

    fn len(&self) -> usize {
        self.cancel.len() + self.sell.len() + self.buy.len()
    }
}

/// Consecutive skipped ticks between "still holding" warnings
const HELD_WARN_TICKS: u32 = 100;

/// Result of one flush attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    /// Skipped: sink not ready or another flush in progress
    pub skipped: bool,
}

/// Clears the flushing flag when a flush ends, however it ends
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CommandQueue {
    lanes: Mutex<Lanes>,
    flushing: AtomicBool,
    max_batch: usize,
}

pub type SharedCommandQueue = Arc<CommandQueue>;

impl CommandQueue {
    pub fn new(max_batch: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            flushing: AtomicBool::new(false),
            max_batch: max_batch.max(1),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, cmd: OutboundCommand) {
        debug!("[QUEUE] + {:?} {} ({:?} lane)", cmd.kind, cmd.client_oid, cmd.lane);
        self.lanes().lane_mut(cmd.lane).push_back(cmd);
    }

    pub fn len(&self) -> usize {
        self.lanes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn lane_len(&self, lane: Lane) -> usize {
        self.lanes().lane_mut(lane).len()
    }

    /// Take up to `max_batch` commands, cancels first, then sells, then buys
    pub fn drain_batch(&self) -> Vec<OutboundCommand> {
        let mut lanes = self.lanes();
        let mut batch = Vec::with_capacity(self.max_batch.min(lanes.len()));

        for lane in [Lane::Cancel, Lane::Sell, Lane::Buy] {
            let queue = lanes.lane_mut(lane);
            while batch.len() < self.max_batch {
                match queue.pop_front() {
                    Some(cmd) => batch.push(cmd),
                    None => break,
                }
            }
        }
        batch
    }

    /// Send one batch; each send failure is logged and the rest still go out
    pub async fn flush(&self, sink: &dyn OutboundSink) -> FlushReport {
        if !sink.is_ready() {
            let pending = self.len();
            if pending > 0 {
                debug!("[QUEUE] Channel not ready, holding {} commands", pending);
            }
            return FlushReport { skipped: true, ..Default::default() };
        }

        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[QUEUE] Flush already in progress");
            return FlushReport { skipped: true, ..Default::default() };
        }
        let _guard = FlushGuard(&self.flushing);

        let batch = self.drain_batch();
        if batch.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        for cmd in batch {
            let result = match cmd.to_wire() {
                Ok(text) => sink.send(text).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("[QUEUE] {:?} {} failed: {}", cmd.kind, cmd.client_oid, e);
                }
            }
        }

        let remaining = self.len();
        info!(
            "[QUEUE] Flushed {} commands ({} failed), {} remaining",
            report.sent, report.failed, remaining
        );
        report
    }

    /// Periodic flush task, stopped by the shutdown watch
    pub fn spawn_flusher(
        self: &Arc<Self>,
        sink: Arc<dyn OutboundSink>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut held_ticks: u32 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = queue.flush(sink.as_ref()).await;
                        if report.skipped && !queue.is_empty() {
                            held_ticks += 1;
                            if held_ticks % HELD_WARN_TICKS == 0 {
                                warn!(
                                    "[QUEUE] {} commands held for {} ticks",
                                    queue.len(),
                                    held_ticks
                                );
                            }
                        } else {
                            held_ticks = 0;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            let left = queue.len();
            if left > 0 {
                warn!("[QUEUE] Flusher stopped with {} commands unsent", left);
            } else {
                info!("[QUEUE] Flusher stopped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::traits::mock::RecordingSink;

    fn place(side: Side, oid: &str) -> OutboundCommand {
        let (price, size) = ("100.00".to_string(), "0.020000".to_string());
        OutboundCommand::place("SPOT", "BTCUSDT", side, price, size, oid.into())
    }

    fn cancel(oid: &str) -> OutboundCommand {
        OutboundCommand::cancel("SPOT", "BTCUSDT", oid.into())
    }

    fn oids(batch: &[OutboundCommand]) -> Vec<&str> {
        batch.iter().map(|c| c.client_oid.as_str()).collect()
    }

    #[test]
    fn test_lane_assignment() {
        assert_eq!(place(Side::Buy, "b").lane, Lane::Buy);
        assert_eq!(place(Side::Sell, "s").lane, Lane::Sell);
        let c = cancel("c");
        assert_eq!(c.lane, Lane::Cancel);
        assert_eq!(c.kind, CommandKind::CancelOrder);
    }

    #[test]
    fn test_drain_priority_and_fifo() {
        let queue = CommandQueue::new(3);
        queue.enqueue(place(Side::Buy, "buy_1"));
        queue.enqueue(place(Side::Sell, "sell_1"));
        queue.enqueue(cancel("buy_x"));
        queue.enqueue(place(Side::Buy, "buy_2"));
        queue.enqueue(cancel("buy_y"));

        assert_eq!(oids(&queue.drain_batch()), vec!["buy_x", "buy_y", "sell_1"]);
        assert_eq!(oids(&queue.drain_batch()), vec!["buy_1", "buy_2"]);
        assert!(queue.drain_batch().is_empty());
    }

    #[test]
    fn test_batch_cap_leaves_remainder() {
        let queue = CommandQueue::new(49);
        for i in 0..60 {
            queue.enqueue(place(Side::Buy, &format!("buy_{}", i)));
        }
        assert_eq!(queue.drain_batch().len(), 49);
        assert_eq!(queue.len(), 11);
        let rest = queue.drain_batch();
        assert_eq!(rest.first().map(|c| c.client_oid.as_str()), Some("buy_49"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wire_payload() {
        let text = place(Side::Sell, "sell_1").to_wire().unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["args"][0]["channel"], "place-order");
        assert_eq!(v["args"][0]["params"]["clientOid"], "sell_1");
    }

    #[tokio::test]
    async fn test_flush_waits_for_ready_sink() {
        let queue = CommandQueue::new(10);
        let sink = RecordingSink::default();
        queue.enqueue(place(Side::Buy, "buy_1"));

        let report = queue.flush(&sink).await;
        assert!(report.skipped);
        assert!(sink.sent().is_empty());
        assert_eq!(queue.len(), 1);

        sink.set_ready(true);
        let report = queue.flush(&sink).await;
        assert_eq!(report.sent, 1);
        assert_eq!(sink.sent().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_continues_past_failures() {
        let queue = CommandQueue::new(10);
        let sink = RecordingSink::ready();
        sink.poison("buy_2");

        queue.enqueue(place(Side::Buy, "buy_1"));
        queue.enqueue(place(Side::Buy, "buy_2"));
        queue.enqueue(place(Side::Buy, "buy_3"));

        let report = queue.flush(&sink).await;
        assert_eq!(report, FlushReport { sent: 2, failed: 1, skipped: false });

        let sent = sink.sent();
        assert!(sent[0].contains("buy_1"));
        assert!(sent[1].contains("buy_3"));
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_skipped() {
        let queue = CommandQueue::new(10);
        let sink = RecordingSink::ready();
        queue.enqueue(cancel("buy_1"));

        queue.flushing.store(true, Ordering::SeqCst);
        assert!(queue.flush(&sink).await.skipped);
        assert_eq!(queue.len(), 1);

        queue.flushing.store(false, Ordering::SeqCst);
        assert_eq!(queue.flush(&sink).await.sent, 1);
        assert!(!queue.flushing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_flusher_task_drains_and_stops() {
        let queue: SharedCommandQueue = Arc::new(CommandQueue::new(2));
        let sink = Arc::new(RecordingSink::ready());
        for i in 0..5 {
            queue.enqueue(place(Side::Buy, &format!("buy_{}", i)));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = queue.spawn_flusher(sink.clone(), Duration::from_millis(10), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.sent().len(), 5);
        assert!(queue.is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
