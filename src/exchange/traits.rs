//! Exchange seams
//!
//! The batching queue only needs "can I send now" and "send this frame";
//! the live private channel implements both, tests use a recorder.

use async_trait::async_trait;

use crate::error::BotResult;

// ======================= TRAITS =======================

/// Outbound text sink for trade commands
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Channel is connected and authenticated
    fn is_ready(&self) -> bool;

    /// Send one serialized frame
    async fn send(&self, text: String) -> BotResult<()>;
}
