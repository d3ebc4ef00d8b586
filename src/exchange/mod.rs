//! Bitget Exchange Layer
//!
//! Public ticker feed and private order channel over WebSocket, plus the
//! batching queue trade commands go through.

pub mod auth;
pub mod command_queue;
pub mod connection;
pub mod inbound;
pub mod traits;
pub mod types;

pub use auth::BitgetAuth;
pub use command_queue::CommandQueue;
pub use connection::{ChannelConfig, connect};
pub use traits::OutboundSink;
