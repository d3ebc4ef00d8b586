//! Grid strategy: price math, order ledger, reconciliation engine and the
//! event loop that drives them.

pub mod engine;
pub mod ladder;
pub mod ledger;
pub mod runner;

pub use engine::GridEngine;
pub use ladder::GridParams;
pub use ledger::OrderLedger;
pub use runner::{GridRunner, RunnerSettings};
