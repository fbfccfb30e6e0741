//! Offline-first operation queue for a point-of-sale client.
//!
//! Side-effecting requests are persisted locally before they are sent, then
//! replayed against the commerce API with idempotency keys so a retry can
//! never double-apply a sale or a stock adjustment. Reference data is served
//! from a read-through cache while the network is down.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod peripherals;
pub mod queue;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
