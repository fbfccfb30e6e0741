//! Receipt printer transports and capability negotiation.
//!
//! Optional subsystems are probed once at startup. Each probe yields a
//! `Result<_, UnavailableReason>` so the caller can show exactly what is
//! missing instead of silently dropping receipts on the floor.

mod capabilities;
mod printer;

use serde::Deserialize;
use thiserror::Error;

pub use capabilities::{Capabilities, RemoteStatus};
pub use printer::{PrinterTransport, Receipt};

/// Printer selection from the config file.
///
/// ```yaml
/// printer:
///   kind: network
///   address: 192.168.1.50:9100
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PrinterConfig {
  #[default]
  None,
  /// Raw ESC/POS over TCP (usually port 9100)
  Network { address: String },
  Usb { device: String },
  Bluetooth { address: String },
}

/// Why a subsystem cannot be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnavailableReason {
  #[error("not configured")]
  NotConfigured,
  #[error("{0} is not supported on this platform")]
  Unsupported(&'static str),
  #[error("{0}")]
  Failed(String),
}
