use tracing::{info, warn};

use crate::api::{ApiRequest, Remote};
use crate::db::{Database, QueueCounts};

use super::{PrinterConfig, PrinterTransport, UnavailableReason};

/// The remote answered the probe; any HTTP status counts as reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStatus {
  pub status: u16,
}

/// What is usable right now. Nothing here is replaced by a no-op: a missing
/// subsystem carries the reason it is missing.
#[derive(Debug)]
pub struct Capabilities {
  pub store: Result<QueueCounts, UnavailableReason>,
  pub remote: Result<RemoteStatus, UnavailableReason>,
  pub printer: Result<PrinterTransport, UnavailableReason>,
}

impl Capabilities {
  /// Probe the store, the remote and the printer.
  ///
  /// `remote` is `None` when no client could be built (e.g. no token). The
  /// remote and printer probes run concurrently.
  pub async fn negotiate<R: Remote>(
    db: &Database,
    remote: Option<&R>,
    probe: &ApiRequest,
    printer: &PrinterConfig,
  ) -> Self {
    let store = db
      .queue_counts()
      .map_err(|e| UnavailableReason::Failed(e.to_string()));

    let remote_probe = async {
      let remote = remote.ok_or(UnavailableReason::NotConfigured)?;
      remote
        .execute(probe)
        .await
        .map(|response| RemoteStatus {
          status: response.status,
        })
        .map_err(|e| UnavailableReason::Failed(e.to_string()))
    };

    let printer_probe = async {
      let mut transport = PrinterTransport::from_config(printer);
      transport.open().await.map(|()| transport)
    };

    let (remote, printer) = futures::future::join(remote_probe, printer_probe).await;

    let capabilities = Self {
      store,
      remote,
      printer,
    };
    capabilities.log();
    capabilities
  }

  /// True when queued operations can be replayed right now.
  pub fn can_sync(&self) -> bool {
    self.store.is_ok() && self.remote.is_ok()
  }

  fn log(&self) {
    for (name, reason) in [
      ("store", self.store.as_ref().err()),
      ("remote", self.remote.as_ref().err()),
      ("printer", self.printer.as_ref().err()),
    ] {
      match reason {
        Some(reason) => warn!(subsystem = name, %reason, "subsystem unavailable"),
        None => info!(subsystem = name, "subsystem available"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{Scripted, ScriptedRemote};

  #[tokio::test]
  async fn test_failures_are_reported_not_masked() {
    let db = Database::open_in_memory().unwrap();
    let remote = ScriptedRemote::new();
    remote.script("/health", [Scripted::Transport]);

    let caps = Capabilities::negotiate(
      &db,
      Some(&remote),
      &ApiRequest::get("/health"),
      &PrinterConfig::None,
    )
    .await;

    assert_eq!(caps.store, Ok(QueueCounts::default()));
    assert!(matches!(caps.remote, Err(UnavailableReason::Failed(_))));
    assert!(matches!(caps.printer, Err(UnavailableReason::NotConfigured)));
    assert!(!caps.can_sync());
  }

  #[tokio::test]
  async fn test_any_http_status_counts_as_reachable() {
    let db = Database::open_in_memory().unwrap();
    let remote = ScriptedRemote::new();
    remote.script("/health", [Scripted::Status(401)]);

    let caps =
      Capabilities::negotiate(&db, Some(&remote), &ApiRequest::get("/health"), &PrinterConfig::None)
        .await;
    assert_eq!(caps.remote, Ok(RemoteStatus { status: 401 }));
    assert!(caps.can_sync());

    let caps = Capabilities::negotiate::<ScriptedRemote>(
      &db,
      None,
      &ApiRequest::get("/health"),
      &PrinterConfig::None,
    )
    .await;
    assert_eq!(caps.remote, Err(UnavailableReason::NotConfigured));
  }
}
