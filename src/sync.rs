//! Flush orchestration: decides when the queue is replayed.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{ApiRequest, Remote};
use crate::db::{format_timestamp, parse_timestamp};
use crate::error::{Error, Result};
use crate::queue::{FlushReport, OperationQueue};

const LAST_FLUSH_META_KEY: &str = "last_flush_at";

/// Why a flush was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Connectivity came back
  Reconnect,
  /// The operator asked for a sync
  Manual,
  /// Periodic timer
  Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Flushed(FlushReport),
  /// Another pass holds the guard; nothing was done
  AlreadyRunning,
}

/// Cloneable handle for requesting flushes from anywhere in the app.
#[derive(Clone)]
pub struct TriggerSender {
  tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl TriggerSender {
  /// Returns false once the orchestrator loop has stopped.
  pub fn send(&self, trigger: SyncTrigger) -> bool {
    self.tx.send(trigger).is_ok()
  }
}

pub fn trigger_channel() -> (TriggerSender, mpsc::UnboundedReceiver<SyncTrigger>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (TriggerSender { tx }, rx)
}

/// Runs queue flushes on demand, on reconnect and on a timer.
pub struct SyncOrchestrator<R: Remote> {
  queue: Arc<OperationQueue<R>>,
}

impl<R: Remote> SyncOrchestrator<R> {
  pub fn new(queue: Arc<OperationQueue<R>>) -> Self {
    Self { queue }
  }

  pub fn queue(&self) -> &Arc<OperationQueue<R>> {
    &self.queue
  }

  /// Run one flush now, unless one is already running.
  pub async fn trigger(&self, reason: SyncTrigger) -> Result<SyncOutcome> {
    debug!(?reason, "flush requested");
    match self.queue.flush().await {
      Ok(report) => {
        // Only a pass that reached the end of the queue counts
        if !report.aborted {
          self
            .queue
            .db()
            .put_meta(LAST_FLUSH_META_KEY, &format_timestamp(&Utc::now()))?;
        }
        Ok(SyncOutcome::Flushed(report))
      }
      Err(Error::FlushInProgress) => {
        debug!(?reason, "flush already running, request ignored");
        Ok(SyncOutcome::AlreadyRunning)
      }
      Err(e) => Err(e),
    }
  }

  /// Stop an active flush before its next record.
  pub fn abort(&self) {
    self.queue.abort();
  }

  /// When the last complete flush pass finished, if ever.
  pub fn last_flush_at(&self) -> Result<Option<DateTime<Utc>>> {
    self
      .queue
      .db()
      .get_meta(LAST_FLUSH_META_KEY)?
      .as_deref()
      .map(parse_timestamp)
      .transpose()
  }

  /// Flush on every trigger and timer tick until `shutdown` resolves.
  ///
  /// A shutdown during a pass aborts it between records and waits for the
  /// in-flight request to finish.
  pub async fn run<S>(
    &self,
    mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    interval: Duration,
    shutdown: S,
  ) where
    S: Future<Output = ()>,
  {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    let mut triggers_open = true;

    info!(interval_secs = interval.as_secs(), "sync loop started");
    loop {
      let reason = tokio::select! {
        biased;
        _ = &mut shutdown => break,
        _ = ticker.tick() => SyncTrigger::Timer,
        received = triggers.recv(), if triggers_open => match received {
          Some(trigger) => trigger,
          None => {
            // Every sender is gone; keep running on the timer
            triggers_open = false;
            continue;
          }
        },
      };

      let pass = self.trigger(reason);
      tokio::pin!(pass);
      // Shutdown is polled first so a pending stop aborts the pass before
      // its first record
      let (result, stopping) = tokio::select! {
        biased;
        _ = &mut shutdown => {
          info!("shutdown requested during flush, aborting after current record");
          self.abort();
          (pass.await, true)
        }
        result = &mut pass => (result, false),
      };

      match result {
        Ok(SyncOutcome::Flushed(report)) if report.processed > 0 || report.failed > 0 => {
          info!(?reason, processed = report.processed, remaining = report.remaining, failed = report.failed, "sync pass complete");
        }
        Ok(_) => {}
        Err(e) => error!(?reason, error = %e, "sync pass failed"),
      }

      if stopping {
        break;
      }
    }
    info!("sync loop stopped");
  }
}

/// Poll `probe` every `period` and send `Reconnect` each time the remote
/// becomes reachable again. Any HTTP response counts as reachable.
///
/// Stops when `shutdown` resolves or nobody listens for triggers anymore.
pub async fn watch_connectivity<R, S>(
  remote: &R,
  probe: ApiRequest,
  period: Duration,
  triggers: TriggerSender,
  shutdown: S,
) where
  R: Remote,
  S: Future<Output = ()>,
{
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  tokio::pin!(shutdown);
  let mut online = true;

  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      _ = ticker.tick() => {}
    }

    let reachable = remote.execute(&probe).await.is_ok();
    match (online, reachable) {
      (false, true) => {
        info!("connectivity restored");
        if !triggers.send(SyncTrigger::Reconnect) {
          break;
        }
      }
      (true, false) => warn!(path = %probe.path, "remote unreachable, operations will be queued locally"),
      _ => {}
    }
    online = reachable;
  }
}
