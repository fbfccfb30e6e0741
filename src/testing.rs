//! Scripted remote used by unit tests.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{ApiRequest, ApiResponse, Remote};
use crate::error::TransportError;

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum Scripted {
  Status(u16),
  Transport,
  /// Respond with the status after a delay
  Delayed(Duration, u16),
  /// Simulates the process dying mid-request
  Panic,
}

/// Remote that answers from per-path scripts and records every request.
/// Paths without a script (or with an exhausted one) get a 201.
#[derive(Default)]
pub struct ScriptedRemote {
  scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
  calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn script(&self, path: &str, steps: impl IntoIterator<Item = Scripted>) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .extend(steps);
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  fn next_step(&self, request: &ApiRequest) -> Scripted {
    self.calls.lock().unwrap().push(request.clone());
    self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&request.path)
      .and_then(VecDeque::pop_front)
      .unwrap_or(Scripted::Status(201))
  }
}

impl Remote for ScriptedRemote {
  async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
    match self.next_step(request) {
      Scripted::Status(status) => Ok(ApiResponse::new(status, Value::Null)),
      Scripted::Transport => Err(TransportError::new("connection refused")),
      Scripted::Delayed(delay, status) => {
        tokio::time::sleep(delay).await;
        Ok(ApiResponse::new(status, Value::Null))
      }
      Scripted::Panic => panic!("process terminated while sending {}", request.path),
    }
  }
}
