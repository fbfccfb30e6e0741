//! Remote commerce API boundary.

mod client;
pub mod types;

use std::future::Future;

use crate::error::TransportError;

pub use client::ApiClient;
pub use types::{ApiRequest, ApiResponse, HttpMethod, IDEMPOTENCY_KEY_HEADER};

/// Anything that can execute a request against the remote service.
///
/// `ApiClient` is the production implementation; the queue only depends on
/// this trait so replay can be driven by scripted remotes in tests.
pub trait Remote: Send + Sync {
  fn execute(
    &self,
    request: &ApiRequest,
  ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;
}

impl<R: Remote> Remote for std::sync::Arc<R> {
  fn execute(
    &self,
    request: &ApiRequest,
  ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send {
    (**self).execute(request)
  }
}
