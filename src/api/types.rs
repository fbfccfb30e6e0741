use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Header carrying the request-level idempotency token.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP methods the remote commerce API accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }

  /// Mutating requests are not safe to repeat without an idempotency key.
  pub fn is_mutating(&self) -> bool {
    !matches!(self, HttpMethod::Get)
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HttpMethod {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "GET" => Ok(HttpMethod::Get),
      "POST" => Ok(HttpMethod::Post),
      "PUT" => Ok(HttpMethod::Put),
      "PATCH" => Ok(HttpMethod::Patch),
      "DELETE" => Ok(HttpMethod::Delete),
      other => Err(Error::Validation(format!("unsupported method '{}'", other))),
    }
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// A single request against the remote API
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: HttpMethod,
  /// Path relative to the configured base URL, starting with `/`
  pub path: String,
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
}

impl ApiRequest {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      method: HttpMethod::Get,
      path: path.into(),
      body: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn idempotency_key(&self) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(name, _)| name.eq_ignore_ascii_case(IDEMPOTENCY_KEY_HEADER))
      .map(|(_, value)| value.as_str())
  }
}

/// An HTTP-level outcome. Transport failures never produce one of these.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  /// True iff `status < 400`
  pub ok: bool,
  pub status: u16,
  /// Parsed JSON body; `Null` when empty, a string when not JSON
  pub data: Value,
}

impl ApiResponse {
  pub fn new(status: u16, data: Value) -> Self {
    Self {
      ok: status < 400,
      status,
      data,
    }
  }

  /// Map the status onto the error taxonomy; `Ok` carries the body.
  pub fn into_result(self) -> crate::error::Result<Value> {
    match self.status {
      _ if self.ok => Ok(self.data),
      409 => Err(Error::RemoteConflict { status: 409 }),
      400..=499 => Err(Error::RemoteRejected {
        status: self.status,
        message: self.error_summary(),
      }),
      _ => Err(Error::RemoteServerError {
        status: self.status,
        message: self.error_summary(),
      }),
    }
  }

  /// Short description of the failure for `last_error` and logs.
  pub fn error_summary(&self) -> String {
    let detail = match &self.data {
      Value::Null => None,
      Value::String(s) => Some(s.clone()),
      Value::Object(map) => map
        .get("message")
        .or_else(|| map.get("error"))
        .map(|v| match v {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        }),
      other => Some(other.to_string()),
    };

    match detail {
      Some(d) if !d.is_empty() => format!("HTTP {}: {}", self.status, d),
      _ => format!("HTTP {}", self.status),
    }
  }
}
