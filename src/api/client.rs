use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::{Error, Result, TransportError};

use super::types::{ApiRequest, ApiResponse};
use super::Remote;

/// Thin HTTP client for the remote commerce API.
///
/// Attaches authorization and tenant context to every request and reports
/// transport failures separately from HTTP statuses. It never retries;
/// retry policy belongs to the operation queue.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: String,
  token: String,
  tenant_id: String,
  location_id: String,
  channel: String,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self> {
    let base = url::Url::parse(&config.base_url)
      .map_err(|e| Error::Validation(format!("invalid base_url '{}': {}", config.base_url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .connect_timeout(Duration::from_millis(config.timeout_ms))
      .build()
      .map_err(|e| Error::Validation(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base_url: base.as_str().trim_end_matches('/').to_string(),
      token: token.into(),
      tenant_id: config.tenant_id.clone(),
      location_id: config.location_id.clone(),
      channel: config.channel.clone(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  /// Default headers with the request's own headers merged over them.
  /// A caller header replaces a default of the same name.
  fn headers_for(&self, request: &ApiRequest) -> std::result::Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", self.token))?);
    headers.insert(HeaderName::from_static("x-tenant-id"), header_value(&self.tenant_id)?);
    headers.insert(HeaderName::from_static("x-location-id"), header_value(&self.location_id)?);
    headers.insert(HeaderName::from_static("x-channel"), header_value(&self.channel)?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::new(format!("invalid header name '{}': {}", name, e)))?;
      headers.insert(name, header_value(value)?);
    }
    Ok(headers)
  }

  /// Execute one request. `Err` means the remote was never reached or the
  /// response could not be read; any HTTP status comes back as `Ok`.
  pub async fn execute(
    &self,
    request: &ApiRequest,
  ) -> std::result::Result<ApiResponse, TransportError> {
    let started = Instant::now();

    let mut builder = self
      .http
      .request(request.method.into(), self.url(&request.path))
      .headers(self.headers_for(request)?);

    if let Some(body) = &request.body {
      builder = builder.body(body.to_string());
    }

    let response = builder.send().await.map_err(|e| {
      warn!(method = %request.method, path = %request.path, error = %e, "request failed before a response");
      transport_error(e)
    })?;

    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(transport_error)?;
    let data = parse_body(&bytes);

    debug!(
      method = %request.method,
      path = %request.path,
      status,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "remote request completed"
    );

    Ok(ApiResponse::new(status, data))
  }
}

impl Remote for ApiClient {
  async fn execute(
    &self,
    request: &ApiRequest,
  ) -> std::result::Result<ApiResponse, TransportError> {
    ApiClient::execute(self, request).await
  }
}

fn header_value(value: &str) -> std::result::Result<HeaderValue, TransportError> {
  HeaderValue::from_str(value).map_err(|e| TransportError::new(format!("invalid header value: {}", e)))
}

fn transport_error(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::timeout(err.to_string())
  } else {
    TransportError::new(err.to_string())
  }
}

fn parse_body(bytes: &[u8]) -> Value {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{HttpMethod, IDEMPOTENCY_KEY_HEADER};
  use serde_json::json;
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn config(base_url: &str, timeout_ms: u64) -> ApiConfig {
    ApiConfig {
      base_url: base_url.to_string(),
      tenant_id: "tenant-1".to_string(),
      location_id: "L1".to_string(),
      channel: "pos".to_string(),
      timeout_ms,
    }
  }

  #[tokio::test]
  async fn test_attaches_context_and_idempotency_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/stock/adjust"))
      .and(header("authorization", "Bearer secret"))
      .and(header("x-tenant-id", "tenant-1"))
      .and(header("x-location-id", "L1"))
      .and(header("x-channel", "pos"))
      .and(header("content-type", "application/json"))
      .and(header("idempotency-key", "k-123"))
      .and(body_json(json!({"sku": "A1", "delta": -1})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "adj-1"})))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&config(&format!("{}/api/", server.uri()), 2_000), "secret").unwrap();
    let mut request = ApiRequest {
      method: HttpMethod::Post,
      path: "/stock/adjust".to_string(),
      body: Some(json!({"sku": "A1", "delta": -1})),
      headers: Default::default(),
    };
    request
      .headers
      .insert(IDEMPOTENCY_KEY_HEADER.to_string(), "k-123".to_string());

    let response = client.execute(&request).await.unwrap();
    assert!(response.ok);
    assert_eq!(response.status, 201);
    assert_eq!(response.data, json!({"id": "adj-1"}));
  }

  #[tokio::test]
  async fn test_request_headers_replace_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
      .and(path("/locations/L2"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&config(&server.uri(), 2_000), "secret").unwrap();
    let mut request = ApiRequest {
      method: HttpMethod::Patch,
      path: "/locations/L2".to_string(),
      body: Some(json!({"name": "Back room"})),
      headers: Default::default(),
    };
    request
      .headers
      .insert("X-Location-Id".to_string(), "L2".to_string());
    request.headers.insert(
      "content-type".to_string(),
      "application/merge-patch+json".to_string(),
    );
    client.execute(&request).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let values = |name: &str| -> Vec<String> {
      received[0]
        .headers
        .get_all(name)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
    };
    assert_eq!(values("x-location-id"), vec!["L2"]);
    assert_eq!(values("content-type"), vec!["application/merge-patch+json"]);
    // Untouched defaults are still sent once
    assert_eq!(values("x-tenant-id"), vec!["tenant-1"]);
    assert_eq!(values("authorization"), vec!["Bearer secret"]);
  }

  #[tokio::test]
  async fn test_http_errors_are_not_transport_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/locations"))
      .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
      .mount(&server)
      .await;

    let client = ApiClient::new(&config(&server.uri(), 2_000), "t").unwrap();
    let response = client.execute(&ApiRequest::get("/locations")).await.unwrap();
    assert!(!response.ok);
    assert_eq!(response.status, 503);
    assert_eq!(response.data, Value::String("maintenance".to_string()));
  }

  #[tokio::test]
  async fn test_empty_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(204))
      .mount(&server)
      .await;

    let client = ApiClient::new(&config(&server.uri(), 2_000), "t").unwrap();
    let response = client.execute(&ApiRequest::get("/ping")).await.unwrap();
    assert!(response.ok);
    assert_eq!(response.data, Value::Null);
  }

  #[tokio::test]
  async fn test_timeout_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
      .mount(&server)
      .await;

    let client = ApiClient::new(&config(&server.uri(), 100), "t").unwrap();
    let err = client.execute(&ApiRequest::get("/slow")).await.unwrap_err();
    assert!(err.timed_out);
  }

  #[tokio::test]
  async fn test_connection_refused_is_transport_error() {
    // Bind then drop a listener so the port is known to be closed
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::new(&config(&format!("http://{}", addr), 1_000), "t").unwrap();
    assert!(client.execute(&ApiRequest::get("/locations")).await.is_err());
  }

  #[test]
  fn test_rejects_invalid_base_url() {
    assert!(matches!(
      ApiClient::new(&config("not a url", 1_000), "t"),
      Err(Error::Validation(_))
    ));
  }
}
