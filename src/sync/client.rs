use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::SyncRequest;
use crate::config::HttpConfig;
use crate::error::SyncError;

/// Network boundary: sends one request and yields the decoded JSON body.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &SyncRequest) -> std::result::Result<Value, SyncError>;
}

/// reqwest-backed transport speaking JSON.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &HttpConfig, token: Option<String>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in &config.headers {
      headers.insert(
        HeaderName::from_bytes(name.as_bytes())
          .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?,
        HeaderValue::from_str(value)
          .map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?,
      );
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, token })
  }

  fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
  ) -> reqwest::RequestBuilder {
    for (name, value) in headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    builder
  }
}

/// Decode a response body: empty is `Null`, non-JSON text is kept as a string.
fn decode_body(text: &str) -> Value {
  if text.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &SyncRequest) -> std::result::Result<Value, SyncError> {
    let mut builder = self
      .client
      .request(request.http_method.to_method(), &request.url);
    builder = Self::apply_headers(builder, &request.headers);

    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status();
    let text = response.text().await?;
    let body = decode_body(&text);

    debug!(
      verb = %request.http_method,
      url = %request.url,
      status = status.as_u16(),
      "received response"
    );

    if !status.is_success() {
      warn!(url = %request.url, status = status.as_u16(), "request failed");
      return Err(SyncError::Transport {
        status: Some(status.as_u16()),
        message: status
          .canonical_reason()
          .unwrap_or("request failed")
          .to_string(),
        body,
      });
    }

    Ok(body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decode_body() {
    assert_eq!(decode_body(""), Value::Null);
    assert_eq!(decode_body("  \n"), Value::Null);
    assert_eq!(decode_body(r#"{"id":1}"#), json!({"id": 1}));
    assert_eq!(decode_body("Bad Gateway"), json!("Bad Gateway"));
  }

  #[test]
  fn test_rejects_invalid_default_header() {
    let mut config = HttpConfig::default();
    config.headers.insert("bad header".into(), "x".into());
    assert!(HttpTransport::new(&config, None).is_err());
  }
}
