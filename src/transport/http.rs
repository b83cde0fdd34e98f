use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{Method, Request, Transport};
use crate::config::{Config, TransportConfig};
use crate::error::TransportError;

/// JSON-over-HTTP transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &TransportConfig) -> Result<Self> {
    let mut base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", config.base_url, e))?;
    // Without a trailing slash `join` would replace the last segment
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::api_token(),
    })
  }

  pub fn url_for(&self, resource: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(resource.trim_start_matches('/'))
      .map_err(|e| TransportError::ClientFault {
        status: 0,
        message: format!("bad resource path '{}': {}", resource, e),
      })
  }
}

fn classify(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Network(err.to_string())
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: Request) -> Result<Value, TransportError> {
    let url = self.url_for(&request.resource)?;
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url.clone());
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(key) = &request.idempotency_key {
      builder = builder.header("Idempotency-Key", key);
    }
    if let Some(payload) = &request.payload {
      builder = builder.json(payload);
    }

    debug!(method = %request.method, url = %url, "Sending request");
    let response = builder.send().await.map_err(classify)?;
    let status = response.status();
    let body = response.bytes().await.map_err(classify)?;

    if status.is_client_error() || status.is_server_error() {
      let message = String::from_utf8_lossy(&body).chars().take(200).collect();
      let status = status.as_u16();
      return Err(if status >= 500 {
        TransportError::ServerFault { status, message }
      } else {
        TransportError::ClientFault { status, message }
      });
    }

    if body.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| TransportError::ServerFault {
      status: status.as_u16(),
      message: format!("invalid JSON body: {}", e),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transport(base: &str) -> HttpTransport {
    HttpTransport::new(&TransportConfig {
      base_url: base.to_string(),
      timeout_ms: 1000,
    })
    .unwrap()
  }

  #[test]
  fn test_url_join_keeps_base_path() {
    let t = transport("https://api.example.com/v1");
    assert_eq!(
      t.url_for("keywords/42").unwrap().as_str(),
      "https://api.example.com/v1/keywords/42"
    );
    assert_eq!(
      t.url_for("/projects").unwrap().as_str(),
      "https://api.example.com/v1/projects"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(HttpTransport::new(&TransportConfig {
      base_url: "not a url".to_string(),
      timeout_ms: 1000,
    })
    .is_err());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let t = transport("http://127.0.0.1:9/api/");
    let err = t.execute(Request::get("keywords")).await.unwrap_err();
    assert!(err.is_retryable());
  }
}
