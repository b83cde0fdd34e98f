//! Network capability consumed by the data layer.

mod http;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TransportError;

pub use http::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  /// Path relative to the transport's base, e.g. `keywords/42`
  pub resource: String,
  pub payload: Option<Value>,
  /// Sent so the server can deduplicate retried mutations
  pub idempotency_key: Option<String>,
}

impl Request {
  pub fn get(resource: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      resource: resource.into(),
      payload: None,
      idempotency_key: None,
    }
  }
}

/// Executes requests. Non-2xx responses and network failures are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: Request) -> Result<Value, TransportError>;
}
