use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Request, Transport};
use crate::error::TransportError;

/// Transport returning queued responses in order, then `fallback`.
pub(crate) struct ScriptedTransport {
  responses: Mutex<VecDeque<Result<Value, TransportError>>>,
  fallback: Result<Value, TransportError>,
  requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
  pub(crate) fn new(fallback: Result<Value, TransportError>) -> Self {
    Self {
      responses: Mutex::new(VecDeque::new()),
      fallback,
      requests: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn ok() -> Self {
    Self::new(Ok(Value::Null))
  }

  pub(crate) fn failing() -> Self {
    Self::new(Err(TransportError::Network("connection refused".into())))
  }

  pub(crate) fn push(&self, response: Result<Value, TransportError>) {
    self.responses.lock().unwrap().push_back(response);
  }

  pub(crate) fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn execute(&self, request: Request) -> Result<Value, TransportError> {
    self.requests.lock().unwrap().push(request);
    let next = self.responses.lock().unwrap().pop_front();
    next.unwrap_or_else(|| self.fallback.clone())
  }
}
