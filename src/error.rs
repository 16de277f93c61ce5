//! Error types for the sync boundary and configuration.

use serde_json::Value;
use thiserror::Error;

/// Configuration errors are raised when the engine is assembled, never at sync time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("unknown cache driver '{0}' (expected 'database' or 'file')")]
  UnknownDriver(String),

  #[error("unknown adapter kind '{0}' (expected 'rest', 'api', 'hateoas' or 'offline')")]
  UnknownAdapter(String),

  #[error("unknown offline handler '{0}'")]
  UnknownOfflineHandler(String),

  #[error("no adapter configured for model '{0}'")]
  MissingAdapter(String),

  #[error("offline adapter '{0}' requires an offline handler")]
  MissingOfflineHandler(String),
}

/// Failure side of a sync. Every sync resolves to a response or exactly one of these.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The network layer failed: timeout, connection drop or non-2xx status.
  #[error("transport error{}: {message}", fmt_status(.status))]
  Transport {
    status: Option<u16>,
    message: String,
    body: Value,
  },

  /// The response arrived but does not have the expected shape.
  #[error("invalid response: {reason}")]
  Validation { reason: String, body: Value },

  /// The server answered with an explicit error marker.
  #[error("remote error {kind}: {message}")]
  Remote {
    kind: String,
    message: String,
    body: Value,
  },

  #[error("storage error: {0}")]
  Storage(String),

  #[error("method '{0}' not implemented by offline handler")]
  NotImplemented(&'static str),

  #[error(transparent)]
  Config(#[from] ConfigError),
}

static NULL_BODY: Value = Value::Null;

fn fmt_status(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl SyncError {
  pub fn validation(reason: impl Into<String>, body: Value) -> Self {
    Self::Validation {
      reason: reason.into(),
      body,
    }
  }

  pub fn storage(err: impl std::fmt::Display) -> Self {
    Self::Storage(err.to_string())
  }

  /// The response body attached to the error, `Null` when there is none.
  pub fn body(&self) -> &Value {
    match self {
      Self::Transport { body, .. } | Self::Validation { body, .. } | Self::Remote { body, .. } => {
        body
      }
      _ => &NULL_BODY,
    }
  }

  /// Whether the failure came from the network rather than the data.
  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }

  /// Whether the server could not be reached or asked to be retried later.
  ///
  /// Connection failures and timeouts carry no status; 408, 429 and 5xx count too.
  /// Any other status is a rejection by a reachable server.
  pub fn is_unreachable(&self) -> bool {
    match self {
      Self::Transport { status: None, .. } => true,
      Self::Transport {
        status: Some(status),
        ..
      } => matches!(*status, 408 | 429 | 500..=599),
      _ => false,
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    Self::Transport {
      status: err.status().map(|s| s.as_u16()),
      message: err.to_string(),
      body: Value::Null,
    }
  }
}
