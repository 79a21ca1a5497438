//! Error taxonomy for the request-interception path.
//!
//! None of these escape a fetch: the engine absorbs them and serves either the
//! live response or a synthesized one. Application-level failures (config,
//! database open, CLI) go through `color_eyre` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
  /// Storage quota or IO failure. Non-fatal on `put`: caching is skipped.
  #[error("store unavailable: {0}")]
  StoreUnavailable(String),

  /// Timeout, offline, DNS. Sends the request down the synthesize path.
  #[error("network failure for {url}: {reason}")]
  NetworkFailure { url: String, reason: String },

  /// Push payload without a usable `body`. The notification is suppressed.
  #[error("malformed push payload: {0}")]
  MalformedPushPayload(String),

  /// Non-HTTP(S) request. Passed through untouched.
  #[error("unsupported scheme: {0}")]
  UnsupportedScheme(String),

  #[error("install failed: {0}")]
  InstallFailed(String),
}

impl ProxyError {
  pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
    Self::NetworkFailure {
      url: url.into(),
      reason: reason.to_string(),
    }
  }

  pub fn store(reason: impl ToString) -> Self {
    Self::StoreUnavailable(reason.to_string())
  }
}

impl From<rusqlite::Error> for ProxyError {
  fn from(e: rusqlite::Error) -> Self {
    Self::store(e)
  }
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
