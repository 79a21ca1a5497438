//! Core types shared by the store and the fetch engine.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A stored response together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Request identity the entry is keyed by
  pub key: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Found in one of the profile's stores
  Cache,
  /// Fresh data from network
  Network,
  /// Built by the synthesizer because nothing else was available
  Synthesized,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      CacheSource::Cache => "cache",
      CacheSource::Network => "network",
      CacheSource::Synthesized => "synthesized",
    }
  }
}
