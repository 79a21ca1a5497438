//! Remote fetching.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::http::{Credentials, Headers, Request, RequestMode, Response, ResponseType};

/// HTTP cache mode for the outgoing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  /// Reuse any cached copy, however stale
  ForceCache,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  pub cache: CacheMode,
  /// Overrides the request's own credentials mode
  pub credentials: Option<Credentials>,
}

impl FetchOptions {
  /// Options used when every byte counts.
  pub fn reduced_cost() -> Self {
    Self {
      cache: CacheMode::ForceCache,
      credentials: Some(Credentials::Omit),
    }
  }
}

/// The remote side of the proxy.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> ProxyResult<Response>;
}

/// Network backed by a reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  fn response_type(&self, request: &Request, headers: &Headers) -> ResponseType {
    if request.url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else if request.mode == RequestMode::NoCors {
      ResponseType::Opaque
    } else if headers.get("access-control-allow-origin").is_some() {
      ResponseType::Cors
    } else {
      ResponseType::Opaque
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> ProxyResult<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| ProxyError::network(request.url.as_str(), e))?;

    let credentials = options.credentials.unwrap_or(request.credentials);
    let mut builder = self.client.request(method, request.url.clone());

    for (name, value) in request.headers.iter() {
      if credentials == Credentials::Omit && matches!(name, "cookie" | "authorization") {
        continue;
      }
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        builder = builder.header(name, value);
      }
    }

    if options.cache == CacheMode::ForceCache {
      builder = builder.header(reqwest::header::CACHE_CONTROL, "max-stale");
    }

    debug!(url = %request.url, method = %request.method, ?options, "Network fetch");

    let resp = builder
      .send()
      .await
      .map_err(|e| ProxyError::network(request.url.as_str(), e))?;

    let status = resp.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in resp.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str(), value);
      }
    }

    let body = resp
      .bytes()
      .await
      .map_err(|e| ProxyError::network(request.url.as_str(), e))?
      .to_vec();

    let kind = self.response_type(request, &headers);
    Ok(Response {
      status,
      headers,
      body,
      kind,
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network double that records every call.

  use super::*;
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};

  #[derive(Clone, Default)]
  pub struct ScriptedNetwork {
    responses: Arc<Mutex<HashMap<String, Response>>>,
    offline: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<(String, FetchOptions)>>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Every fetch fails as if the device were offline.
    pub fn offline() -> Self {
      let net = Self::default();
      net.set_offline(true);
      net
    }

    /// Append `network <url>` to a journal shared with other doubles.
    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
      self.journal = Some(journal);
      self
    }

    pub fn respond(&self, url: &str, response: Response) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(Url::parse(url).unwrap().to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      *self.offline.lock().unwrap() = offline;
    }

    pub fn calls(&self) -> Vec<(String, FetchOptions)> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request, options: FetchOptions) -> ProxyResult<Response> {
      let url = request.url.to_string();
      self.calls.lock().unwrap().push((url.clone(), options));
      if let Some(journal) = &self.journal {
        journal.lock().unwrap().push(format!("network {}", url));
      }

      if *self.offline.lock().unwrap() {
        return Err(ProxyError::network(url, "offline"));
      }

      self
        .responses
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .ok_or_else(|| ProxyError::network(url, "connection refused"))
    }
  }
}
