//! HTTP-shaped request and response types seen by the proxy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// How the application issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// What the response will be used for.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Video,
  Audio,
  Script,
  Style,
  Font,
  Manifest,
  #[default]
  Empty,
}

impl Destination {
  pub fn is_media(self) -> bool {
    matches!(self, Destination::Image | Destination::Video | Destination::Audio)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
  Omit,
  #[default]
  SameOrigin,
  Include,
}

/// Where a response came from, mirroring the fetch response types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin network response
  Basic,
  /// Cross-origin response with CORS headers exposed
  Cors,
  /// Cross-origin response without CORS
  Opaque,
  /// Built locally, never touched the network
  #[default]
  Default,
}

/// Header map with lowercased names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: &str, value: impl Into<String>) {
    self.0.insert(name.to_ascii_lowercase(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  #[serde(default = "default_method")]
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub mode: RequestMode,
  #[serde(default)]
  pub destination: Destination,
  #[serde(default)]
  pub credentials: Credentials,
  #[serde(default)]
  pub headers: Headers,
}

fn default_method() -> String {
  "GET".to_string()
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      mode: RequestMode::default(),
      destination: Destination::default(),
      credentials: Credentials::default(),
      headers: Headers::new(),
    }
  }

  pub fn get(url: &str) -> Result<Self, url::ParseError> {
    Ok(Self::new("GET", Url::parse(url)?))
  }

  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self.destination = Destination::Document;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only `GET` responses can be written to a store.
  pub fn is_storable(&self) -> bool {
    self.method == "GET"
  }

  /// Identity used as the store key.
  pub fn cache_key(&self) -> String {
    request_key(&self.method, &self.url)
  }
}

/// Normalized request identity: uppercase method plus the absolute URL
/// without its fragment.
pub fn request_key(method: &str, url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  format!("{} {}", method.to_ascii_uppercase(), url)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  #[serde(default)]
  pub kind: ResponseType,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    let mut headers = Headers::new();
    headers.insert("content-type", content_type);
    Self {
      status,
      headers,
      body: body.into(),
      kind: ResponseType::Default,
    }
  }

  pub fn text(body: impl Into<String>) -> Self {
    Self::new(200, "text/plain; charset=utf-8", body.into())
  }

  pub fn html(body: impl Into<String>) -> Self {
    Self::new(200, "text/html; charset=utf-8", body.into())
  }

  pub fn json(value: &serde_json::Value) -> Self {
    Self::new(200, "application/json", value.to_string())
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_kind(mut self, kind: ResponseType) -> Self {
    self.kind = kind;
    self
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type")
  }

  /// Declared `Content-Length`, if present and parsable.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get("content-length")
      .and_then(|v| v.trim().parse().ok())
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
