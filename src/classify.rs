//! Request classification.
//!
//! Rules are checked in order and the first match wins: navigation, heavy
//! media, API data, known static assets, everything else.

use url::Url;

use crate::http::{request_key, Destination, Request};
use crate::profile::{HeavyMediaPatterns, ProfileConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
  Navigation,
  StaticAsset,
  HeavyMedia,
  ApiData,
  Other,
}

impl RequestCategory {
  pub fn as_str(self) -> &'static str {
    match self {
      RequestCategory::Navigation => "navigation",
      RequestCategory::StaticAsset => "static-asset",
      RequestCategory::HeavyMedia => "heavy-media",
      RequestCategory::ApiData => "api-data",
      RequestCategory::Other => "other",
    }
  }
}

/// Whether the proxy handles a request at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
  /// Non-HTTP(S) request, left untouched
  PassThrough,
  Intercept(RequestCategory),
}

#[derive(Debug, Clone)]
pub struct Classifier {
  heavy: HeavyMediaPatterns,
  /// Request keys of the known static assets
  static_assets: Vec<String>,
}

impl Classifier {
  pub fn new(config: &ProfileConfig) -> Self {
    let static_assets = config
      .precache_urls()
      .iter()
      .map(|url| request_key("GET", url))
      .collect();

    Self {
      heavy: config.heavy_media.clone(),
      static_assets,
    }
  }

  pub fn intercept(&self, request: &Request) -> Interception {
    if !request.is_http() {
      return Interception::PassThrough;
    }
    Interception::Intercept(self.classify(request))
  }

  pub fn classify(&self, request: &Request) -> RequestCategory {
    if request.is_navigation() {
      RequestCategory::Navigation
    } else if self.is_heavy(request) {
      RequestCategory::HeavyMedia
    } else if request.url.path().contains("/api/") {
      RequestCategory::ApiData
    } else if self.static_assets.contains(&request.cache_key()) {
      RequestCategory::StaticAsset
    } else {
      RequestCategory::Other
    }
  }

  fn is_heavy(&self, request: &Request) -> bool {
    request.destination.is_media() || self.heavy.matches(&request.url)
  }
}

impl HeavyMediaPatterns {
  pub fn matches(&self, url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();

    if self.segments.iter().any(|seg| path.contains(&format!("/{}", seg))) {
      return true;
    }

    if self.extensions.iter().any(|ext| path.ends_with(ext)) {
      return true;
    }

    match url.host_str() {
      Some(host) => {
        let host = host.to_ascii_lowercase();
        self
          .hosts
          .iter()
          .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
      }
      None => false,
    }
  }
}

/// Image-like requests get the vector placeholder.
pub fn is_image_like(request: &Request) -> bool {
  if request.destination == Destination::Image {
    return true;
  }
  let path = request.url.path().to_ascii_lowercase();
  [".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp"]
    .iter()
    .any(|ext| path.ends_with(ext))
}

/// Video-like requests get the unavailable notice.
pub fn is_video_like(request: &Request) -> bool {
  if request.destination == Destination::Video {
    return true;
  }
  let url = request.url.as_str().to_ascii_lowercase();
  url.contains("video") || url.ends_with(".mp4") || url.ends_with(".webm")
}
