//! Substitute responses for requests that cannot or should not be fulfilled.
//!
//! [`Synthesizer::synthesize`] is the terminal fallback of every fetch, so it
//! never fails: a store error just means falling back to a built-in body.

use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::cache::Caches;
use crate::classify::{is_image_like, is_video_like, RequestCategory};
use crate::http::{request_key, Request, Response};
use crate::profile::{Profile, ProfileConfig, StoreRole};

const LIGHT_PLACEHOLDER_SVG: &str = r##"<svg width="100" height="100" xmlns="http://www.w3.org/2000/svg"><rect width="100%" height="100%" fill="#e5e7eb"/><text x="50%" y="50%" text-anchor="middle" dy=".3em" font-size="12" fill="#6b7280">image</text></svg>"##;

const OFFLINE_PLACEHOLDER_SVG: &str = r##"<svg width="200" height="200" xmlns="http://www.w3.org/2000/svg"><rect width="100%" height="100%" fill="#374151"/><text x="50%" y="50%" text-anchor="middle" dy=".3em" font-size="14" fill="#9ca3af">OFFLINE</text></svg>"##;

/// One year, for placeholders that never change.
const PLACEHOLDER_CACHE_CONTROL: &str = "max-age=31536000";

pub struct Synthesizer {
  config: Arc<ProfileConfig>,
  caches: Caches,
}

impl Synthesizer {
  pub fn new(config: Arc<ProfileConfig>, caches: Caches) -> Self {
    Self { config, caches }
  }

  pub fn synthesize(&self, category: RequestCategory, request: &Request) -> Response {
    match category {
      RequestCategory::HeavyMedia if is_image_like(request) => self.image_placeholder(),
      RequestCategory::HeavyMedia if is_video_like(request) => self.video_notice(),
      RequestCategory::ApiData => self.fallback_snapshot(),
      RequestCategory::Navigation => self.entry_page(),
      _ => self.unavailable_notice(),
    }
  }

  fn image_placeholder(&self) -> Response {
    match self.config.profile {
      Profile::FullOffline => Response::new(200, "image/svg+xml", OFFLINE_PLACEHOLDER_SVG),
      Profile::Standard | Profile::Economy => {
        Response::new(200, "image/svg+xml", LIGHT_PLACEHOLDER_SVG)
          .with_header("cache-control", PLACEHOLDER_CACHE_CONTROL)
      }
    }
  }

  fn video_notice(&self) -> Response {
    Response::text(match self.config.profile {
      Profile::Standard => "Video unavailable right now",
      Profile::Economy => "Video unavailable in economy mode",
      Profile::FullOffline => "Video unavailable offline",
    })
  }

  fn unavailable_notice(&self) -> Response {
    Response::text(match self.config.profile {
      Profile::Standard => "Content unavailable while offline",
      Profile::Economy => "Content unavailable in economy mode",
      Profile::FullOffline => "Offline",
    })
  }

  /// The seeded snapshot, or an empty JSON object if it is gone.
  fn fallback_snapshot(&self) -> Response {
    let key = request_key("GET", &self.config.snapshot_url());
    let dynamic = vec![self.config.store_name(StoreRole::Dynamic)];

    match self.caches.match_any(&dynamic, &key) {
      Ok(Some(entry)) => entry.response,
      Ok(None) => Response::json(&json!({})),
      Err(e) => {
        warn!(error = %e, "Fallback snapshot lookup failed");
        Response::json(&json!({}))
      }
    }
  }

  /// A cached entry page if there is one, otherwise a minimal inline page.
  fn entry_page(&self) -> Response {
    let stores = vec![
      self.config.store_name(StoreRole::Static),
      self.config.store_name(StoreRole::Dynamic),
    ];

    let candidates = self
      .config
      .offline_page
      .into_iter()
      .chain(["/", "/index.html"]);

    for path in candidates {
      let Some(url) = self.config.resolve(path) else {
        continue;
      };
      match self.caches.match_any(&stores, &request_key("GET", &url)) {
        Ok(Some(entry)) => return entry.response,
        Ok(None) => {}
        Err(e) => warn!(error = %e, path, "Entry page lookup failed"),
      }
    }

    Response::html(format!(
      "<!doctype html><html><head><meta charset=\"utf-8\"><title>{name}</title></head>\
       <body><h1>{name}</h1><p>You are offline. This page will refresh when the connection \
       returns.</p></body></html>",
      name = self.config.display_name
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Destination;
  use url::Url;

  fn setup(profile: Profile) -> (Synthesizer, Caches, Arc<ProfileConfig>) {
    let origin = Url::parse("https://app.example").unwrap();
    let config = Arc::new(ProfileConfig::for_profile(
      profile, "outpost", "Outpost", origin,
    ));
    let caches = Caches::new(SqliteStorage::open_in_memory().unwrap());
    (
      Synthesizer::new(Arc::clone(&config), caches.clone()),
      caches,
      config,
    )
  }

  fn request(url: &str) -> Request {
    Request::get(url).unwrap()
  }

  #[test]
  fn test_image_placeholder_economy() {
    let (synth, _, _) = setup(Profile::Economy);
    let req = request("https://app.example/avatar").with_destination(Destination::Image);
    let resp = synth.synthesize(RequestCategory::HeavyMedia, &req);

    assert_eq!(resp.status, 200);
    assert_eq!(resp.content_type(), Some("image/svg+xml"));
    assert_eq!(resp.headers.get("cache-control"), Some("max-age=31536000"));
    assert!(resp.body_text().starts_with("<svg"));
  }

  #[test]
  fn test_image_placeholder_full_offline() {
    let (synth, _, _) = setup(Profile::FullOffline);
    let req = request("https://app.example/images/a.png");
    let resp = synth.synthesize(RequestCategory::HeavyMedia, &req);
    assert_eq!(resp.content_type(), Some("image/svg+xml"));
    assert!(resp.body_text().contains("OFFLINE"));
  }

  #[test]
  fn test_video_notice() {
    let (synth, _, _) = setup(Profile::Economy);
    let resp = synth.synthesize(
      RequestCategory::HeavyMedia,
      &request("https://app.example/media/intro.mp4"),
    );
    assert!(resp.content_type().unwrap().starts_with("text/plain"));
    assert!(resp.body_text().contains("economy"));
  }

  #[test]
  fn test_api_data_without_snapshot_is_empty_object() {
    let (synth, _, _) = setup(Profile::FullOffline);
    let resp = synth.synthesize(RequestCategory::ApiData, &request("https://app.example/api/feed"));
    assert_eq!(resp.content_type(), Some("application/json"));
    assert_eq!(resp.body_text(), "{}");
  }

  #[test]
  fn test_api_data_serves_snapshot() {
    let (synth, caches, config) = setup(Profile::Economy);
    let dynamic = caches.open(&config.store_name(StoreRole::Dynamic)).unwrap();
    dynamic
      .put(
        &request_key("GET", &config.snapshot_url()),
        &Response::json(&config.fallback_snapshot()),
      )
      .unwrap();

    let resp = synth.synthesize(RequestCategory::ApiData, &request("https://app.example/api/feed"));
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["mode"], "no-credit");
  }

  #[test]
  fn test_navigation_prefers_cached_entry_page() {
    let (synth, caches, config) = setup(Profile::FullOffline);
    let statics = caches.open(&config.store_name(StoreRole::Static)).unwrap();
    statics
      .put("GET https://app.example/", &Response::html("<p>shell</p>"))
      .unwrap();

    let req = request("https://app.example/profile/42").navigate();
    let resp = synth.synthesize(RequestCategory::Navigation, &req);
    assert_eq!(resp.body_text(), "<p>shell</p>");
  }

  #[test]
  fn test_navigation_standard_prefers_offline_page() {
    let (synth, caches, config) = setup(Profile::Standard);
    let statics = caches.open(&config.store_name(StoreRole::Static)).unwrap();
    statics
      .put("GET https://app.example/", &Response::html("<p>shell</p>"))
      .unwrap();
    statics
      .put(
        "GET https://app.example/offline.html",
        &Response::html("<p>offline</p>"),
      )
      .unwrap();

    let req = request("https://app.example/").navigate();
    let resp = synth.synthesize(RequestCategory::Navigation, &req);
    assert_eq!(resp.body_text(), "<p>offline</p>");
  }

  #[test]
  fn test_navigation_inline_page_when_nothing_cached() {
    let (synth, _, _) = setup(Profile::Economy);
    let resp = synth.synthesize(
      RequestCategory::Navigation,
      &request("https://app.example/").navigate(),
    );
    assert!(resp.content_type().unwrap().starts_with("text/html"));
    assert!(resp.body_text().contains("Outpost"));
  }

  #[test]
  fn test_other_notice() {
    let (synth, _, _) = setup(Profile::FullOffline);
    let resp = synth.synthesize(RequestCategory::Other, &request("https://app.example/x"));
    assert_eq!(resp.body_text(), "Offline");
    assert_eq!(resp.status, 200);
  }
}
