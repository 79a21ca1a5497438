//! Operating profiles and their static configuration records.
//!
//! Everything that differs between the standard, economy and full-offline
//! proxies lives in a [`ProfileConfig`]; the engine, lifecycle and
//! synthesizer are handed one at construction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Operating profile. Exactly one is active per proxy generation.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
  #[default]
  Standard,
  /// Data-constrained: heavy media is never fetched
  Economy,
  /// Offline-first: everything reachable gets cached
  FullOffline,
}

impl Profile {
  /// Store namespace; also names the fallback snapshot key.
  pub fn namespace(self) -> &'static str {
    match self {
      Profile::Standard => "standard",
      Profile::Economy => "no-credit",
      Profile::FullOffline => "full-offline",
    }
  }
}

impl std::fmt::Display for Profile {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.namespace())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
  /// Pre-cached shell and external resources
  Static,
  /// Runtime write-through and the fallback snapshot
  Dynamic,
}

impl StoreRole {
  pub fn as_str(self) -> &'static str {
    match self {
      StoreRole::Static => "static",
      StoreRole::Dynamic => "dynamic",
    }
  }
}

/// Patterns that mark a request as heavy media.
#[derive(Debug, Clone)]
pub struct HeavyMediaPatterns {
  /// Path segments such as `images/`
  pub segments: Vec<&'static str>,
  /// Lowercase file extensions including the dot
  pub extensions: Vec<&'static str>,
  /// Hosts matched exactly or as a parent domain
  pub hosts: Vec<&'static str>,
}

impl Default for HeavyMediaPatterns {
  fn default() -> Self {
    Self {
      segments: vec!["images/", "uploads/", "media/"],
      extensions: vec![".jpg", ".jpeg", ".png", ".gif", ".mp4", ".webm"],
      hosts: vec!["youtube.com", "vimeo.com"],
    }
  }
}

/// Small-response gate used by the economy profile.
pub const SMALL_RESPONSE_BYTES: u64 = 10_000;

const FONT_AWESOME_CSS: &str =
  "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css";
const TAILWIND_CDN: &str = "https://cdn.tailwindcss.com";
const INTER_FONT_CSS: &str =
  "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap";

/// The application a proxy serves: names and origin shared by every profile.
#[derive(Debug, Clone)]
pub struct Site {
  /// Store name prefix
  pub app: String,
  /// Product name shown in notifications
  pub display_name: String,
  pub origin: Url,
}

impl Site {
  pub fn profile_config(&self, profile: Profile, generation: u32) -> ProfileConfig {
    ProfileConfig::for_profile(profile, &self.app, &self.display_name, self.origin.clone())
      .with_generation(generation)
  }
}

/// Static, per-profile configuration for one proxy generation.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
  pub profile: Profile,
  /// Store name prefix
  pub app: String,
  /// Product name shown in notifications
  pub display_name: String,
  /// Origin the application is served from
  pub origin: Url,
  pub generation: u32,
  /// Origin-relative paths pre-cached at install
  pub precache: Vec<&'static str>,
  /// Absolute URLs pre-cached at install
  pub external: Vec<&'static str>,
  pub heavy_media: HeavyMediaPatterns,
  pub small_response_bytes: u64,
  /// Page preferred for failed navigations
  pub offline_page: Option<&'static str>,
  pub sync_tags: Vec<&'static str>,
}

impl ProfileConfig {
  pub fn for_profile(profile: Profile, app: &str, display_name: &str, origin: Url) -> Self {
    let (precache, external, offline_page, sync_tags) = match profile {
      Profile::Standard => (
        vec![
          "/",
          "/index.html",
          "/styles.css",
          "/script.js",
          "/manifest.json",
          "/offline.html",
        ],
        vec![FONT_AWESOME_CSS, TAILWIND_CDN],
        Some("/offline.html"),
        vec!["background-sync"],
      ),
      Profile::Economy => (
        vec!["/", "/index.html", "/manifest.json"],
        vec![],
        None,
        vec!["background-sync"],
      ),
      Profile::FullOffline => (
        vec!["/", "/index.html", "/offline.html", "/manifest.json"],
        vec![FONT_AWESOME_CSS, INTER_FONT_CSS],
        None,
        vec!["background-sync", "sync-offline-data"],
      ),
    };

    Self {
      profile,
      app: app.to_string(),
      display_name: display_name.to_string(),
      origin,
      generation: 1,
      precache,
      external,
      heavy_media: HeavyMediaPatterns::default(),
      small_response_bytes: SMALL_RESPONSE_BYTES,
      offline_page,
      sync_tags,
    }
  }

  pub fn with_generation(mut self, generation: u32) -> Self {
    self.generation = generation;
    self
  }

  /// `<app>-<namespace>-<role>-v<generation>`
  pub fn store_name(&self, role: StoreRole) -> String {
    format!(
      "{}-{}-{}-v{}",
      self.app,
      self.profile.namespace(),
      role.as_str(),
      self.generation
    )
  }

  /// Whether a store belongs to this profile's live generation.
  pub fn owns_store(&self, name: &str) -> bool {
    name == self.store_name(StoreRole::Static) || name == self.store_name(StoreRole::Dynamic)
  }

  /// Resolve a path or absolute URL against the app origin.
  pub fn resolve(&self, path: &str) -> Option<Url> {
    self.origin.join(path).ok()
  }

  /// Every URL fetched into the static store at install.
  pub fn precache_urls(&self) -> Vec<Url> {
    self
      .precache
      .iter()
      .chain(self.external.iter())
      .filter_map(|p| self.resolve(p))
      .collect()
  }

  /// Well-known key holding the fallback snapshot.
  pub fn snapshot_url(&self) -> Url {
    let path = format!("/api/{}-data", self.profile.namespace());
    let mut url = self.origin.clone();
    url.set_path(&path);
    url.set_query(None);
    url
  }

  pub fn fallback_snapshot(&self) -> Value {
    let now = Utc::now().to_rfc3339();
    let post = |id: &str, author: &str, content: &str| {
      json!({
        "id": id,
        "author": author,
        "content": content,
        "timestamp": now,
        "likes": 0,
        "comments": [],
      })
    };

    match self.profile {
      Profile::Standard => json!({
        "mode": "standard",
        "posts": [post(
          "standard-1",
          &self.display_name,
          "You are offline. Recent posts will appear when the connection returns.",
        )],
        "features": {
          "viewPosts": true,
          "createPosts": true,
          "uploadImages": true,
          "comments": true,
          "likes": true,
        },
      }),
      Profile::Economy => json!({
        "mode": "no-credit",
        "posts": [post(
          "no-credit-1",
          &self.display_name,
          "Economy mode is on. Browse the basics without spending data.",
        )],
        "features": {
          "viewPosts": true,
          "createPosts": true,
          "uploadImages": false,
          "comments": true,
          "likes": true,
        },
      }),
      Profile::FullOffline => json!({
        "mode": "full-offline",
        "posts": [
          post(
            "offline-1",
            &self.display_name,
            "You are fully offline. Everything has been saved locally.",
          ),
          post(
            "offline-2",
            "System",
            "Posts created offline will sync when you are back online.",
          ),
        ],
        "user": {
          "id": "offline-user",
          "name": "Offline User",
          "avatar": null,
        },
        "features": {
          "viewPosts": true,
          "createPosts": true,
          "uploadImages": false,
          "comments": true,
          "likes": true,
          "sync": true,
        },
      }),
    }
  }
}
