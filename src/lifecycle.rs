//! Install and activation of a proxy generation.
//!
//! Installing opens the generation's stores, pre-caches the static set and
//! seeds the fallback snapshot. It is all-or-nothing: if any resource fails,
//! the stores it created are removed and the generation is discarded.
//! Activating deletes every store that does not belong to the generation,
//! which is the only eviction across generations.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::Caches;
use crate::error::{ProxyError, ProxyResult};
use crate::http::{request_key, Request, Response};
use crate::net::{FetchOptions, Network};
use crate::profile::{ProfileConfig, StoreRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Created, install not started
  Parsed,
  Installing,
  /// Installed and waiting for activation
  Installed,
  Activating,
  Active,
  /// Failed to install, or replaced by a newer generation
  Redundant,
}

pub struct Lifecycle {
  config: Arc<ProfileConfig>,
  caches: Caches,
  network: Arc<dyn Network>,
  state: LifecycleState,
  skip_waiting: bool,
}

impl Lifecycle {
  pub fn new(config: Arc<ProfileConfig>, caches: Caches, network: Arc<dyn Network>) -> Self {
    Self {
      config,
      caches,
      network,
      state: LifecycleState::Parsed,
      skip_waiting: false,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  /// Whether install asked to replace the current generation right away.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub async fn install(&mut self) -> ProxyResult<()> {
    self.state = LifecycleState::Installing;
    info!(
      profile = %self.config.profile,
      generation = self.config.generation,
      "Installing"
    );

    let names = [
      self.config.store_name(StoreRole::Static),
      self.config.store_name(StoreRole::Dynamic),
    ];
    let mut created = Vec::new();
    for name in &names {
      if !self.caches.has(name)? {
        created.push(name.clone());
      }
    }

    match self.populate().await {
      Ok(count) => {
        info!(
          profile = %self.config.profile,
          precached = count,
          "Installed, requesting skip waiting"
        );
        self.state = LifecycleState::Installed;
        self.skip_waiting = true;
        Ok(())
      }
      Err(e) => {
        warn!(profile = %self.config.profile, error = %e, "Install failed");
        for name in &created {
          if let Err(err) = self.caches.delete(name) {
            warn!(store = %name, error = %err, "Failed to remove store after install failure");
          }
        }
        self.state = LifecycleState::Redundant;
        Err(match e {
          ProxyError::InstallFailed(_) => e,
          other => ProxyError::InstallFailed(other.to_string()),
        })
      }
    }
  }

  /// Take over stores left by an earlier run of the same generation instead
  /// of installing again. Returns false if they are not all there.
  pub fn adopt_existing(&mut self) -> ProxyResult<bool> {
    for role in [StoreRole::Static, StoreRole::Dynamic] {
      if !self.caches.has(&self.config.store_name(role))? {
        return Ok(false);
      }
    }
    info!(
      profile = %self.config.profile,
      generation = self.config.generation,
      "Reusing installed stores"
    );
    self.state = LifecycleState::Installed;
    self.skip_waiting = true;
    Ok(true)
  }

  /// Fetch the pre-cache set, write it, then seed the snapshot.
  async fn populate(&self) -> ProxyResult<usize> {
    let statics = self
      .caches
      .open(&self.config.store_name(StoreRole::Static))?;
    let dynamic = self
      .caches
      .open(&self.config.store_name(StoreRole::Dynamic))?;

    let fetches = self.config.precache_urls().into_iter().map(|url| {
      let network = Arc::clone(&self.network);
      async move {
        let request = Request::new("GET", url);
        let response = network.fetch(&request, FetchOptions::default()).await?;
        if !response.is_ok() {
          return Err(ProxyError::InstallFailed(format!(
            "{} answered {}",
            request.url, response.status
          )));
        }
        Ok::<_, ProxyError>((request.cache_key(), response))
      }
    });

    // Nothing is written unless every resource arrived
    let fetched = try_join_all(fetches).await?;
    for (key, response) in &fetched {
      statics.put(key, response)?;
    }

    let snapshot_key = request_key("GET", &self.config.snapshot_url());
    dynamic.put(
      &snapshot_key,
      &Response::json(&self.config.fallback_snapshot()),
    )?;

    Ok(fetched.len())
  }

  /// Purge stores from other generations. Returns the deleted names.
  pub fn activate(&mut self) -> ProxyResult<Vec<String>> {
    self.state = LifecycleState::Activating;

    let mut purged = Vec::new();
    for name in self.caches.list()? {
      if self.config.owns_store(&name) {
        continue;
      }
      info!(store = %name, "Deleting store from another generation");
      self.caches.delete(&name)?;
      purged.push(name);
    }

    self.state = LifecycleState::Active;
    info!(
      profile = %self.config.profile,
      generation = self.config.generation,
      purged = purged.len(),
      "Activated"
    );
    Ok(purged)
  }

  /// Mark the generation as superseded.
  pub fn retire(&mut self) {
    self.state = LifecycleState::Redundant;
  }
}
