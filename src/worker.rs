//! Proxy generations and the registration that switches between them.
//!
//! A [`Worker`] is one generation: a profile configuration, its lifecycle and
//! its fetch engine. The [`Registration`] owns the active and waiting
//! generations. Switching profiles installs a new generation and activates
//! it; requests already in flight keep the `Arc` of the generation they
//! started on, new requests go to whichever generation is active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::cache::{Caches, FetchEngine, Outcome};
use crate::error::{ProxyError, ProxyResult};
use crate::http::Request;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::net::Network;
use crate::notify::{notification_from_push, sync_message, ClientMessage, Notification, Notifier};
use crate::profile::ProfileConfig;

pub struct Worker {
  id: u64,
  config: Arc<ProfileConfig>,
  engine: FetchEngine,
  lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Worker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Worker")
      .field("id", &self.id)
      .field("profile", &self.config.profile)
      .field("generation", &self.config.generation)
      .field("state", &self.lifecycle.try_lock().map(|l| l.state()).ok())
      .finish()
  }
}

impl Worker {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn config(&self) -> &ProfileConfig {
    &self.config
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle().state()
  }

  pub async fn fetch(&self, request: &Request) -> Option<Outcome> {
    self.engine.handle(request).await
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// What an activation did.
#[derive(Debug, Clone)]
pub struct Activation {
  pub worker: u64,
  pub purged: Vec<String>,
  /// Clients taken under control
  pub clients: usize,
}

pub struct Registration {
  caches: Caches,
  network: Arc<dyn Network>,
  notifier: Notifier,
  dynamic_budget: Option<u64>,
  next_id: AtomicU64,
  active: RwLock<Option<Arc<Worker>>>,
  waiting: Mutex<Option<Arc<Worker>>>,
}

impl Registration {
  pub fn new(caches: Caches, network: Arc<dyn Network>) -> Self {
    Self {
      caches,
      network,
      notifier: Notifier::new(),
      dynamic_budget: None,
      next_id: AtomicU64::new(1),
      active: RwLock::new(None),
      waiting: Mutex::new(None),
    }
  }

  pub fn with_dynamic_budget(mut self, budget: Option<u64>) -> Self {
    self.dynamic_budget = budget;
    self
  }

  pub fn caches(&self) -> &Caches {
    &self.caches
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  /// The generation new requests are routed to.
  pub fn active(&self) -> Option<Arc<Worker>> {
    self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn waiting(&self) -> Option<Arc<Worker>> {
    self.waiting.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Bring `config` up: reuse its stores if a previous run installed them,
  /// otherwise install. Either way it becomes the active generation.
  pub async fn start(&self, config: ProfileConfig) -> ProxyResult<Activation> {
    let config = Arc::new(config);
    let mut lifecycle = self.lifecycle_for(&config);
    if !lifecycle.adopt_existing()? {
      lifecycle.install().await?;
    }
    self.stage(config, lifecycle);
    self.activate_waiting()
  }

  /// Install a new generation. It is activated straight away when install
  /// requested skip-waiting, otherwise it waits for [`Self::skip_waiting`].
  pub async fn install(&self, config: ProfileConfig) -> ProxyResult<Arc<Worker>> {
    let config = Arc::new(config);
    let mut lifecycle = self.lifecycle_for(&config);
    lifecycle.install().await?;

    let skip = lifecycle.skip_waiting_requested();
    let worker = self.stage(config, lifecycle);
    if skip {
      self.activate_waiting()?;
    }
    Ok(worker)
  }

  /// Control message: promote the waiting generation now.
  pub fn skip_waiting(&self) -> ProxyResult<Option<Activation>> {
    if self.waiting().is_none() {
      return Ok(None);
    }
    self.activate_waiting().map(Some)
  }

  /// Route a request to the active generation. `None` when there is no
  /// controller or the request is not intercepted; it then goes straight to
  /// the network.
  pub async fn fetch(&self, request: &Request) -> Option<Outcome> {
    let worker = self.active()?;
    worker.fetch(request).await
  }

  /// Background sync. Returns the broadcast and how many clients got it,
  /// or `None` if the active profile does not handle the tag.
  pub fn sync(&self, tag: &str) -> Option<(ClientMessage, usize)> {
    let worker = self.active()?;
    if !worker.config.sync_tags.iter().any(|t| *t == tag) {
      return None;
    }
    let message = sync_message(tag)?;
    let delivered = self.notifier.notify(message.clone());
    info!(tag, delivered, "Background sync");
    Some((message, delivered))
  }

  /// Push event. Malformed payloads are logged and show nothing.
  pub fn push(&self, data: Option<&str>) -> Option<Notification> {
    let worker = self.active()?;
    match notification_from_push(&worker.config, data) {
      Ok(notification) => notification,
      Err(e) => {
        warn!(error = %e, "Suppressing push notification");
        None
      }
    }
  }

  /// Notification click: the window to open.
  pub fn notification_click(&self) -> Option<Url> {
    self.active().map(|worker| worker.config.origin.clone())
  }

  fn lifecycle_for(&self, config: &Arc<ProfileConfig>) -> Lifecycle {
    Lifecycle::new(
      Arc::clone(config),
      self.caches.clone(),
      Arc::clone(&self.network),
    )
  }

  /// Park an installed generation as the waiting one.
  fn stage(&self, config: Arc<ProfileConfig>, lifecycle: Lifecycle) -> Arc<Worker> {
    let engine = FetchEngine::new(
      Arc::clone(&config),
      self.caches.clone(),
      Arc::clone(&self.network),
    )
    .with_dynamic_budget(self.dynamic_budget);

    let worker = Arc::new(Worker {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      config,
      engine,
      lifecycle: Mutex::new(lifecycle),
    });

    let previous = self
      .waiting
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .replace(Arc::clone(&worker));
    if let Some(previous) = previous {
      previous.lifecycle().retire();
    }
    worker
  }

  fn activate_waiting(&self) -> ProxyResult<Activation> {
    let worker = self
      .waiting
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    let Some(worker) = worker else {
      return Err(ProxyError::InstallFailed(
        "no installed generation to activate".to_string(),
      ));
    };

    let activated = worker.lifecycle().activate();
    let purged = match activated {
      Ok(purged) => purged,
      Err(e) => {
        *self.waiting.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        return Err(e);
      }
    };

    let previous = self
      .active
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .replace(Arc::clone(&worker));
    if let Some(previous) = previous {
      previous.lifecycle().retire();
    }

    // Claim every connected client
    let clients = self.notifier.client_count();
    info!(
      worker = worker.id,
      profile = %worker.config.profile,
      clients,
      "Generation took control"
    );

    Ok(Activation {
      worker: worker.id,
      purged,
      clients,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::http::{Response, ResponseType};
  use crate::net::testing::ScriptedNetwork;
  use crate::net::FetchOptions;
  use crate::notify::MessageType;
  use crate::profile::{Profile, Site, StoreRole};
  use async_trait::async_trait;
  use tokio::sync::{Notify, Semaphore};

  fn site() -> Site {
    Site {
      app: "outpost".to_string(),
      display_name: "Outpost".to_string(),
      origin: Url::parse("https://app.example").unwrap(),
    }
  }

  /// Serves every pre-cache URL of every profile.
  fn serving_all() -> ScriptedNetwork {
    let net = ScriptedNetwork::new();
    for profile in [Profile::Standard, Profile::Economy, Profile::FullOffline] {
      for url in site().profile_config(profile, 1).precache_urls() {
        net.respond(url.as_str(), Response::text(format!("asset {}", url.path())));
      }
    }
    net
  }

  fn registration(net: ScriptedNetwork) -> Registration {
    Registration::new(
      Caches::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(net),
    )
  }

  #[tokio::test]
  async fn test_no_controller_means_no_interception() {
    let reg = registration(serving_all());
    let req = Request::get("https://app.example/api/feed").unwrap();
    assert!(reg.fetch(&req).await.is_none());
  }

  #[tokio::test]
  async fn test_full_offline_scenario_serves_snapshot() {
    let net = serving_all();
    let reg = registration(net.clone());
    reg
      .install(site().profile_config(Profile::FullOffline, 1))
      .await
      .unwrap();
    net.set_offline(true);

    let outcome = reg
      .fetch(&Request::get("https://app.example/api/feed").unwrap())
      .await
      .unwrap();

    assert_eq!(outcome.source, CacheSource::Synthesized);
    assert!(outcome.network_attempted());
    let body: serde_json::Value = serde_json::from_slice(&outcome.response.body).unwrap();
    assert_eq!(body["mode"], "full-offline");
    assert!(!body["posts"].as_array().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_activates_and_purges_previous_profile() {
    let reg = registration(serving_all());
    let first = reg
      .install(site().profile_config(Profile::Standard, 1))
      .await
      .unwrap();
    assert_eq!(first.state(), LifecycleState::Active);

    let second = reg
      .install(site().profile_config(Profile::Economy, 1))
      .await
      .unwrap();

    assert_eq!(second.state(), LifecycleState::Active);
    assert_eq!(first.state(), LifecycleState::Redundant);
    assert_eq!(reg.active().unwrap().id(), second.id());
    let stores = reg.caches().list().unwrap();
    assert!(stores.iter().all(|s| s.contains("-no-credit-")));
  }

  #[tokio::test]
  async fn test_failed_install_keeps_current_generation() {
    let net = serving_all();
    let reg = registration(net.clone());
    reg
      .install(site().profile_config(Profile::Economy, 1))
      .await
      .unwrap();

    net.set_offline(true);
    let err = reg
      .install(site().profile_config(Profile::FullOffline, 1))
      .await
      .unwrap_err();

    assert!(matches!(err, ProxyError::InstallFailed(_)));
    assert_eq!(reg.active().unwrap().config().profile, Profile::Economy);
    assert!(reg.waiting().is_none());
    assert_eq!(reg.caches().list().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_snapshot_survives_dynamic_budget() {
    let net = serving_all();
    let reg = Registration::new(
      Caches::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(net.clone()),
    )
    .with_dynamic_budget(Some(1000));
    reg
      .install(site().profile_config(Profile::FullOffline, 1))
      .await
      .unwrap();

    net.respond("https://app.example/a.txt", Response::text("a".repeat(600)));
    let mut outcome = reg
      .fetch(&Request::get("https://app.example/a.txt").unwrap())
      .await
      .unwrap();
    assert_eq!(outcome.write_settled().await, Some(true));

    net.set_offline(true);
    let outcome = reg
      .fetch(&Request::get("https://app.example/api/feed").unwrap())
      .await
      .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&outcome.response.body).unwrap();
    assert_eq!(body["mode"], "full-offline");
    assert!(!body["posts"].as_array().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_worker_debug_shows_generation() {
    let reg = registration(serving_all());
    let worker = reg
      .install(site().profile_config(Profile::Economy, 1))
      .await
      .unwrap();

    let shown = format!("{:?}", worker);
    assert!(shown.contains("Economy"));
    assert!(shown.contains("generation: 1"));
    assert!(shown.contains("Active"));
  }

  #[tokio::test]
  async fn test_start_reuses_installed_stores() {
    let net = serving_all();
    let caches = Caches::new(SqliteStorage::open_in_memory().unwrap());
    let first = Registration::new(caches.clone(), Arc::new(net.clone()));
    first
      .start(site().profile_config(Profile::Economy, 1))
      .await
      .unwrap();
    let installs = net.call_count();

    // A restart against the same database does not fetch anything
    let restarted = Registration::new(caches, Arc::new(net.clone()));
    let activation = restarted
      .start(site().profile_config(Profile::Economy, 1))
      .await
      .unwrap();
    assert!(activation.purged.is_empty());
    assert_eq!(net.call_count(), installs);
    assert_eq!(
      restarted.active().unwrap().state(),
      LifecycleState::Active
    );
  }

  #[tokio::test]
  async fn test_sync_broadcasts_to_clients() {
    let reg = registration(serving_all());
    let mut client = reg.notifier().connect();
    reg
      .install(site().profile_config(Profile::FullOffline, 1))
      .await
      .unwrap();

    let (message, delivered) = reg.sync("sync-offline-data").unwrap();
    assert_eq!(message.kind, MessageType::SyncOfflineData);
    assert_eq!(delivered, 1);
    assert_eq!(
      client.recv().await.unwrap().kind,
      MessageType::SyncOfflineData
    );

    assert!(reg.sync("unknown-tag").is_none());
  }

  #[tokio::test]
  async fn test_sync_tag_must_belong_to_profile() {
    let reg = registration(serving_all());
    reg
      .install(site().profile_config(Profile::Standard, 1))
      .await
      .unwrap();
    assert!(reg.sync("sync-offline-data").is_none());
    assert!(reg.sync("background-sync").is_some());
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let reg = registration(serving_all());
    assert!(reg.push(Some(r#"{"body":"hi"}"#)).is_none());

    reg
      .install(site().profile_config(Profile::Standard, 1))
      .await
      .unwrap();

    let shown = reg.push(Some(r#"{"body":"hi"}"#)).unwrap();
    assert_eq!(shown.title, "Outpost");
    assert!(reg.push(Some(r#"{"nobody":true}"#)).is_none());
    assert_eq!(
      reg.notification_click().unwrap().as_str(),
      "https://app.example/"
    );
  }

  /// Network that holds one URL until released.
  struct GatedNetwork {
    inner: ScriptedNetwork,
    gated_url: String,
    reached: Arc<Notify>,
    gate: Arc<Semaphore>,
  }

  #[async_trait]
  impl Network for GatedNetwork {
    async fn fetch(&self, request: &Request, options: FetchOptions) -> ProxyResult<Response> {
      if request.url.as_str() == self.gated_url {
        self.reached.notify_one();
        let _permit = self.gate.acquire().await.expect("gate closed");
      }
      self.inner.fetch(request, options).await
    }
  }

  #[tokio::test]
  async fn test_in_flight_request_finishes_on_old_generation() {
    let inner = serving_all();
    let slow = "https://app.example/api/slow";
    inner.respond(
      slow,
      Response::json(&serde_json::json!({"slow": true})).with_kind(ResponseType::Basic),
    );
    let reached = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let reg = Arc::new(registration_with(GatedNetwork {
      inner: inner.clone(),
      gated_url: slow.to_string(),
      reached: Arc::clone(&reached),
      gate: Arc::clone(&gate),
    }));

    let g1 = reg
      .install(site().profile_config(Profile::Standard, 1))
      .await
      .unwrap();

    let in_flight = {
      let reg = Arc::clone(&reg);
      tokio::spawn(async move {
        reg
          .fetch(&Request::get("https://app.example/api/slow").unwrap())
          .await
      })
    };
    // Let the request reach the network
    reached.notified().await;

    let g2 = reg
      .install(site().profile_config(Profile::FullOffline, 1))
      .await
      .unwrap();
    assert_eq!(reg.active().unwrap().id(), g2.id());
    assert_eq!(g1.state(), LifecycleState::Redundant);

    gate.add_permits(1);
    let mut outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.response.body_text(), r#"{"slow":true}"#);

    // The old generation's store is gone, so its write-through is dropped
    assert_eq!(outcome.write_settled().await, Some(false));
    let old_dynamic = site()
      .profile_config(Profile::Standard, 1)
      .store_name(StoreRole::Dynamic);
    assert!(!reg.caches().has(&old_dynamic).unwrap());

    // New requests route to the new generation
    inner.set_offline(true);
    let next = reg
      .fetch(&Request::get("https://app.example/images/x.png").unwrap())
      .await
      .unwrap();
    assert!(next.response.body_text().contains("OFFLINE"));
  }

  fn registration_with(net: impl Network + 'static) -> Registration {
    Registration::new(
      Caches::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(net),
    )
  }
}
