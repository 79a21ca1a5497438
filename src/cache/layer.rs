//! Fetch strategy engine: the per-request state machine.
//!
//! Every intercepted request walks the same states:
//!
//! ```text
//! Lookup ─┬─ Hit ──────────────────────────────────────────┐
//!         └─ Miss ─┬─ (network never) ─ Synthesize ────────┤
//!                  └─ NetworkAttempt ─┬─ Success ─ MaybeCache ─┤─ Serve
//!                                     └─ Failure ─ Synthesize ─┘
//! ```
//!
//! Which edges exist, which fetch options are used and what may be cached is
//! decided by the active profile (see [`Policy`]). The store lookup always
//! comes first. Caching a live response is a side effect that never delays or
//! alters what is served: the response is duplicated and the copy is written
//! by a detached task.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::Caches;
use super::traits::CacheSource;
use crate::classify::{Classifier, Interception, RequestCategory};
use crate::error::{ProxyError, ProxyResult};
use crate::http::{request_key, Request, Response, ResponseType};
use crate::net::{FetchOptions, Network};
use crate::profile::{Profile, ProfileConfig, StoreRole};
use crate::synth::Synthesizer;

/// States a request passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  Lookup,
  Hit,
  Miss,
  NetworkAttempt,
  NetworkSuccess,
  NetworkFailure,
  MaybeCache(CacheWrite),
  Synthesize,
  Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
  /// A copy was handed to a background write
  Dispatched,
  /// Policy declined to cache this response
  Skipped,
}

/// Whether a miss may go to the network, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkRule {
  Never,
  Normal,
  ReducedCost,
}

/// Which network responses get written through to the dynamic store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheRule {
  /// Status 200 from the app's own origin
  OkSameOrigin,
  /// Any status 200
  Ok,
  /// Status 200 with a declared content-length below the threshold
  SmallerThan(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Policy {
  network: NetworkRule,
  cache: CacheRule,
}

impl Policy {
  fn for_request(config: &ProfileConfig, category: RequestCategory) -> Self {
    match (config.profile, category) {
      (Profile::Standard, _) => Policy {
        network: NetworkRule::Normal,
        cache: CacheRule::OkSameOrigin,
      },
      (Profile::Economy, RequestCategory::HeavyMedia) => Policy {
        network: NetworkRule::Never,
        cache: CacheRule::SmallerThan(config.small_response_bytes),
      },
      (Profile::Economy, _) => Policy {
        network: NetworkRule::ReducedCost,
        cache: CacheRule::SmallerThan(config.small_response_bytes),
      },
      (Profile::FullOffline, _) => Policy {
        network: NetworkRule::Normal,
        cache: CacheRule::Ok,
      },
    }
  }

  fn should_cache(&self, response: &Response) -> bool {
    match self.cache {
      CacheRule::OkSameOrigin => response.status == 200 && response.kind == ResponseType::Basic,
      CacheRule::Ok => response.status == 200,
      // Missing or unparsable length fails closed
      CacheRule::SmallerThan(limit) => {
        response.status == 200 && response.content_length().is_some_and(|len| len < limit)
      }
    }
  }
}

/// Result of handling one intercepted request.
#[derive(Debug)]
pub struct Outcome {
  pub response: Response,
  pub category: RequestCategory,
  pub source: CacheSource,
  /// States visited, ending in `Serve`
  pub trace: Vec<Step>,
  write: Option<JoinHandle<bool>>,
}

impl Outcome {
  pub fn network_attempted(&self) -> bool {
    self.trace.contains(&Step::NetworkAttempt)
  }

  /// Wait for the background store write, if one was dispatched. Returns
  /// whether it landed.
  pub async fn write_settled(&mut self) -> Option<bool> {
    let handle = self.write.take()?;
    Some(handle.await.unwrap_or(false))
  }
}

/// Per-generation engine deciding how each request is served.
pub struct FetchEngine {
  config: Arc<ProfileConfig>,
  caches: Caches,
  classifier: Classifier,
  synthesizer: Synthesizer,
  network: Arc<dyn Network>,
  /// Byte budget of the dynamic store, enforced after each write
  dynamic_budget: Option<u64>,
  lookup_order: Vec<String>,
  /// Entries trimming must leave alone
  pinned: Vec<String>,
}

impl FetchEngine {
  pub fn new(config: Arc<ProfileConfig>, caches: Caches, network: Arc<dyn Network>) -> Self {
    let lookup_order = vec![
      config.store_name(StoreRole::Static),
      config.store_name(StoreRole::Dynamic),
    ];

    let pinned = vec![request_key("GET", &config.snapshot_url())];

    Self {
      classifier: Classifier::new(&config),
      synthesizer: Synthesizer::new(Arc::clone(&config), caches.clone()),
      config,
      caches,
      network,
      dynamic_budget: None,
      lookup_order,
      pinned,
    }
  }

  pub fn with_dynamic_budget(mut self, budget: Option<u64>) -> Self {
    self.dynamic_budget = budget;
    self
  }

  /// Handle a request. `None` means the request is not ours (non-HTTP) and
  /// must go out untouched.
  pub async fn handle(&self, request: &Request) -> Option<Outcome> {
    let category = match self.classifier.intercept(request) {
      Interception::PassThrough => {
        let reason = ProxyError::UnsupportedScheme(request.url.scheme().to_string());
        debug!(url = %request.url, %reason, "Passing through");
        return None;
      }
      Interception::Intercept(category) => category,
    };

    Some(self.run(request, category).await)
  }

  async fn run(&self, request: &Request, category: RequestCategory) -> Outcome {
    let policy = Policy::for_request(&self.config, category);
    let mut trace = vec![Step::Lookup];

    match self.lookup(request) {
      Some(response) => {
        debug!(url = %request.url, category = category.as_str(), "Serving from cache");
        trace.extend([Step::Hit, Step::Serve]);
        return Outcome {
          response,
          category,
          source: CacheSource::Cache,
          trace,
          write: None,
        };
      }
      None => trace.push(Step::Miss),
    }

    let options = match policy.network {
      NetworkRule::Never => {
        debug!(url = %request.url, profile = %self.config.profile, "Blocked heavy media");
        return self.synthesized(request, category, trace);
      }
      NetworkRule::Normal => FetchOptions::default(),
      NetworkRule::ReducedCost => FetchOptions::reduced_cost(),
    };

    trace.push(Step::NetworkAttempt);
    match self.network.fetch(request, options).await {
      Ok(response) => {
        trace.push(Step::NetworkSuccess);

        let write = if request.is_storable() && policy.should_cache(&response) {
          trace.push(Step::MaybeCache(CacheWrite::Dispatched));
          Some(self.write_through(request.cache_key(), response.clone()))
        } else {
          trace.push(Step::MaybeCache(CacheWrite::Skipped));
          None
        };

        trace.push(Step::Serve);
        Outcome {
          response,
          category,
          source: CacheSource::Network,
          trace,
          write,
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, synthesizing");
        trace.push(Step::NetworkFailure);
        self.synthesized(request, category, trace)
      }
    }
  }

  /// Store errors count as a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    match self
      .caches
      .match_any(&self.lookup_order, &request.cache_key())
    {
      Ok(hit) => hit.map(|entry| {
        let age = Utc::now() - entry.cached_at;
        debug!(key = %entry.key, age_secs = age.num_seconds(), "Store hit");
        entry.response
      }),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Store lookup failed");
        None
      }
    }
  }

  fn synthesized(
    &self,
    request: &Request,
    category: RequestCategory,
    mut trace: Vec<Step>,
  ) -> Outcome {
    trace.extend([Step::Synthesize, Step::Serve]);
    Outcome {
      response: self.synthesizer.synthesize(category, request),
      category,
      source: CacheSource::Synthesized,
      trace,
      write: None,
    }
  }

  /// Write a copy to the dynamic store in the background. Failures are
  /// logged and otherwise ignored.
  fn write_through(&self, key: String, response: Response) -> JoinHandle<bool> {
    let store = self
      .caches
      .handle(&self.config.store_name(StoreRole::Dynamic));
    let budget = self.dynamic_budget;
    let pinned = self.pinned.clone();

    tokio::task::spawn_blocking(move || {
      let result: ProxyResult<()> = store.put(&key, &response).and_then(|()| {
        if let Some(budget) = budget {
          store.trim(budget, &pinned)?;
        }
        Ok(())
      });

      match result {
        Ok(()) => true,
        Err(e) => {
          warn!(key = %key, error = %e, "Skipping cache write");
          false
        }
      }
    })
  }
}
