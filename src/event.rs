use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::Outcome;
use crate::http::Request;
use crate::notify::{ClientMessage, Notification};
use crate::profile::{Profile, Site};
use crate::worker::Registration;

/// Events delivered to the proxy
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
  /// Install a generation for `profile`
  Install {
    profile: Profile,
    #[serde(default = "first_generation")]
    generation: u32,
  },
  /// Promote the waiting generation
  Activate,
  /// Intercept an application request
  Fetch { request: Request },
  /// Control message from an application instance
  Message { data: ControlMessage },
  /// Background sync trigger
  Sync { tag: String },
  /// Push message; `data` is the raw payload
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick,
}

fn first_generation() -> u32 {
  1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlMessage {
  #[serde(rename = "type")]
  pub kind: String,
}

/// Observable result of handling one event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "effect", rename_all = "kebab-case")]
pub enum Effect {
  Installed {
    worker: u64,
    profile: Profile,
    active: bool,
  },
  InstallFailed {
    reason: String,
  },
  Activated {
    worker: u64,
    purged: Vec<String>,
    clients: usize,
  },
  Respond {
    url: String,
    category: &'static str,
    source: &'static str,
    status: u16,
    content_type: Option<String>,
    body: String,
  },
  PassThrough {
    url: String,
  },
  Broadcast {
    message: ClientMessage,
    delivered: usize,
  },
  ShowNotification {
    notification: Notification,
  },
  OpenWindow {
    url: String,
  },
  Ignored {
    reason: String,
  },
}

impl Effect {
  pub fn respond(url: &str, outcome: &Outcome) -> Self {
    Effect::Respond {
      url: url.to_string(),
      category: outcome.category.as_str(),
      source: outcome.source.as_str(),
      status: outcome.response.status,
      content_type: outcome.response.content_type().map(String::from),
      body: outcome.response.body_text(),
    }
  }

  fn ignored(reason: impl Into<String>) -> Self {
    Effect::Ignored {
      reason: reason.into(),
    }
  }
}

/// Handle a single event against the registration.
pub async fn dispatch(registration: &Registration, site: &Site, event: Event) -> Effect {
  match event {
    Event::Install {
      profile,
      generation,
    } => match registration
      .install(site.profile_config(profile, generation))
      .await
    {
      Ok(worker) => Effect::Installed {
        worker: worker.id(),
        profile,
        active: registration.active().map(|w| w.id()) == Some(worker.id()),
      },
      Err(e) => Effect::InstallFailed {
        reason: e.to_string(),
      },
    },
    Event::Activate => activation(registration),
    Event::Message { data } if data.kind == "SKIP_WAITING" => activation(registration),
    Event::Message { data } => Effect::ignored(format!("unknown message {}", data.kind)),
    Event::Fetch { request } => match registration.fetch(&request).await {
      Some(outcome) => Effect::respond(request.url.as_str(), &outcome),
      None => Effect::PassThrough {
        url: request.url.to_string(),
      },
    },
    Event::Sync { tag } => match registration.sync(&tag) {
      Some((message, delivered)) => Effect::Broadcast { message, delivered },
      None => Effect::ignored(format!("sync tag {} not handled", tag)),
    },
    Event::Push { data } => match registration.push(data.as_deref()) {
      Some(notification) => Effect::ShowNotification { notification },
      None => Effect::ignored("no notification to show"),
    },
    Event::NotificationClick => match registration.notification_click() {
      Some(url) => Effect::OpenWindow {
        url: url.to_string(),
      },
      None => Effect::ignored("no active generation"),
    },
  }
}

fn activation(registration: &Registration) -> Effect {
  match registration.skip_waiting() {
    Ok(Some(activation)) => Effect::Activated {
      worker: activation.worker,
      purged: activation.purged,
      clients: activation.clients,
    },
    Ok(None) => Effect::ignored("nothing waiting"),
    Err(e) => {
      warn!(error = %e, "Activation failed");
      Effect::ignored(e.to_string())
    }
  }
}

/// Event loop: lifecycle events are handled in order, each fetch runs as its
/// own task so a slow network never holds up other events. Returns once the
/// event channel closes and every in-flight fetch has answered.
pub async fn run(
  registration: Arc<Registration>,
  site: Site,
  mut events: mpsc::UnboundedReceiver<Event>,
  effects: mpsc::UnboundedSender<Effect>,
) {
  let mut in_flight = JoinSet::new();

  while let Some(event) = events.recv().await {
    debug!(?event, "Dispatching event");
    match event {
      Event::Fetch { .. } => {
        let registration = Arc::clone(&registration);
        let site = site.clone();
        let effects = effects.clone();
        in_flight.spawn(async move {
          let effect = dispatch(&registration, &site, event).await;
          let _ = effects.send(effect);
        });
      }
      event => {
        let effect = dispatch(&registration, &site, event).await;
        if effects.send(effect).is_err() {
          break;
        }
      }
    }

    // Reap finished fetches
    while in_flight.try_join_next().is_some() {}
  }

  while in_flight.join_next().await.is_some() {}
}
