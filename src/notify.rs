//! Messages to controlled application instances, and push notifications.
//!
//! Broadcasts are fire-and-forget: a message reaches whichever clients are
//! subscribed at the time, at most once, with no acknowledgment.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::profile::ProfileConfig;

const CLIENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
  SyncPendingData,
  SyncOfflineData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
  #[serde(rename = "type")]
  pub kind: MessageType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

/// Map a background-sync tag to the message it triggers.
pub fn sync_message(tag: &str) -> Option<ClientMessage> {
  match tag {
    "background-sync" => Some(ClientMessage {
      kind: MessageType::SyncPendingData,
      message: None,
    }),
    "sync-offline-data" => Some(ClientMessage {
      kind: MessageType::SyncOfflineData,
      message: Some("Syncing offline data...".to_string()),
    }),
    _ => None,
  }
}

/// Broadcast channel to every application instance in scope.
#[derive(Clone)]
pub struct Notifier {
  tx: broadcast::Sender<ClientMessage>,
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(CLIENT_BUFFER);
    Self { tx }
  }

  /// Register an application instance.
  pub fn connect(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Send to every live client. Returns how many received it.
  pub fn notify(&self, message: ClientMessage) -> usize {
    match self.tx.send(message) {
      Ok(delivered) => {
        debug!(delivered, "Broadcast client message");
        delivered
      }
      // No clients is not a failure
      Err(_) => 0,
    }
  }
}

/// A system notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
  body: Option<String>,
}

/// Build the notification for a push event. No data means nothing to show.
pub fn notification_from_push(
  config: &ProfileConfig,
  data: Option<&str>,
) -> ProxyResult<Option<Notification>> {
  let Some(data) = data else {
    return Ok(None);
  };

  let payload: PushPayload = serde_json::from_str(data).map_err(|e| {
    warn!(error = %e, "Push payload is not JSON");
    ProxyError::MalformedPushPayload(e.to_string())
  })?;

  let body = payload
    .body
    .ok_or_else(|| ProxyError::MalformedPushPayload("missing body".to_string()))?;

  Ok(Some(Notification {
    title: config.display_name.clone(),
    body,
    icon: "/icon-192.png".to_string(),
    badge: "/icon-192.png".to_string(),
    tag: format!("{}-notification", config.app),
  }))
}
