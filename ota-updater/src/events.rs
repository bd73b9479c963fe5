//! Event channel between the controller and its observers.
//!
//! Single writer (the controller), any number of readers. Events are
//! delivered to each subscriber in publish order. Subscribing does not replay
//! history; use [`crate::UpdaterController::attach`] to get a snapshot and a
//! subscription with no gap between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::status::{PersistentStatus, UpdateStatus};

/// Default number of undelivered events retained per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A notification published by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Transient or persistent status changed.
    UpdateStatus {
        download_id: String,
        status: UpdateStatus,
        persistent_status: PersistentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },

    /// Download progress tick.
    DownloadProgress {
        download_id: String,
        progress: u8,
        downloaded_bytes: u64,
        total_bytes: u64,
    },

    /// Install progress tick.
    InstallProgress {
        download_id: String,
        progress: u8,
        finalizing: bool,
    },

    /// The update left the registry. Always the last event for its id.
    UpdateRemoved { download_id: String },
}

impl UpdateEvent {
    /// The update this event refers to.
    pub fn download_id(&self) -> &str {
        match self {
            UpdateEvent::UpdateStatus { download_id, .. }
            | UpdateEvent::DownloadProgress { download_id, .. }
            | UpdateEvent::InstallProgress { download_id, .. }
            | UpdateEvent::UpdateRemoved { download_id } => download_id,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, UpdateEvent::UpdateRemoved { .. })
    }
}

/// Machine readable cause attached to a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// The user paused the transfer.
    DownloadPaused,
    /// The transfer failed; resumable.
    DownloadFailed,
    VerificationFailed,
    InstallationFailed,
    /// The install was stopped and rolled back to the verified artifact.
    InstallationStopped,
    InstallationSuspended,
    Deleted,
}

/// Why a status changed, with optional detail for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reason {
    pub fn new(code: ReasonCode) -> Self {
        Self { code, message: None }
    }

    pub fn with_message(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// Errors returned by [`Subscription::recv`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and `0` events were dropped. Take a new
    /// snapshot before relying on further events.
    #[error("Subscriber lagged behind by {0} events")]
    Lagged(u64),

    /// The controller is gone.
    #[error("Event channel closed")]
    Closed,
}

/// Publishing side of the channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventChannel {
    sender: broadcast::Sender<UpdateEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: UpdateEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving side held by one observer. Dropping it detaches the observer.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<UpdateEvent>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<UpdateEvent, SubscriptionError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => SubscriptionError::Lagged(n),
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
        })
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Result<UpdateEvent, SubscriptionError>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Some(Err(SubscriptionError::Lagged(n)))
            }
            Err(broadcast::error::TryRecvError::Closed) => Some(Err(SubscriptionError::Closed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(id: &str) -> UpdateEvent {
        UpdateEvent::UpdateRemoved {
            download_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let channel = EventChannel::new(16);
        let mut sub = channel.subscribe();

        channel.publish(UpdateEvent::DownloadProgress {
            download_id: "a".to_string(),
            progress: 10,
            downloaded_bytes: 100,
            total_bytes: 1000,
        });
        channel.publish(removed("a"));

        assert!(matches!(sub.recv().await, Ok(UpdateEvent::DownloadProgress { progress: 10, .. })));
        assert_eq!(sub.recv().await, Ok(removed("a")));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let channel = EventChannel::new(16);
        channel.publish(removed("a"));

        let mut sub = channel.subscribe();
        assert!(sub.try_recv().is_none());
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let channel = EventChannel::new(2);
        let mut sub = channel.subscribe();
        for i in 0..5 {
            channel.publish(removed(&i.to_string()));
        }
        assert!(matches!(sub.recv().await, Err(SubscriptionError::Lagged(_))));
    }

    #[test]
    fn test_event_wire_format() {
        let event = UpdateEvent::UpdateStatus {
            download_id: "a".to_string(),
            status: UpdateStatus::PausedError,
            persistent_status: PersistentStatus::Incomplete,
            reason: Some(Reason::with_message(ReasonCode::DownloadFailed, "reset by peer")),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update_status");
        assert_eq!(json["status"], "PAUSED_ERROR");
        assert_eq!(json["reason"]["code"], "download_failed");
        assert_eq!(event.download_id(), "a");
    }
}
