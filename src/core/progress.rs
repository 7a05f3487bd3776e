//! Human-readable progress events for UI subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{FailureReason, NOTIFICATION_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub title: String,
    pub message: String,
    /// `Some("NOTIFICATION")` when the event must be persisted as a user notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn notification(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Error,
            title: title.into(),
            message: message.into(),
            code: Some(NOTIFICATION_CODE.to_string()),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.code.as_deref() == Some(NOTIFICATION_CODE)
    }

    /// Terminal summary for a finished batch.
    pub fn summary(succeeded: usize, failed: usize) -> Self {
        let (kind, message) = match (succeeded, failed) {
            (0, 0) => (ProgressKind::Info, "No GSTs were processed".to_string()),
            (s, 0) => (ProgressKind::Success, format!("All {} GSTs updated successfully", s)),
            (0, f) => (ProgressKind::Error, format!("All {} GSTs failed to update", f)),
            (s, f) => (
                ProgressKind::Warning,
                format!("{} GSTs updated successfully, {} GSTs failed", s, f),
            ),
        };
        Self::new(kind, "GST refresh finished", message)
    }
}

impl From<&FailureReason> for ProgressEvent {
    fn from(reason: &FailureReason) -> Self {
        if reason.notify {
            ProgressEvent::notification("GST portal action required", reason.message.clone())
        } else {
            ProgressEvent::new(ProgressKind::Error, "GST refresh failed", reason.message.clone())
        }
    }
}

/// Fan-out of progress events; publishing without subscribers is fine.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ProgressEvent) {
        match self.tx.send(event) {
            Ok(n) => debug!("progress event delivered to {} subscribers", n),
            Err(_) => debug!("progress event dropped: no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_wording() {
        assert_eq!(ProgressEvent::summary(3, 0).kind, ProgressKind::Success);
        assert_eq!(ProgressEvent::summary(0, 2).message, "All 2 GSTs failed to update");
        assert_eq!(
            ProgressEvent::summary(2, 1).message,
            "2 GSTs updated successfully, 1 GSTs failed"
        );
    }

    #[tokio::test]
    async fn notification_reaches_subscriber() {
        let b = ProgressBroadcaster::new(8);
        let mut rx = b.subscribe();
        b.publish(ProgressEvent::from(&FailureReason::notify("password expired")));
        let got = rx.recv().await.unwrap();
        assert!(got.is_notification());
        assert_eq!(got.message, "password expired");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        ProgressBroadcaster::default().publish(ProgressEvent::summary(0, 0));
    }
}
