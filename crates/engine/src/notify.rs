//! Outbound notifications (fire-and-forget, once per transition).
//!
//! Delivery mechanics are out of scope here: production logs a structured
//! line per notification, tests record them.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: String,
    /// Event key, e.g. `content.published`.
    pub event: String,
    pub message: String,
    pub data: Value,
}

impl Notification {
    pub fn new(recipient: impl Into<String>, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            event: event.into(),
            message: message.into(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits one `info!` line per notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            event = %notification.event,
            data = %notification.data,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails (nothing is recorded).
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent().iter().filter(|n| n.event == event).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let delivery_error = |reason: &str| NotifyError::Delivery {
            recipient: notification.recipient.clone(),
            reason: reason.to_string(),
        };
        if self.failing {
            return Err(delivery_error("recording notifier configured to fail"));
        }
        self.sent
            .lock()
            .map_err(|_| delivery_error("recording notifier lock poisoned"))?
            .push(notification.clone());
        Ok(())
    }
}
