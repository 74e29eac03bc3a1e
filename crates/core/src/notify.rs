//! Notification sink: trait for surfacing automation events to operators.
//!
//! Modules accept an `Arc<dyn NotificationSink>`. Delivery is best effort:
//! a failed delivery is logged and never changes the outcome of the caller.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BatchFailure,
    EmergencyStop,
    AutomationResumed,
    RollbackTriggered,
    DailySummary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub account_id: String,
    pub kind: NotificationKind,
    pub severity: NotificationSeverity,
    pub title: String,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        account_id: impl Into<String>,
        kind: NotificationKind,
        severity: NotificationSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Deliver a notification, logging instead of propagating failures.
pub fn deliver(sink: &dyn NotificationSink, notification: Notification) {
    let kind = notification.kind;
    let account_id = notification.account_id.clone();
    if let Err(e) = sink.notify(notification) {
        tracing::warn!(
            error = %e,
            account_id = %account_id,
            kind = ?kind,
            "Notification delivery failed"
        );
    }
}

/// Sink that only writes notifications to the log.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        tracing::info!(
            account_id = %notification.account_id,
            kind = ?notification.kind,
            severity = ?notification.severity,
            title = %notification.title,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// In-memory sink that captures notifications for testing.
#[derive(Default)]
pub struct CaptureNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl CaptureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().len()
    }

    pub fn count_kind(&self, kind: NotificationKind) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

impl NotificationSink for CaptureNotifier {
    fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        self.notifications.lock().push(notification);
        Ok(())
    }
}

/// Convenience: create a logging notifier.
pub fn log_notifier() -> Arc<dyn NotificationSink> {
    Arc::new(LogNotifier)
}

/// Convenience: create a capture notifier for tests.
pub fn capture_notifier() -> Arc<CaptureNotifier> {
    Arc::new(CaptureNotifier::new())
}
