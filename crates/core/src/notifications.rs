//! Fire-and-forget notifications about relationship transitions.
//!
//! Delivery is best effort: a sink must never fail the transition that
//! produced the notification.

use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    LinkRequestReceived {
        recipient_id: String,
        requester_id: String,
        request_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LinkAccepted {
        requester_id: String,
        recipient_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Unlinked { user_id: String, by_user_id: String },
    #[serde(rename_all = "camelCase")]
    RoutineRequestReceived {
        recipient_id: String,
        from_user_id: String,
        request_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RoutineApplied {
        target_user_id: String,
        source_user_id: String,
        request_id: String,
    },
}

impl Notification {
    pub fn link_request_received(recipient_id: &str, requester_id: &str, request_id: &str) -> Self {
        Self::LinkRequestReceived {
            recipient_id: recipient_id.to_string(),
            requester_id: requester_id.to_string(),
            request_id: request_id.to_string(),
        }
    }

    pub fn link_accepted(requester_id: &str, recipient_id: &str) -> Self {
        Self::LinkAccepted {
            requester_id: requester_id.to_string(),
            recipient_id: recipient_id.to_string(),
        }
    }

    pub fn unlinked(user_id: &str, by_user_id: &str) -> Self {
        Self::Unlinked {
            user_id: user_id.to_string(),
            by_user_id: by_user_id.to_string(),
        }
    }

    pub fn routine_request_received(recipient_id: &str, from_user_id: &str, request_id: &str) -> Self {
        Self::RoutineRequestReceived {
            recipient_id: recipient_id.to_string(),
            from_user_id: from_user_id.to_string(),
            request_id: request_id.to_string(),
        }
    }

    pub fn routine_applied(target_user_id: &str, source_user_id: &str, request_id: &str) -> Self {
        Self::RoutineApplied {
            target_user_id: target_user_id.to_string(),
            source_user_id: source_user_id.to_string(),
            request_id: request_id.to_string(),
        }
    }

    /// The user the notification is addressed to.
    pub fn recipient(&self) -> &str {
        match self {
            Self::LinkRequestReceived { recipient_id, .. } => recipient_id,
            Self::LinkAccepted { requester_id, .. } => requester_id,
            Self::Unlinked { user_id, .. } => user_id,
            Self::RoutineRequestReceived { recipient_id, .. } => recipient_id,
            Self::RoutineApplied { target_user_id, .. } => target_user_id,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

pub struct NoOpNotificationSink;

impl NotificationSink for NoOpNotificationSink {
    fn emit(&self, _notification: Notification) {}
}

/// Writes every notification to the log instead of delivering it.
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn emit(&self, notification: Notification) {
        info!("Notify {}: {:?}", notification.recipient(), notification);
    }
}
