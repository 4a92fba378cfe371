//! Routine request documents (`routineRequests/{id}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::store::Document;
use crate::time_utils::parse_timestamp;

pub const ROUTINE_REQUESTS_COLLECTION: &str = "routineRequests";

/// Direction of the copy relative to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineRequestType {
    /// Sender offers their own routine.
    Share,
    /// Sender asks for the recipient's routine.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineRequestStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    Expired,
}

impl RoutineRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Processing,
    Applied,
    Failed,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineRequest {
    #[serde(skip)]
    pub id: String,
    pub from_user_id: String,
    #[serde(default)]
    pub from_name: String,
    pub to_user_id: String,
    #[serde(default)]
    pub to_name: String,
    /// Whose routine is copied.
    pub source_user_id: String,
    /// Who receives the copy.
    pub target_user_id: String,
    #[serde(rename = "type")]
    pub request_type: RoutineRequestType,
    pub status: RoutineRequestStatus,
    #[serde(default)]
    pub sync_after_accept: bool,
    pub created_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_status: Option<ApplyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

impl RoutineRequest {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut request: RoutineRequest = doc.decode()?;
        request.id = doc.id().to_string();
        Ok(request)
    }

    /// Past `expiresAt`. An unreadable expiry counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        parse_timestamp(&self.expires_at).map_or(true, |expires| expires <= now)
    }

    /// Status as readers must see it: a pending request past its expiry is expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RoutineRequestStatus {
        if self.status == RoutineRequestStatus::Pending && self.is_expired_at(now) {
            RoutineRequestStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == RoutineRequestStatus::Pending
    }
}

/// `(source, target)` for a request of `request_type` sent by `from` to `to`.
pub fn copy_direction<'a>(
    request_type: RoutineRequestType,
    from: &'a str,
    to: &'a str,
) -> (&'a str, &'a str) {
    match request_type {
        RoutineRequestType::Share => (from, to),
        RoutineRequestType::Request => (to, from),
    }
}
