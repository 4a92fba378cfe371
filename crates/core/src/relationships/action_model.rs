//! Relationship action documents (`relationshipActions/{id}`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::store::{Document, DocumentStore};
use crate::time_utils::{first_timestamp_ms, now_rfc3339};

pub const RELATIONSHIP_ACTIONS_COLLECTION: &str = "relationshipActions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Unlink,
    BreakSync,
    SyncNow,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlink => "UNLINK",
            Self::BreakSync => "BREAK_SYNC",
            Self::SyncNow => "SYNC_NOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Processed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

/// One-shot relationship command plus its processing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipAction {
    #[serde(skip)]
    pub id: String,
    pub action_type: ActionType,
    pub initiated_by: String,
    pub source_user_id: String,
    pub target_user_id: String,
    pub status: ActionStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelationshipAction {
    pub fn new(action_type: ActionType, initiated_by: &str, source: &str, target: &str) -> Self {
        Self {
            id: String::new(),
            action_type,
            initiated_by: initiated_by.to_string(),
            source_user_id: source.to_string(),
            target_user_id: target.to_string(),
            status: ActionStatus::Pending,
            created_at: now_rfc3339(),
            processed_at: None,
            mirror_of: None,
            error: None,
        }
    }

    /// Symmetric counterpart: source and target swapped, pointing back at `self`.
    pub fn mirror(&self) -> Self {
        Self {
            id: String::new(),
            action_type: self.action_type,
            initiated_by: self.initiated_by.clone(),
            source_user_id: self.target_user_id.clone(),
            target_user_id: self.source_user_id.clone(),
            status: ActionStatus::Pending,
            created_at: now_rfc3339(),
            processed_at: None,
            mirror_of: Some(self.id.clone()),
            error: None,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut action: RelationshipAction = doc.decode()?;
        action.id = doc.id().to_string();
        Ok(action)
    }

    pub fn created_at_ms(&self) -> i64 {
        first_timestamp_ms([Some(self.created_at.as_str())])
    }

    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Persists a new action and returns it with its generated id.
pub async fn create_action(
    store: &dyn DocumentStore,
    mut action: RelationshipAction,
) -> Result<RelationshipAction> {
    let path = store
        .add(RELATIONSHIP_ACTIONS_COLLECTION, action.to_value()?)
        .await?;
    action.id = path.id().to_string();
    Ok(action)
}
