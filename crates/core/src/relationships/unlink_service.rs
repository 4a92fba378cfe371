//! Unlink protocol: self-write plus mirror event.
//!
//! 1. the actor records action #1 `(source=actor, target=partner)`;
//! 2. the actor removes the partner from its own profile;
//! 3. the actor records the mirror `(source=partner, target=actor)`.
//!
//! The partner's client (or the action trigger) applies the mirror to the
//! partner's own profile. A crash between steps leaves a pending action that
//! [`process_unlink_action`] or the auditor later completes.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use super::action_model::{
    create_action, ActionStatus, ActionType, RelationshipAction, RELATIONSHIP_ACTIONS_COLLECTION,
};
use super::partner_update::plan_partner_removal;
use crate::errors::{Error, ErrorCode, Result};
use crate::notifications::{NoOpNotificationSink, Notification, NotificationSink};
use crate::profiles::{load_profile, save_own_profile, validate_user_id};
use crate::store::{Direction, DocPath, DocumentPatch, DocumentStore, Query, TxDecision, Watch};
use crate::time_utils::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkReceipt {
    pub action_id: String,
    pub mirror_action_id: String,
    /// The actor's own profile was modified.
    pub profile_changed: bool,
}

pub fn action_path(action_id: &str) -> Result<DocPath> {
    Ok(DocPath::doc(RELATIONSHIP_ACTIONS_COLLECTION, action_id)?)
}

/// Removes `partner_id` from `user_id`'s own profile.
pub async fn remove_partner_from_own_profile(
    store: &dyn DocumentStore,
    user_id: &str,
    partner_id: &str,
) -> Result<bool> {
    let Some(profile) = load_profile(store, user_id).await? else {
        warn!("Cannot unlink {} from missing profile {}", partner_id, user_id);
        return Ok(false);
    };
    match plan_partner_removal(&profile, partner_id, &now_rfc3339()) {
        Some(next) => save_own_profile(store, &profile, &next).await,
        None => Ok(false),
    }
}

/// Closes a pending action. Returns `false` if it was no longer pending.
pub async fn finish_action(
    store: &dyn DocumentStore,
    action_id: &str,
    status: ActionStatus,
    error: Option<String>,
) -> Result<bool> {
    let outcome = store
        .transact(
            &action_path(action_id)?,
            Box::new(move |current: Option<&Value>| {
                let pending = current
                    .and_then(|doc| doc.get("status"))
                    .and_then(Value::as_str)
                    == Some(ActionStatus::Pending.as_str());
                if !pending {
                    return TxDecision::Abort("not pending".to_string());
                }
                let mut patch = DocumentPatch::new()
                    .with("status", status.as_str())
                    .with("processedAt", now_rfc3339());
                if let Some(error) = error {
                    patch.set("error", error);
                }
                TxDecision::Update(patch)
            }),
        )
        .await?;
    Ok(outcome.is_committed())
}

/// Applies a pending UNLINK to its source user's own profile and marks it processed.
pub async fn process_unlink_action(
    store: &dyn DocumentStore,
    action: &RelationshipAction,
) -> Result<bool> {
    if action.action_type != ActionType::Unlink || !action.is_pending() {
        return Ok(false);
    }
    let changed =
        remove_partner_from_own_profile(store, &action.source_user_id, &action.target_user_id)
            .await?;
    finish_action(store, &action.id, ActionStatus::Processed, None).await?;
    debug!(
        "Processed unlink action {} for {} (profile changed: {})",
        action.id, action.source_user_id, changed
    );
    Ok(changed)
}

pub struct UnlinkService {
    store: Arc<dyn DocumentStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl UnlinkService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            notifications: Arc::new(NoOpNotificationSink),
        }
    }

    pub fn with_notification_sink(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    pub async fn unlink_partner(&self, actor_id: &str, partner_id: &str) -> Result<UnlinkReceipt> {
        let actor_id = validate_user_id(actor_id, ErrorCode::InvalidUserId)?;
        let partner_id = validate_user_id(partner_id, ErrorCode::InvalidRecipientId)?;
        if actor_id == partner_id {
            return Err(Error::code(
                ErrorCode::CannotLinkSelf,
                "cannot unlink yourself",
            ));
        }
        let store = self.store.as_ref();

        let action = create_action(
            store,
            RelationshipAction::new(ActionType::Unlink, actor_id, actor_id, partner_id),
        )
        .await?;

        let profile_changed = remove_partner_from_own_profile(store, actor_id, partner_id).await?;
        finish_action(store, &action.id, ActionStatus::Processed, None).await?;

        let mirror = create_action(store, action.mirror()).await?;
        info!(
            "User {} unlinked {} (action {}, mirror {})",
            actor_id, partner_id, action.id, mirror.id
        );
        self.notifications
            .emit(Notification::unlinked(partner_id, actor_id));

        Ok(UnlinkReceipt {
            action_id: action.id,
            mirror_action_id: mirror.id,
            profile_changed,
        })
    }

    /// Pending UNLINK actions in `user_id`'s own stream, oldest first.
    pub async fn pending_own_actions(&self, user_id: &str) -> Result<Vec<RelationshipAction>> {
        let query = Query::collection(RELATIONSHIP_ACTIONS_COLLECTION)
            .where_eq("sourceUserId", user_id)
            .where_eq("actionType", ActionType::Unlink.as_str())
            .where_eq("status", ActionStatus::Pending.as_str())
            .order_by("createdAt", Direction::Asc);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(RelationshipAction::from_document)
            .collect()
    }

    /// Client-side listener body: applies every pending UNLINK addressed to
    /// `user_id`'s own stream. Returns how many changed the profile.
    pub async fn process_own_actions(&self, user_id: &str) -> Result<usize> {
        let mut changed = 0;
        for action in self.pending_own_actions(user_id).await? {
            if process_unlink_action(self.store.as_ref(), &action).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn watch_own_actions(&self, user_id: &str) -> Watch {
        Watch::new(
            self.store.as_ref(),
            Query::collection(RELATIONSHIP_ACTIONS_COLLECTION).where_eq("sourceUserId", user_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{create_profile, require_profile, PartnerRef, Profile, RoutineSync};
    use crate::store::InMemoryDocumentStore;

    async fn linked_pair(store: &InMemoryDocumentStore) {
        for (me, other) in [("a", "b"), ("b", "a")] {
            let mut profile = Profile::new(me, me.to_uppercase());
            profile.partners = vec![PartnerRef::new(other, other, other.to_uppercase())];
            profile.partner_ids = vec![other.to_string()];
            profile.partner_id = Some(other.to_string());
            profile.active_partner_id = Some(other.to_string());
            profile.routine_sync = RoutineSync {
                enabled: true,
                partner_id: Some(other.to_string()),
                sync_id: Some("s1".into()),
                ..Default::default()
            };
            create_profile(store, &profile).await.unwrap();
        }
    }

    #[tokio::test]
    async fn unlink_writes_own_profile_and_mirror_only() {
        let store = Arc::new(InMemoryDocumentStore::new());
        linked_pair(&store).await;
        let service = UnlinkService::new(store.clone());

        let receipt = service.unlink_partner("a", "b").await.unwrap();
        assert!(receipt.profile_changed);

        let a = require_profile(store.as_ref(), "a").await.unwrap();
        assert!(a.partner_ids.is_empty());
        assert!(!a.routine_sync.enabled);
        let b = require_profile(store.as_ref(), "b").await.unwrap();
        assert_eq!(b.partner_ids, ["a"]);

        let pending = service.pending_own_actions("b").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mirror_of.as_deref(), Some(receipt.action_id.as_str()));
        assert!(service.pending_own_actions("a").await.unwrap().is_empty());

        assert_eq!(service.process_own_actions("b").await.unwrap(), 1);
        let b = require_profile(store.as_ref(), "b").await.unwrap();
        assert!(b.partner_ids.is_empty());
        assert!(b.routine_sync.sync_id.is_none());

        assert_eq!(service.process_own_actions("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_unlink_is_harmless() {
        let store = Arc::new(InMemoryDocumentStore::new());
        linked_pair(&store).await;
        let service = UnlinkService::new(store.clone());
        service.unlink_partner("a", "b").await.unwrap();
        let second = service.unlink_partner("a", "b").await.unwrap();
        assert!(!second.profile_changed);

        let err = service.unlink_partner("a", "a").await.unwrap_err();
        assert!(err.is_code(ErrorCode::CannotLinkSelf));
    }

    #[tokio::test]
    async fn finished_action_cannot_be_finished_again() {
        let store = InMemoryDocumentStore::new();
        let action = create_action(
            &store,
            RelationshipAction::new(ActionType::Unlink, "a", "a", "b"),
        )
        .await
        .unwrap();
        assert!(finish_action(&store, &action.id, ActionStatus::Failed, Some("boom".into()))
            .await
            .unwrap());
        assert!(!finish_action(&store, &action.id, ActionStatus::Processed, None)
            .await
            .unwrap());
        let doc = store.get(&action_path(&action.id).unwrap()).await.unwrap().unwrap();
        assert_eq!(doc.data["status"], "failed");
        assert_eq!(doc.data["error"], "boom");
    }
}
