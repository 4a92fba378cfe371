//! Client-side self-heal from the user's own event stream.

use log::info;

use super::action_model::ActionStatus;
use super::link_service::{accepted_requests_for, own_unlink_actions};
use super::partner_update::plan_resolved_partners;
use super::resolver::{accepted_events_for, resolve_active_partners, unlink_events_for};
use super::unlink_service::finish_action;
use crate::config::RelationshipPolicy;
use crate::errors::{ErrorCode, Result};
use crate::profiles::{require_profile, save_own_profile, validate_user_id, PartnerRef};
use crate::store::DocumentStore;
use crate::time_utils::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub partners: Vec<PartnerRef>,
    pub profile_changed: bool,
    /// Pending UNLINK actions closed by this pass.
    pub actions_processed: usize,
}

/// Recomputes `user_id`'s partners from accepted requests and own UNLINK
/// actions, and rewrites the own profile if it disagrees.
pub async fn reconcile_own_partners(
    store: &dyn DocumentStore,
    policy: &RelationshipPolicy,
    user_id: &str,
) -> Result<ReconcileOutcome> {
    let user_id = validate_user_id(user_id, ErrorCode::InvalidUserId)?;
    let (profile, requests, actions) = futures::try_join!(
        require_profile(store, user_id),
        accepted_requests_for(store, user_id),
        own_unlink_actions(store, user_id)
    )?;

    let partners = resolve_active_partners(
        &accepted_events_for(user_id, &requests),
        &unlink_events_for(user_id, &actions),
        policy.max_partners,
    );

    let profile_changed = match plan_resolved_partners(&profile, &partners, &now_rfc3339()) {
        Some(next) => save_own_profile(store, &profile, &next).await?,
        None => false,
    };

    let mut actions_processed = 0;
    for action in actions.iter().filter(|a| a.is_pending()) {
        if finish_action(store, &action.id, ActionStatus::Processed, None).await? {
            actions_processed += 1;
        }
    }

    if profile_changed || actions_processed > 0 {
        info!(
            "Reconciled partners for {}: {:?} ({} action(s) closed)",
            user_id,
            partners.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            actions_processed
        );
    }
    Ok(ReconcileOutcome {
        partners,
        profile_changed,
        actions_processed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{create_profile, Profile};
    use crate::relationships::action_model::{create_action, ActionType, RelationshipAction};
    use crate::relationships::link_model::{LinkRequest, LinkRequestStatus, LINK_REQUESTS_COLLECTION};
    use crate::store::InMemoryDocumentStore;

    async fn accepted_request(store: &InMemoryDocumentStore, from: &str, to: &str, at: &str) {
        let request = LinkRequest {
            id: String::new(),
            requester_id: from.into(),
            requester_alias: from.into(),
            recipient_id: to.into(),
            recipient_alias: Some(to.into()),
            status: LinkRequestStatus::Accepted,
            created_at: at.into(),
            resolved_at: Some(at.into()),
        };
        store
            .add(LINK_REQUESTS_COLLECTION, serde_json::to_value(&request).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_partner_is_restored_from_accepted_request() {
        let store = InMemoryDocumentStore::new();
        create_profile(&store, &Profile::new("a", "A")).await.unwrap();
        accepted_request(&store, "a", "b", "2026-01-01T00:00:00Z").await;

        let outcome = reconcile_own_partners(&store, &RelationshipPolicy::default(), "a")
            .await
            .unwrap();
        assert!(outcome.profile_changed);
        assert_eq!(outcome.partners[0].id, "b");
        let a = require_profile(&store, "a").await.unwrap();
        assert_eq!(a.partner_ids, ["b"]);
        assert_eq!(a.active_partner_id.as_deref(), Some("b"));

        let again = reconcile_own_partners(&store, &RelationshipPolicy::default(), "a")
            .await
            .unwrap();
        assert!(!again.profile_changed);
    }

    #[tokio::test]
    async fn pending_mirror_unlink_is_applied_and_closed() {
        let store = InMemoryDocumentStore::new();
        let mut b = Profile::new("b", "B");
        b.partners = vec![PartnerRef::new("a", "a", "A")];
        b.partner_ids = vec!["a".into()];
        create_profile(&store, &b).await.unwrap();
        accepted_request(&store, "a", "b", "2000-01-01T00:00:00Z").await;
        create_action(&store, RelationshipAction::new(ActionType::Unlink, "a", "b", "a"))
            .await
            .unwrap();

        let outcome = reconcile_own_partners(&store, &RelationshipPolicy::default(), "b")
            .await
            .unwrap();
        assert!(outcome.partners.is_empty());
        assert!(outcome.profile_changed);
        assert_eq!(outcome.actions_processed, 1);
        assert!(require_profile(&store, "b").await.unwrap().partner_ids.is_empty());
    }
}
