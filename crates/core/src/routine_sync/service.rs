use std::sync::Arc;

use log::{debug, info};

use super::state::{plan_disable_sync, plan_enable_sync, plan_set_mode, stamp_routine_edit};
use crate::errors::{Error, ErrorCode, Result};
use crate::profiles::{
    load_profile, require_profile, save_own_profile, validate_user_id, Profile, Routine,
    RoutineSyncMode,
};
use crate::relationships::{create_action, ActionType, RelationshipAction};
use crate::store::DocumentStore;
use crate::time_utils::now_rfc3339;

/// Client-side routine sync commands. Each writes only the caller's own
/// profile; cross-profile effects are requested through relationship actions.
pub struct RoutineSyncService {
    store: Arc<dyn DocumentStore>,
}

impl RoutineSyncService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn own_and_partner(
        &self,
        user_id: &str,
        partner_id: &str,
    ) -> Result<(Profile, Option<Profile>)> {
        let store = self.store.as_ref();
        let user_id = validate_user_id(user_id, ErrorCode::InvalidUserId)?;
        let partner_id = validate_user_id(partner_id, ErrorCode::InvalidRecipientId)?;
        Ok(futures::try_join!(
            require_profile(store, user_id),
            load_profile(store, partner_id)
        )?)
    }

    pub async fn enable_sync(
        &self,
        user_id: &str,
        partner_id: &str,
        mode: RoutineSyncMode,
    ) -> Result<Profile> {
        let (own, partner) = self.own_and_partner(user_id, partner_id).await?;
        let next = plan_enable_sync(&own, partner_id, partner.as_ref(), mode, &now_rfc3339())?;
        save_own_profile(self.store.as_ref(), &own, &next).await?;
        info!(
            "Routine sync enabled for {} with {} ({:?})",
            user_id, partner_id, mode
        );
        Ok(next)
    }

    pub async fn set_mode(&self, user_id: &str, mode: RoutineSyncMode) -> Result<Profile> {
        let own = require_profile(self.store.as_ref(), user_id).await?;
        let next = plan_set_mode(&own, mode, &now_rfc3339())?;
        save_own_profile(self.store.as_ref(), &own, &next).await?;
        Ok(next)
    }

    pub async fn disable_sync(&self, user_id: &str) -> Result<Profile> {
        let own = require_profile(self.store.as_ref(), user_id).await?;
        let next = plan_disable_sync(&own, &now_rfc3339());
        save_own_profile(self.store.as_ref(), &own, &next).await?;
        Ok(next)
    }

    /// Saves a local routine edit, stamped for the active channel.
    pub async fn save_routine(&self, user_id: &str, routine: Routine) -> Result<Routine> {
        let store = self.store.as_ref();
        let own = require_profile(store, user_id).await?;
        let partner = match own.routine_sync.partner_id.as_deref() {
            Some(partner_id) if own.routine_sync.enabled => load_profile(store, partner_id).await?,
            _ => None,
        };
        let stamped = stamp_routine_edit(&own, partner.as_ref(), routine, &now_rfc3339());
        let mut next = own.clone();
        next.routine = Some(stamped.clone());
        save_own_profile(store, &own, &next).await?;
        debug!(
            "Saved routine for {} (version {:?})",
            user_id,
            stamped.sync_meta.as_ref().map(|m| m.version)
        );
        Ok(stamped)
    }

    /// Asks the trigger to reset both sides' channel.
    pub async fn request_break_sync(&self, actor_id: &str, partner_id: &str) -> Result<String> {
        self.request(ActionType::BreakSync, actor_id, partner_id).await
    }

    /// Asks the trigger to push the actor's routine to the partner now.
    pub async fn request_sync_now(&self, actor_id: &str, partner_id: &str) -> Result<String> {
        self.request(ActionType::SyncNow, actor_id, partner_id).await
    }

    async fn request(
        &self,
        action_type: ActionType,
        actor_id: &str,
        partner_id: &str,
    ) -> Result<String> {
        let own = require_profile(self.store.as_ref(), actor_id).await?;
        if !own.has_partner(partner_id) {
            return Err(Error::code(
                ErrorCode::NotPartners,
                format!("'{}' is not a partner of '{}'", partner_id, actor_id),
            ));
        }
        let action = create_action(
            self.store.as_ref(),
            RelationshipAction::new(action_type, actor_id, actor_id, partner_id),
        )
        .await?;
        info!(
            "Queued {} action {} from {} to {}",
            action_type.as_str(),
            action.id,
            actor_id,
            partner_id
        );
        Ok(action.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{create_profile, PartnerRef};
    use crate::relationships::RELATIONSHIP_ACTIONS_COLLECTION;
    use crate::store::{InMemoryDocumentStore, Query};

    async fn partners(store: &InMemoryDocumentStore) {
        for (me, other) in [("a", "b"), ("b", "a")] {
            let mut profile = Profile::new(me, me.to_uppercase());
            profile.partners = vec![PartnerRef::new(other, other, other)];
            profile.partner_ids = vec![other.into()];
            create_profile(store, &profile).await.unwrap();
        }
    }

    #[tokio::test]
    async fn both_sides_converge_on_one_sync_id() {
        let store = Arc::new(InMemoryDocumentStore::new());
        partners(&store).await;
        let service = RoutineSyncService::new(store.clone());

        let a = service.enable_sync("a", "b", RoutineSyncMode::Auto).await.unwrap();
        let b = service.enable_sync("b", "a", RoutineSyncMode::Manual).await.unwrap();
        assert_eq!(a.routine_sync.sync_id, b.routine_sync.sync_id);

        let routine = Routine {
            name: "Push pull legs".into(),
            ..Default::default()
        };
        let stamped = service.save_routine("a", routine).await.unwrap();
        assert_eq!(stamped.sync_meta.unwrap().version, 1);

        service.disable_sync("a").await.unwrap();
        let a = require_profile(store.as_ref(), "a").await.unwrap();
        assert!(!a.routine_sync.enabled);
        assert!(service
            .set_mode("a", RoutineSyncMode::Auto)
            .await
            .unwrap_err()
            .is_code(ErrorCode::SyncNotAllowed));
    }

    #[tokio::test]
    async fn actions_are_only_queued_between_partners() {
        let store = Arc::new(InMemoryDocumentStore::new());
        partners(&store).await;
        let service = RoutineSyncService::new(store.clone());

        service.request_sync_now("a", "b").await.unwrap();
        let err = service.request_break_sync("a", "z").await.unwrap_err();
        assert!(err.is_code(ErrorCode::NotPartners));

        let actions = store
            .query(&Query::collection(RELATIONSHIP_ACTIONS_COLLECTION))
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].data["actionType"], "SYNC_NOW");
    }
}
