//! Server-side trigger handlers.
//!
//! The dispatcher plays the asynchronous trigger runtime: it sees every
//! committed transition and issues follow-up writes with access to both
//! profiles of a pair. Every handler is safe to run twice for the same event.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::RelationshipPolicy;
use crate::errors::{Error, ErrorCode, Result};
use crate::notifications::{NoOpNotificationSink, NotificationSink};
use crate::profiles::{
    all_profiles_query, autosave_patch, load_profile, normalize_profile, profile_path,
    user_id_from_profile_path, Profile,
};
use crate::relationships::link_service::{acceptance_superseded, partner_ref_from_profile};
use crate::relationships::unlink_service::finish_action;
use crate::relationships::{
    plan_partner_upsert, process_unlink_action, ActionStatus, ActionType, LinkRequest,
    LinkRequestStatus, RelationshipAction, LINK_REQUESTS_COLLECTION,
    RELATIONSHIP_ACTIONS_COLLECTION,
};
use crate::routine_requests::{
    ApplyOutcome, RoutineRequest, RoutineRequestService, RoutineRequestStatus,
    ROUTINE_REQUESTS_COLLECTION,
};
use crate::routine_sync::{
    auto_propagation_candidate, plan_auto_propagation, plan_break_sync, plan_sync_now,
};
use crate::store::{
    ChangeEvent, ChangeKind, Document, DocumentPatch, DocumentStore, Query, TxDecision,
    WriteBatch,
};
use crate::time_utils::now_rfc3339;

/// What a trigger did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Not a transition any handler reacts to.
    Ignored,
    /// The handler ran and state was already converged.
    NoOp,
    Applied,
    /// The handler ran and recorded a failure on the source document.
    Failed(String),
}

fn status_field(data: Option<&Value>) -> Option<&str> {
    data.and_then(|d| d.get("status")).and_then(Value::as_str)
}

pub struct TriggerDispatcher {
    store: Arc<dyn DocumentStore>,
    policy: RelationshipPolicy,
    routine_requests: RoutineRequestService,
}

impl TriggerDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RelationshipPolicy) -> Self {
        Self::with_notification_sink(store, policy, Arc::new(NoOpNotificationSink))
    }

    pub fn with_notification_sink(
        store: Arc<dyn DocumentStore>,
        policy: RelationshipPolicy,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let routine_requests =
            RoutineRequestService::new(store.clone(), policy.clone())
                .with_notification_sink(notifications);
        Self {
            store,
            policy,
            routine_requests,
        }
    }

    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<TriggerOutcome> {
        let collection = event.path.collection();
        let kind = event.kind();
        let Some(after) = event.after.as_ref() else {
            return Ok(TriggerOutcome::Ignored);
        };
        let doc = Document {
            path: event.path.clone(),
            data: after.clone(),
        };

        if collection == LINK_REQUESTS_COLLECTION {
            let accepted_now = status_field(event.before.as_ref())
                == Some(LinkRequestStatus::Pending.as_str())
                && status_field(Some(after)) == Some(LinkRequestStatus::Accepted.as_str());
            if kind == ChangeKind::Updated && accepted_now {
                return self.on_link_accepted(&LinkRequest::from_document(&doc)?).await;
            }
        } else if collection == RELATIONSHIP_ACTIONS_COLLECTION {
            if kind == ChangeKind::Created {
                return self
                    .on_action_created(&RelationshipAction::from_document(&doc)?)
                    .await;
            }
        } else if collection == ROUTINE_REQUESTS_COLLECTION {
            let accepted_now = status_field(event.before.as_ref())
                == Some(RoutineRequestStatus::Pending.as_str())
                && status_field(Some(after)) == Some(RoutineRequestStatus::Accepted.as_str());
            if kind == ChangeKind::Updated && accepted_now {
                return self.on_routine_request_accepted(doc.id()).await;
            }
        } else if let Some(user_id) = user_id_from_profile_path(&event.path) {
            if kind == ChangeKind::Updated {
                return self
                    .on_profile_updated(user_id, event.before.as_ref(), after)
                    .await;
            }
        }
        Ok(TriggerOutcome::Ignored)
    }

    /// Symmetric upsert on both profiles in one batch, unless either side
    /// has unlinked the other since the acceptance.
    async fn on_link_accepted(&self, request: &LinkRequest) -> Result<TriggerOutcome> {
        let store = self.store.as_ref();
        let (requester, recipient) = futures::try_join!(
            load_profile(store, &request.requester_id),
            load_profile(store, &request.recipient_id)
        )?;
        let (Some(requester), Some(recipient)) = (requester, recipient) else {
            warn!(
                "Link request {} accepted but a profile is missing; skipping",
                request.id
            );
            return Ok(TriggerOutcome::NoOp);
        };

        let now = now_rfc3339();
        let mut batch = WriteBatch::new();
        for (own, other, alias) in [
            (&requester, &recipient, request.recipient_alias.as_deref()),
            (&recipient, &requester, Some(request.requester_alias.as_str())),
        ] {
            if acceptance_superseded(store, request, &own.user_id).await? {
                info!(
                    "Link {} superseded by a later unlink for {}",
                    request.id, own.user_id
                );
                return Ok(TriggerOutcome::NoOp);
            }
            if !own.has_partner(&other.user_id)
                && own.partner_ids.len() >= self.policy.max_partners
            {
                warn!(
                    "Link {} skipped: {} is already linked to {:?}",
                    request.id, own.user_id, own.partner_ids
                );
                return Ok(TriggerOutcome::NoOp);
            }
            let partner = partner_ref_from_profile(other, alias);
            let plan = plan_partner_upsert(own, &partner, &now);
            if plan.no_op {
                continue;
            }
            if let Some(patch) = autosave_patch(own, &plan.profile, &now)? {
                batch.update(profile_path(&own.user_id)?, patch);
            }
        }

        if batch.is_empty() {
            debug!("Link {} already converged on both profiles", request.id);
            return Ok(TriggerOutcome::NoOp);
        }
        store.commit(batch).await?;
        info!(
            "Linked {} and {} from request {}",
            request.requester_id, request.recipient_id, request.id
        );
        Ok(TriggerOutcome::Applied)
    }

    async fn on_action_created(&self, action: &RelationshipAction) -> Result<TriggerOutcome> {
        if !action.is_pending() {
            return Ok(TriggerOutcome::NoOp);
        }
        match action.action_type {
            ActionType::Unlink => {
                let changed = process_unlink_action(self.store.as_ref(), action).await?;
                Ok(if changed {
                    TriggerOutcome::Applied
                } else {
                    TriggerOutcome::NoOp
                })
            }
            ActionType::BreakSync => self.on_break_sync(action).await,
            ActionType::SyncNow => self.on_sync_now(action).await,
        }
    }

    async fn on_break_sync(&self, action: &RelationshipAction) -> Result<TriggerOutcome> {
        let store = self.store.as_ref();
        let (source, target) = futures::try_join!(
            load_profile(store, &action.source_user_id),
            load_profile(store, &action.target_user_id)
        )?;
        let (Some(source), Some(target)) = (source, target) else {
            let error = ErrorCode::ProfileNotFound.as_str().to_string();
            finish_action(store, &action.id, ActionStatus::Failed, Some(error.clone())).await?;
            return Ok(TriggerOutcome::Failed(error));
        };

        let now = now_rfc3339();
        let (next_source, next_target) = plan_break_sync(&source, &target, &now);
        let mut batch = WriteBatch::new();
        for (prev, next) in [(&source, next_source), (&target, next_target)] {
            if let Some(next) = next {
                if let Some(patch) = autosave_patch(prev, &next, &now)? {
                    batch.update(profile_path(&prev.user_id)?, patch);
                }
            }
        }
        let changed = !batch.is_empty();
        if changed {
            store.commit(batch).await?;
        }
        finish_action(store, &action.id, ActionStatus::Processed, None).await?;
        info!(
            "Sync between {} and {} broken by action {}",
            action.source_user_id, action.target_user_id, action.id
        );
        Ok(if changed {
            TriggerOutcome::Applied
        } else {
            TriggerOutcome::NoOp
        })
    }

    async fn on_sync_now(&self, action: &RelationshipAction) -> Result<TriggerOutcome> {
        let store = self.store.as_ref();
        let (source, target) = futures::try_join!(
            load_profile(store, &action.source_user_id),
            load_profile(store, &action.target_user_id)
        )?;
        let now = now_rfc3339();
        let planned = match (&source, &target) {
            (Some(source), Some(target)) => plan_sync_now(source, target, &now),
            _ => Err(Error::code(ErrorCode::SyncNotAllowed, "profile missing")),
        };
        let (for_source, for_target) = match planned {
            Ok(routines) => routines,
            Err(err) if err.is_code(ErrorCode::SyncNotAllowed) => {
                warn!("Sync-now action {} not allowed: {}", action.id, err);
                let error = ErrorCode::SyncNotAllowed.as_str().to_string();
                finish_action(store, &action.id, ActionStatus::Failed, Some(error.clone()))
                    .await?;
                return Ok(TriggerOutcome::Failed(error));
            }
            Err(err) => return Err(err),
        };
        let (Some(source), Some(target)) = (source, target) else {
            return Err(Error::internal("sync-now planned without both profiles"));
        };

        let mut batch = WriteBatch::new();
        for (prev, routine) in [(&source, for_source), (&target, for_target)] {
            let mut next = prev.clone();
            next.routine = Some(routine);
            if let Some(patch) = autosave_patch(prev, &next, &now)? {
                batch.update(profile_path(&prev.user_id)?, patch);
            }
        }
        if !batch.is_empty() {
            store.commit(batch).await?;
        }
        finish_action(store, &action.id, ActionStatus::Processed, None).await?;
        info!(
            "Synced routine from {} to {} (action {})",
            action.source_user_id, action.target_user_id, action.id
        );
        Ok(TriggerOutcome::Applied)
    }

    async fn on_routine_request_accepted(&self, request_id: &str) -> Result<TriggerOutcome> {
        Ok(
            match self.routine_requests.apply_routine_request(request_id).await? {
                ApplyOutcome::Applied { .. } => TriggerOutcome::Applied,
                ApplyOutcome::Skipped { .. } => TriggerOutcome::NoOp,
                ApplyOutcome::Failed { error } => TriggerOutcome::Failed(error),
            },
        )
    }

    /// Auto-mode propagation. The partner write re-checks the partner's
    /// stored version inside a transaction so a concurrent newer edit is
    /// never overwritten.
    async fn on_profile_updated(
        &self,
        user_id: &str,
        before: Option<&Value>,
        after: &Value,
    ) -> Result<TriggerOutcome> {
        let after = normalize_profile(user_id, after)?;
        let before = before.map(|b| normalize_profile(user_id, b)).transpose()?;
        self.propagate_routine(before.as_ref(), &after).await
    }

    async fn propagate_routine(
        &self,
        before: Option<&Profile>,
        after: &Profile,
    ) -> Result<TriggerOutcome> {
        let user_id = after.user_id.as_str();
        let Some((partner_id, _, _)) = auto_propagation_candidate(before, after) else {
            return Ok(TriggerOutcome::Ignored);
        };
        let store = self.store.as_ref();
        let Some(partner) = load_profile(store, partner_id).await? else {
            return Ok(TriggerOutcome::NoOp);
        };
        let Some(routine) = plan_auto_propagation(before, after, &partner) else {
            debug!(
                "No auto-sync from {} to {}: partner is current or channel inactive",
                user_id, partner_id
            );
            return Ok(TriggerOutcome::NoOp);
        };
        let Some(meta) = routine.sync_meta.clone() else {
            return Ok(TriggerOutcome::NoOp);
        };

        let version = meta.version;
        let routine_value = serde_json::to_value(&routine)?;
        let outcome = store
            .transact(
                &profile_path(partner_id)?,
                Box::new(move |current: Option<&Value>| {
                    let Some(current) = current else {
                        return TxDecision::Abort("partner profile missing".to_string());
                    };
                    let stored = current.get("routine").and_then(|r| r.get("syncMeta"));
                    let stored_version = match stored {
                        Some(m)
                            if m.get("syncId").and_then(Value::as_str)
                                == Some(meta.sync_id.as_str()) =>
                        {
                            m.get("version").and_then(Value::as_i64).unwrap_or(0)
                        }
                        _ => 0,
                    };
                    if stored_version >= meta.version {
                        return TxDecision::Abort(format!(
                            "partner already at version {}",
                            stored_version
                        ));
                    }
                    TxDecision::Update(
                        DocumentPatch::new()
                            .with("routine", routine_value)
                            .with("updatedAt", now_rfc3339()),
                    )
                }),
            )
            .await?;
        if !outcome.is_committed() {
            debug!("Auto-sync to {} skipped: {:?}", partner_id, outcome);
            return Ok(TriggerOutcome::NoOp);
        }
        info!(
            "Auto-synced routine version {} from {} to {}",
            version,
            user_id,
            partner_id
        );
        Ok(TriggerOutcome::Applied)
    }

    /// Dispatches one event, logging instead of propagating handler errors.
    pub async fn handle(&self, event: &ChangeEvent) -> TriggerOutcome {
        match self.dispatch(event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Trigger for {} failed: {}", event.path, err);
                TriggerOutcome::Failed(err.to_string())
            }
        }
    }

    /// Handles every event already queued on `rx`, including the ones the
    /// handlers themselves produce, until the queue is empty. Returns how many
    /// events were acted on.
    pub async fn pump(&self, rx: &mut broadcast::Receiver<ChangeEvent>) -> Result<usize> {
        let mut acted = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if !matches!(self.handle(&event).await, TriggerOutcome::Ignored) {
                        acted += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Trigger feed lagged by {} event(s), catching up", skipped);
                    acted += self.catch_up().await?;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return Ok(acted),
            }
        }
    }

    /// Re-runs the handlers for work a lagging subscriber may have missed:
    /// accepted link requests, pending relationship actions, accepted and
    /// unapplied routine requests, and auto-mode routines the partner lacks.
    pub async fn catch_up(&self) -> Result<usize> {
        let store = self.store.as_ref();
        let mut handled = 0;

        let accepted_links = Query::collection(LINK_REQUESTS_COLLECTION)
            .where_eq("status", LinkRequestStatus::Accepted.as_str());
        for doc in store.query(&accepted_links).await? {
            let request = LinkRequest::from_document(&doc)?;
            if self.on_link_accepted(&request).await? == TriggerOutcome::Applied {
                handled += 1;
            }
        }

        let pending_actions = Query::collection(RELATIONSHIP_ACTIONS_COLLECTION)
            .where_eq("status", ActionStatus::Pending.as_str());
        for doc in store.query(&pending_actions).await? {
            let action = RelationshipAction::from_document(&doc)?;
            if self.on_action_created(&action).await? != TriggerOutcome::NoOp {
                handled += 1;
            }
        }

        let accepted = Query::collection(ROUTINE_REQUESTS_COLLECTION)
            .where_eq("status", RoutineRequestStatus::Accepted.as_str());
        for doc in store.query(&accepted).await? {
            let request = RoutineRequest::from_document(&doc)?;
            if request.apply_status.is_none()
                && self.on_routine_request_accepted(&request.id).await? != TriggerOutcome::NoOp
            {
                handled += 1;
            }
        }
        let auto_sync = all_profiles_query()
            .where_eq("routineSync.enabled", true)
            .where_eq("routineSync.mode", "auto");
        for doc in store.query(&auto_sync).await? {
            let Some(user_id) = user_id_from_profile_path(&doc.path) else {
                continue;
            };
            let profile = normalize_profile(user_id, &doc.data)?;
            if self.propagate_routine(None, &profile).await? == TriggerOutcome::Applied {
                handled += 1;
            }
        }

        if handled > 0 {
            info!("Catch-up handled {} pending item(s)", handled);
        }
        Ok(handled)
    }
}
