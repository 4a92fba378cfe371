use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde_json::Value;

use super::routine_request_model::{
    copy_direction, ApplyStatus, RoutineRequest, RoutineRequestStatus, RoutineRequestType,
    ROUTINE_REQUESTS_COLLECTION,
};
use crate::config::RelationshipPolicy;
use crate::errors::{Error, ErrorCode, Result};
use crate::notifications::{NoOpNotificationSink, Notification, NotificationSink};
use crate::profiles::{
    autosave_patch, profile_path, require_profile, validate_user_id, Profile, RoutineSync,
    RoutineSyncMode, SyncMeta,
};
use crate::routine_sync::new_sync_id;
use crate::store::{
    Direction, DocPath, DocumentPatch, DocumentStore, Query, TxDecision, TxOutcome, WriteBatch,
};
use crate::time_utils::{now_rfc3339, parse_timestamp, to_rfc3339};

#[derive(Debug, Clone)]
pub struct NewRoutineRequest {
    pub from_user_id: String,
    pub to_user_id: String,
    pub request_type: RoutineRequestType,
    pub sync_after_accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { sync_id: Option<String> },
    /// Already applied, being applied, or not accepted.
    Skipped { reason: String },
    /// Work failed and was recorded on the request.
    Failed { error: String },
}

pub fn routine_request_path(request_id: &str) -> Result<DocPath> {
    Ok(DocPath::doc(ROUTINE_REQUESTS_COLLECTION, request_id)?)
}

pub async fn load_routine_request(
    store: &dyn DocumentStore,
    request_id: &str,
) -> Result<RoutineRequest> {
    match store.get(&routine_request_path(request_id)?).await? {
        Some(doc) => RoutineRequest::from_document(&doc),
        None => Err(Error::code(
            ErrorCode::RequestNotFound,
            format!("routine request '{}' does not exist", request_id),
        )),
    }
}

fn status_of(doc: &Value) -> Option<&str> {
    doc.get("status").and_then(Value::as_str)
}

fn expired_doc(doc: &Value, now: DateTime<Utc>) -> bool {
    doc.get("expiresAt")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .map_or(true, |expires| expires <= now)
}

pub struct RoutineRequestService {
    store: Arc<dyn DocumentStore>,
    policy: RelationshipPolicy,
    notifications: Arc<dyn NotificationSink>,
}

impl RoutineRequestService {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RelationshipPolicy) -> Self {
        Self {
            store,
            policy,
            notifications: Arc::new(NoOpNotificationSink),
        }
    }

    pub fn with_notification_sink(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    pub async fn create_routine_request(&self, input: NewRoutineRequest) -> Result<RoutineRequest> {
        let from_id = validate_user_id(&input.from_user_id, ErrorCode::InvalidRequesterId)?;
        let to_id = validate_user_id(&input.to_user_id, ErrorCode::InvalidRecipientId)?;
        if from_id == to_id {
            return Err(Error::code(
                ErrorCode::InvalidRecipientId,
                "cannot send a routine request to yourself",
            ));
        }

        let store = self.store.as_ref();
        let (from, to) =
            futures::try_join!(require_profile(store, from_id), require_profile(store, to_id))?;
        if !can_exchange_routines(&from, &to) {
            return Err(Error::code(
                ErrorCode::NotPartners,
                format!("'{}' and '{}' are not partners", from_id, to_id),
            ));
        }
        let (source_id, target_id) = copy_direction(input.request_type, from_id, to_id);
        let source = if source_id == from_id { &from } else { &to };
        if source.routine.is_none() {
            return Err(Error::code(
                ErrorCode::NoRoutine,
                format!("'{}' has no routine to copy", source_id),
            ));
        }

        let now = Utc::now();
        let pending = Query::collection(ROUTINE_REQUESTS_COLLECTION)
            .where_eq("fromUserId", from_id)
            .where_eq("toUserId", to_id)
            .where_eq("status", RoutineRequestStatus::Pending.as_str());
        for doc in store.query(&pending).await? {
            let existing = RoutineRequest::from_document(&doc)?;
            if existing.is_live(now) {
                debug!(
                    "Routine request {} from {} to {} already pending",
                    existing.id, from_id, to_id
                );
                return Ok(existing);
            }
        }

        let mut request = RoutineRequest {
            id: String::new(),
            from_user_id: from_id.to_string(),
            from_name: from.label(),
            to_user_id: to_id.to_string(),
            to_name: to.label(),
            source_user_id: source_id.to_string(),
            target_user_id: target_id.to_string(),
            request_type: input.request_type,
            status: RoutineRequestStatus::Pending,
            sync_after_accept: input.sync_after_accept,
            created_at: to_rfc3339(now),
            expires_at: to_rfc3339(now + self.policy.routine_request_ttl()),
            apply_status: None,
            apply_error: None,
            applied_at: None,
            resolved_at: None,
        };
        let path = store
            .add(ROUTINE_REQUESTS_COLLECTION, serde_json::to_value(&request)?)
            .await?;
        request.id = path.id().to_string();
        info!(
            "Created routine request {} ({:?}) from {} to {}",
            request.id, request.request_type, from_id, to_id
        );
        self.notifications.emit(Notification::routine_request_received(
            to_id,
            from_id,
            &request.id,
        ));
        Ok(request)
    }

    /// Moves a live pending request to `to`, guarded inside one transaction.
    async fn transition(&self, request_id: &str, to: RoutineRequestStatus) -> Result<bool> {
        let now = Utc::now();
        let outcome = self
            .store
            .transact(
                &routine_request_path(request_id)?,
                Box::new(move |current: Option<&Value>| {
                    let Some(current) = current else {
                        return TxDecision::Abort("missing".to_string());
                    };
                    match status_of(current) {
                        Some(status) if status == RoutineRequestStatus::Pending.as_str() => {
                            if expired_doc(current, now) {
                                TxDecision::Abort(RoutineRequestStatus::Expired.as_str().to_string())
                            } else {
                                TxDecision::Update(
                                    DocumentPatch::new()
                                        .with("status", to.as_str())
                                        .with("resolvedAt", to_rfc3339(now)),
                                )
                            }
                        }
                        Some(status) => TxDecision::Abort(status.to_string()),
                        None => TxDecision::Abort("unknown".to_string()),
                    }
                }),
            )
            .await?;
        match outcome {
            TxOutcome::Committed => Ok(true),
            TxOutcome::Aborted(reason) if reason == to.as_str() => Ok(false),
            TxOutcome::Aborted(reason) if reason == "missing" => Err(Error::code(
                ErrorCode::RequestNotFound,
                format!("routine request '{}' does not exist", request_id),
            )),
            TxOutcome::Aborted(reason) if reason == RoutineRequestStatus::Expired.as_str() => {
                Err(Error::code(
                    ErrorCode::RequestExpired,
                    format!("routine request '{}' has expired", request_id),
                ))
            }
            TxOutcome::Aborted(reason) => Err(Error::code(
                ErrorCode::RequestNotPending,
                format!("routine request '{}' is {}", request_id, reason),
            )),
        }
    }

    async fn require_party(
        &self,
        request_id: &str,
        user_id: &str,
        recipient: bool,
    ) -> Result<RoutineRequest> {
        let request = load_routine_request(self.store.as_ref(), request_id).await?;
        let party = if recipient {
            &request.to_user_id
        } else {
            &request.from_user_id
        };
        if party != user_id {
            return Err(Error::code(
                if recipient {
                    ErrorCode::InvalidRecipientId
                } else {
                    ErrorCode::InvalidRequesterId
                },
                format!("'{}' cannot act on routine request '{}'", user_id, request_id),
            ));
        }
        Ok(request)
    }

    /// Accepts; the copy itself happens in [`Self::apply_routine_request`].
    pub async fn accept(&self, request_id: &str, user_id: &str) -> Result<()> {
        self.require_party(request_id, user_id, true).await?;
        self.transition(request_id, RoutineRequestStatus::Accepted).await?;
        Ok(())
    }

    pub async fn decline(&self, request_id: &str, user_id: &str) -> Result<()> {
        self.require_party(request_id, user_id, true).await?;
        self.transition(request_id, RoutineRequestStatus::Declined).await?;
        Ok(())
    }

    pub async fn cancel(&self, request_id: &str, user_id: &str) -> Result<()> {
        self.require_party(request_id, user_id, false).await?;
        self.transition(request_id, RoutineRequestStatus::Cancelled).await?;
        Ok(())
    }

    async fn list_live(
        &self,
        field: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutineRequest>> {
        let query = Query::collection(ROUTINE_REQUESTS_COLLECTION)
            .where_eq(field, user_id)
            .where_eq("status", RoutineRequestStatus::Pending.as_str())
            .order_by("createdAt", Direction::Asc);
        let mut live = Vec::new();
        for doc in self.store.query(&query).await? {
            let request = RoutineRequest::from_document(&doc)?;
            if request.is_live(now) {
                live.push(request);
            }
        }
        Ok(live)
    }

    /// Live requests addressed to `user_id`; expired ones are hidden.
    pub async fn list_incoming(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutineRequest>> {
        self.list_live("toUserId", user_id, now).await
    }

    pub async fn list_outgoing(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutineRequest>> {
        self.list_live("fromUserId", user_id, now).await
    }

    /// Claims an accepted request for application: `applyStatus` moves to
    /// `processing` unless it is already `processing` or `applied`.
    async fn claim(&self, request_id: &str) -> Result<Option<String>> {
        let outcome = self
            .store
            .transact(
                &routine_request_path(request_id)?,
                Box::new(|current: Option<&Value>| {
                    let Some(current) = current else {
                        return TxDecision::Abort("missing".to_string());
                    };
                    if status_of(current) != Some(RoutineRequestStatus::Accepted.as_str()) {
                        return TxDecision::Abort("not accepted".to_string());
                    }
                    match current.get("applyStatus").and_then(Value::as_str) {
                        Some(s) if s == ApplyStatus::Applied.as_str() => {
                            TxDecision::Abort("already applied".to_string())
                        }
                        Some(s) if s == ApplyStatus::Processing.as_str() => {
                            TxDecision::Abort("already processing".to_string())
                        }
                        _ => TxDecision::Update(
                            DocumentPatch::new()
                                .with("applyStatus", ApplyStatus::Processing.as_str())
                                .with("applyError", Value::Null),
                        ),
                    }
                }),
            )
            .await?;
        match outcome {
            TxOutcome::Committed => Ok(None),
            TxOutcome::Aborted(reason) if reason == "missing" => Err(Error::code(
                ErrorCode::RequestNotFound,
                format!("routine request '{}' does not exist", request_id),
            )),
            TxOutcome::Aborted(reason) => Ok(Some(reason)),
        }
    }

    /// Copies the routine of an accepted request exactly once.
    pub async fn apply_routine_request(&self, request_id: &str) -> Result<ApplyOutcome> {
        if let Some(reason) = self.claim(request_id).await? {
            debug!("Skipping routine request {}: {}", request_id, reason);
            return Ok(ApplyOutcome::Skipped { reason });
        }

        match self.copy_routine(request_id).await {
            Ok((request, sync_id)) => {
                info!(
                    "Applied routine request {}: {} -> {}",
                    request_id, request.source_user_id, request.target_user_id
                );
                self.notifications.emit(Notification::routine_applied(
                    &request.target_user_id,
                    &request.source_user_id,
                    request_id,
                ));
                Ok(ApplyOutcome::Applied { sync_id })
            }
            Err(err) => {
                let message = err.to_string();
                error!("Routine request {} failed to apply: {}", request_id, message);
                let patch = DocumentPatch::new()
                    .with("applyStatus", ApplyStatus::Failed.as_str())
                    .with("applyError", message.clone());
                self.store
                    .update(&routine_request_path(request_id)?, patch)
                    .await?;
                Ok(ApplyOutcome::Failed { error: message })
            }
        }
    }

    async fn copy_routine(&self, request_id: &str) -> Result<(RoutineRequest, Option<String>)> {
        let store = self.store.as_ref();
        let request = load_routine_request(store, request_id).await?;
        let (source, target) = futures::try_join!(
            require_profile(store, &request.source_user_id),
            require_profile(store, &request.target_user_id)
        )?;
        let routine = source.routine.clone().ok_or_else(|| {
            Error::code(
                ErrorCode::NoRoutine,
                format!("'{}' has no routine to copy", source.user_id),
            )
        })?;

        let now = now_rfc3339();
        let mut next_source = source.clone();
        let mut next_target = target.clone();
        let mut copied = routine;
        copied.updated_at = Some(now.clone());

        let sync_id = if request.sync_after_accept {
            let sync_id = new_sync_id();
            copied.sync_meta = Some(SyncMeta {
                sync_id: sync_id.clone(),
                version: 1,
                updated_by: source.user_id.clone(),
                updated_at: Some(now.clone()),
            });
            next_source.routine = Some(copied.clone());
            next_source.routine_sync = channel_towards(&target.user_id, &sync_id, &now);
            next_target.routine_sync = channel_towards(&source.user_id, &sync_id, &now);
            Some(sync_id)
        } else {
            copied.sync_meta = None;
            None
        };
        next_target.routine = Some(copied);

        let mut batch = WriteBatch::new();
        for (prev, next) in [(&source, &next_source), (&target, &next_target)] {
            if let Some(patch) = autosave_patch(prev, next, &now)? {
                batch.update(profile_path(&next.user_id)?, patch);
            }
        }
        batch.update(
            routine_request_path(request_id)?,
            DocumentPatch::new()
                .with("applyStatus", ApplyStatus::Applied.as_str())
                .with("appliedAt", now.clone()),
        );
        store.commit(batch).await?;
        Ok((request, sync_id))
    }

    /// Flips pending requests past their expiry to `expired`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let query = Query::collection(ROUTINE_REQUESTS_COLLECTION)
            .where_eq("status", RoutineRequestStatus::Pending.as_str());
        let expired: Vec<DocPath> = self
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter(|doc| expired_doc(&doc.data, now))
            .map(|doc| doc.path)
            .collect();

        for chunk in expired.chunks(self.policy.effective_batch_limit()) {
            let mut batch = WriteBatch::new();
            for path in chunk {
                batch.update(
                    path.clone(),
                    DocumentPatch::new()
                        .with("status", RoutineRequestStatus::Expired.as_str())
                        .with("resolvedAt", to_rfc3339(now)),
                );
            }
            self.store.commit(batch).await?;
        }
        if !expired.is_empty() {
            info!("Expired {} routine request(s)", expired.len());
        }
        Ok(expired.len())
    }
}

fn channel_towards(partner_id: &str, sync_id: &str, now: &str) -> RoutineSync {
    RoutineSync {
        enabled: true,
        partner_id: Some(partner_id.to_string()),
        mode: RoutineSyncMode::Manual,
        sync_id: Some(sync_id.to_string()),
        updated_at: Some(now.to_string()),
    }
}

/// True for profiles that can exchange routines with each other.
pub fn can_exchange_routines(a: &Profile, b: &Profile) -> bool {
    a.has_partner(&b.user_id) && b.has_partner(&a.user_id)
}
