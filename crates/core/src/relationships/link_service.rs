//! Partner link protocol.
//!
//! Every command writes only the acting user's own profile plus request
//! documents. The opposite profile converges through the link trigger or the
//! other client's own [`LinkService::sync_accepted_sent_requests`].

use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;

use super::action_model::{ActionType, RelationshipAction, RELATIONSHIP_ACTIONS_COLLECTION};
use super::link_model::{LinkRequest, LinkRequestStatus, LINK_REQUESTS_COLLECTION};
use super::partner_update::plan_partner_upsert;
use super::resolver::{
    accepted_events_for, resolve_active_partners, unlink_events_for, AcceptedLinkEvent,
};
use crate::config::RelationshipPolicy;
use crate::errors::{Error, ErrorCode, Result};
use crate::notifications::{NoOpNotificationSink, Notification, NotificationSink};
use crate::profiles::{
    load_profile, require_profile, save_own_profile, validate_user_id, PartnerRef, Profile,
};
use crate::store::{
    Direction, DocPath, DocumentPatch, DocumentStore, Query, TxDecision, TxOutcome, Watch,
};
use crate::time_utils::now_rfc3339;

const ABORT_MISSING: &str = "missing";

#[derive(Debug, Clone)]
pub struct SendLinkRequest {
    pub requester_id: String,
    pub requester_alias: String,
    pub recipient_id: String,
    pub recipient_alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendLinkOutcome {
    /// A new pending request was written.
    Created { request_id: String },
    /// The same request is already pending; nothing was written.
    AlreadyPending { request_id: String },
    /// The recipient had already asked; their request is now accepted.
    AutoAccepted {
        request_id: String,
        partner: PartnerRef,
        no_op: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkAccepted {
    pub partner: PartnerRef,
    pub no_op: bool,
}

pub fn link_request_path(request_id: &str) -> Result<DocPath> {
    Ok(DocPath::doc(LINK_REQUESTS_COLLECTION, request_id)?)
}

pub async fn load_link_request(store: &dyn DocumentStore, request_id: &str) -> Result<LinkRequest> {
    match store.get(&link_request_path(request_id)?).await? {
        Some(doc) => LinkRequest::from_document(&doc),
        None => Err(Error::code(
            ErrorCode::RequestNotFound,
            format!("link request '{}' does not exist", request_id),
        )),
    }
}

/// Requests from `requester_id` to `recipient_id` with `status`.
pub async fn find_link_requests(
    store: &dyn DocumentStore,
    requester_id: &str,
    recipient_id: &str,
    status: LinkRequestStatus,
) -> Result<Vec<LinkRequest>> {
    let query = Query::collection(LINK_REQUESTS_COLLECTION)
        .where_eq("requesterId", requester_id)
        .where_eq("recipientId", recipient_id)
        .where_eq("status", status.as_str());
    store
        .query(&query)
        .await?
        .iter()
        .map(LinkRequest::from_document)
        .collect()
}

/// Accepted requests in either direction that involve `user_id`.
pub async fn accepted_requests_for(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Result<Vec<LinkRequest>> {
    let accepted = LinkRequestStatus::Accepted.as_str();
    let sent = Query::collection(LINK_REQUESTS_COLLECTION)
        .where_eq("requesterId", user_id)
        .where_eq("status", accepted);
    let received = Query::collection(LINK_REQUESTS_COLLECTION)
        .where_eq("recipientId", user_id)
        .where_eq("status", accepted);
    let (sent, received) = futures::try_join!(store.query(&sent), store.query(&received))?;
    sent.iter()
        .chain(received.iter())
        .map(LinkRequest::from_document)
        .collect()
}

/// UNLINK actions in `user_id`'s own stream.
pub async fn own_unlink_actions(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Result<Vec<RelationshipAction>> {
    let query = Query::collection(RELATIONSHIP_ACTIONS_COLLECTION)
        .where_eq("sourceUserId", user_id)
        .where_eq("actionType", ActionType::Unlink.as_str());
    store
        .query(&query)
        .await?
        .iter()
        .map(RelationshipAction::from_document)
        .collect()
}

/// True when `user_id`'s own stream holds an UNLINK of the counterpart at or
/// after the request's acceptance.
pub async fn acceptance_superseded(
    store: &dyn DocumentStore,
    request: &LinkRequest,
    user_id: &str,
) -> Result<bool> {
    let Some(partner) = request.partner_ref_for(user_id) else {
        return Ok(false);
    };
    let accepted = [AcceptedLinkEvent {
        partner,
        accepted_at_ms: request.accepted_at_ms(),
    }];
    let unlinks = own_unlink_actions(store, user_id).await?;
    Ok(resolve_active_partners(&accepted, &unlink_events_for(user_id, &unlinks), 1).is_empty())
}

/// Moves a pending request to `to`. Returns `false` when it already was in `to`.
pub async fn transition_link_request(
    store: &dyn DocumentStore,
    request_id: &str,
    to: LinkRequestStatus,
) -> Result<bool> {
    let path = link_request_path(request_id)?;
    let outcome = store
        .transact(
            &path,
            Box::new(move |current: Option<&Value>| {
                let Some(current) = current else {
                    return TxDecision::Abort(ABORT_MISSING.to_string());
                };
                match current.get("status").and_then(Value::as_str) {
                    Some(status) if status == LinkRequestStatus::Pending.as_str() => {
                        TxDecision::Update(
                            DocumentPatch::new()
                                .with("status", to.as_str())
                                .with("resolvedAt", now_rfc3339()),
                        )
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
        TxOutcome::Aborted(reason) if reason == ABORT_MISSING => Err(Error::code(
            ErrorCode::RequestNotFound,
            format!("link request '{}' does not exist", request_id),
        )),
        TxOutcome::Aborted(reason) => Err(Error::code(
            ErrorCode::RequestNotPending,
            format!("link request '{}' is {}", request_id, reason),
        )),
    }
}

/// Partner reference describing `profile`'s owner.
pub fn partner_ref_from_profile(profile: &Profile, alias_hint: Option<&str>) -> PartnerRef {
    let alias = profile
        .alias
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .or(alias_hint)
        .unwrap_or_default();
    PartnerRef::new(profile.user_id.clone(), alias, profile.label())
}

/// Makes `partner` the sole partner of `user_id`'s own profile.
/// Returns whether it already was.
pub async fn upsert_own_partner(
    store: &dyn DocumentStore,
    user_id: &str,
    partner: &PartnerRef,
) -> Result<bool> {
    let profile = require_profile(store, user_id).await?;
    let plan = plan_partner_upsert(&profile, partner, &now_rfc3339());
    if plan.no_op {
        debug!("User {} already linked to {}", user_id, partner.id);
        return Ok(true);
    }
    save_own_profile(store, &profile, &plan.profile).await?;
    info!("User {} linked to partner {}", user_id, partner.id);
    Ok(false)
}

fn check_linkable(requester: &Profile, recipient: &Profile) -> Result<()> {
    let requester_link = requester.linked_partner_id();
    let recipient_link = recipient.linked_partner_id();

    if let Some(current) = requester_link {
        if current != recipient.user_id {
            return Err(Error::code(
                ErrorCode::AlreadyHasPartner,
                format!("user '{}' is already linked", requester.user_id),
            ));
        }
    }
    if let Some(current) = recipient_link {
        if current != requester.user_id {
            return Err(Error::code(
                ErrorCode::RecipientAlreadyHasPartner,
                format!("user '{}' is already linked", recipient.user_id),
            ));
        }
    }
    if requester_link == Some(recipient.user_id.as_str())
        && recipient_link == Some(requester.user_id.as_str())
    {
        return Err(Error::code(
            ErrorCode::AlreadyLinked,
            format!("'{}' and '{}' are already linked", requester.user_id, recipient.user_id),
        ));
    }
    Ok(())
}

pub struct LinkService {
    store: Arc<dyn DocumentStore>,
    policy: RelationshipPolicy,
    notifications: Arc<dyn NotificationSink>,
}

impl LinkService {
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

    pub async fn send_link_request(&self, input: SendLinkRequest) -> Result<SendLinkOutcome> {
        let requester_id =
            validate_user_id(&input.requester_id, ErrorCode::InvalidRequesterId)?.to_string();
        let recipient_id =
            validate_user_id(&input.recipient_id, ErrorCode::InvalidRecipientId)?.to_string();
        let requester_alias = input.requester_alias.trim().to_string();
        if requester_alias.is_empty() {
            return Err(Error::code(
                ErrorCode::InvalidRequesterAlias,
                "requester alias is required",
            ));
        }
        if requester_id == recipient_id {
            return Err(Error::code(
                ErrorCode::CannotLinkSelf,
                "cannot send a link request to yourself",
            ));
        }

        let store = self.store.as_ref();
        let (requester, recipient) = futures::try_join!(
            require_profile(store, &requester_id),
            require_profile(store, &recipient_id)
        )?;
        check_linkable(&requester, &recipient)?;

        let (direct, reciprocal, accepted_out, accepted_in) = futures::try_join!(
            find_link_requests(store, &requester_id, &recipient_id, LinkRequestStatus::Pending),
            find_link_requests(store, &recipient_id, &requester_id, LinkRequestStatus::Pending),
            find_link_requests(store, &requester_id, &recipient_id, LinkRequestStatus::Accepted),
            find_link_requests(store, &recipient_id, &requester_id, LinkRequestStatus::Accepted),
        )?;

        if !accepted_out.is_empty() || !accepted_in.is_empty() {
            // Accepted records are kept forever; only a link the resolver still
            // considers current blocks a new request.
            let accepted: Vec<LinkRequest> = accepted_out.into_iter().chain(accepted_in).collect();
            let unlinks = own_unlink_actions(store, &requester_id).await?;
            let active = resolve_active_partners(
                &accepted_events_for(&requester_id, &accepted),
                &unlink_events_for(&requester_id, &unlinks),
                self.policy.max_partners,
            );
            if active.iter().any(|p| p.id == recipient_id) {
                return Err(Error::code(
                    ErrorCode::AlreadyLinked,
                    format!("'{}' and '{}' are already linked", requester_id, recipient_id),
                ));
            }
        }

        if let Some(existing) = direct.first() {
            debug!(
                "Link request {} from {} to {} already pending",
                existing.id, requester_id, recipient_id
            );
            return Ok(SendLinkOutcome::AlreadyPending {
                request_id: existing.id.clone(),
            });
        }

        if let Some(reciprocal) = reciprocal.first() {
            transition_link_request(store, &reciprocal.id, LinkRequestStatus::Accepted).await?;
            let partner = partner_ref_from_profile(&recipient, Some(&reciprocal.requester_alias));
            let no_op = upsert_own_partner(store, &requester_id, &partner).await?;
            info!(
                "Auto-accepted reciprocal link request {} between {} and {}",
                reciprocal.id, recipient_id, requester_id
            );
            self.notifications
                .emit(Notification::link_accepted(&recipient_id, &requester_id));
            return Ok(SendLinkOutcome::AutoAccepted {
                request_id: reciprocal.id.clone(),
                partner,
                no_op,
            });
        }

        let request = LinkRequest {
            id: String::new(),
            requester_id: requester_id.clone(),
            requester_alias,
            recipient_id: recipient_id.clone(),
            recipient_alias: input
                .recipient_alias
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            status: LinkRequestStatus::Pending,
            created_at: now_rfc3339(),
            resolved_at: None,
        };
        let path = store
            .add(LINK_REQUESTS_COLLECTION, serde_json::to_value(&request)?)
            .await?;
        let request_id = path.id().to_string();
        info!(
            "Created link request {} from {} to {}",
            request_id, requester_id, recipient_id
        );
        self.notifications.emit(Notification::link_request_received(
            &recipient_id,
            &requester_id,
            &request_id,
        ));
        Ok(SendLinkOutcome::Created { request_id })
    }

    /// Accepts a request addressed to `accepting_user_id` and links the
    /// requester into the accepting user's own profile.
    pub async fn accept_link_request(
        &self,
        request_id: &str,
        accepting_user_id: &str,
    ) -> Result<LinkAccepted> {
        let store = self.store.as_ref();
        let request = load_link_request(store, request_id).await?;
        if request.recipient_id != accepting_user_id {
            return Err(Error::code(
                ErrorCode::InvalidRecipientId,
                format!(
                    "link request '{}' is not addressed to '{}'",
                    request_id, accepting_user_id
                ),
            ));
        }
        if request.status == LinkRequestStatus::Declined {
            return Err(Error::code(
                ErrorCode::RequestNotPending,
                format!("link request '{}' was declined", request_id),
            ));
        }
        if request.status == LinkRequestStatus::Accepted
            && acceptance_superseded(store, &request, accepting_user_id).await?
        {
            return Err(Error::code(
                ErrorCode::RequestNotPending,
                format!(
                    "link request '{}' was superseded by a later unlink",
                    request_id
                ),
            ));
        }

        let (recipient, requester) = futures::try_join!(
            require_profile(store, &request.recipient_id),
            load_profile(store, &request.requester_id)
        )?;
        if let Some(current) = recipient.linked_partner_id() {
            if current != request.requester_id {
                return Err(Error::code(
                    ErrorCode::AlreadyHasPartner,
                    format!("user '{}' is already linked", recipient.user_id),
                ));
            }
        }

        if request.status == LinkRequestStatus::Pending {
            transition_link_request(store, request_id, LinkRequestStatus::Accepted).await?;
        }

        let partner = match &requester {
            Some(profile) => partner_ref_from_profile(profile, Some(&request.requester_alias)),
            None => request
                .partner_ref_for(accepting_user_id)
                .ok_or_else(|| Error::internal("request does not involve its recipient"))?,
        };
        let no_op = upsert_own_partner(store, accepting_user_id, &partner).await?;
        self.notifications.emit(Notification::link_accepted(
            &request.requester_id,
            &request.recipient_id,
        ));
        Ok(LinkAccepted { partner, no_op })
    }

    pub async fn decline_link_request(&self, request_id: &str, declining_user_id: &str) -> Result<()> {
        let store = self.store.as_ref();
        let request = load_link_request(store, request_id).await?;
        if request.recipient_id != declining_user_id {
            return Err(Error::code(
                ErrorCode::InvalidRecipientId,
                format!(
                    "link request '{}' is not addressed to '{}'",
                    request_id, declining_user_id
                ),
            ));
        }
        if transition_link_request(store, request_id, LinkRequestStatus::Declined).await? {
            info!("Link request {} declined by {}", request_id, declining_user_id);
        }
        Ok(())
    }

    /// Pending requests addressed to `user_id`, oldest first.
    pub async fn incoming_requests(&self, user_id: &str) -> Result<Vec<LinkRequest>> {
        let query = Query::collection(LINK_REQUESTS_COLLECTION)
            .where_eq("recipientId", user_id)
            .where_eq("status", LinkRequestStatus::Pending.as_str())
            .order_by("createdAt", Direction::Asc);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(LinkRequest::from_document)
            .collect()
    }

    /// Change feed over requests `user_id` has sent.
    pub fn watch_sent_requests(&self, user_id: &str) -> Watch {
        Watch::new(
            self.store.as_ref(),
            Query::collection(LINK_REQUESTS_COLLECTION).where_eq("requesterId", user_id),
        )
    }

    /// Requester side of convergence: links the partner from the user's
    /// accepted sent requests, unless a later unlink superseded them.
    pub async fn sync_accepted_sent_requests(&self, user_id: &str) -> Result<Option<LinkAccepted>> {
        let store = self.store.as_ref();
        let user_id = validate_user_id(user_id, ErrorCode::InvalidUserId)?;
        let sent = Query::collection(LINK_REQUESTS_COLLECTION)
            .where_eq("requesterId", user_id)
            .where_eq("status", LinkRequestStatus::Accepted.as_str());
        let (docs, unlinks) = futures::try_join!(
            async { store.query(&sent).await.map_err(Error::from) },
            own_unlink_actions(store, user_id)
        )?;
        let requests = docs
            .iter()
            .map(LinkRequest::from_document)
            .collect::<Result<Vec<_>>>()?;

        let resolved = resolve_active_partners(
            &accepted_events_for(user_id, &requests),
            &unlink_events_for(user_id, &unlinks),
            self.policy.max_partners,
        );
        let Some(candidate) = resolved.into_iter().next() else {
            return Ok(None);
        };

        let partner = match load_profile(store, &candidate.id).await? {
            Some(profile) => partner_ref_from_profile(&profile, Some(&candidate.alias)),
            None => candidate,
        };
        let no_op = upsert_own_partner(store, user_id, &partner).await?;
        Ok(Some(LinkAccepted { partner, no_op }))
    }
}
