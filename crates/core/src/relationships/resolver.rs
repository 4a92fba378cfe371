//! Relationship event resolver.
//!
//! Last-writer-wins by timestamp over accepted-link and unlink events. Pure:
//! only the timestamps carried by the events are compared, never "now".

use std::collections::HashMap;

use super::action_model::{ActionType, RelationshipAction};
use super::link_model::{LinkRequest, LinkRequestStatus};
use crate::profiles::PartnerRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedLinkEvent {
    pub partner: PartnerRef,
    pub accepted_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkEvent {
    pub partner_id: String,
    pub created_at_ms: i64,
}

/// Latest item per key. An equal timestamp replaces the earlier entry.
fn latest_by_key<'a, T, K, S>(items: &'a [T], key: K, stamp: S) -> HashMap<&'a str, &'a T>
where
    K: Fn(&'a T) -> &'a str,
    S: Fn(&T) -> i64,
{
    let mut latest: HashMap<&str, &T> = HashMap::new();
    for item in items {
        let id = key(item);
        if id.is_empty() {
            continue;
        }
        let replace = latest
            .get(id)
            .map_or(true, |current| stamp(item) >= stamp(*current));
        if replace {
            latest.insert(id, item);
        }
    }
    latest
}

/// Currently valid partners, most recently accepted first, at most `max_partners`.
pub fn resolve_active_partners(
    accepted: &[AcceptedLinkEvent],
    unlinked: &[UnlinkEvent],
    max_partners: usize,
) -> Vec<PartnerRef> {
    let latest_accepted = latest_by_key(accepted, |e| e.partner.id.as_str(), |e| e.accepted_at_ms);
    let latest_unlinked = latest_by_key(unlinked, |e| e.partner_id.as_str(), |e| e.created_at_ms);

    let mut survivors: Vec<&AcceptedLinkEvent> = latest_accepted
        .into_values()
        .filter(|event| match latest_unlinked.get(event.partner.id.as_str()) {
            Some(unlink) => event.accepted_at_ms > unlink.created_at_ms,
            None => true,
        })
        .collect();

    survivors.sort_by(|a, b| {
        b.accepted_at_ms
            .cmp(&a.accepted_at_ms)
            .then_with(|| a.partner.id.cmp(&b.partner.id))
    });
    survivors.truncate(max_partners);
    survivors.into_iter().map(|e| e.partner.clone()).collect()
}

/// Accepted-link events for `user_id` from requests in either direction.
pub fn accepted_events_for(user_id: &str, requests: &[LinkRequest]) -> Vec<AcceptedLinkEvent> {
    requests
        .iter()
        .filter(|r| r.status == LinkRequestStatus::Accepted)
        .filter_map(|r| {
            r.partner_ref_for(user_id).map(|partner| AcceptedLinkEvent {
                partner,
                accepted_at_ms: r.accepted_at_ms(),
            })
        })
        .collect()
}

/// Unlink events from the UNLINK actions in `user_id`'s own stream.
pub fn unlink_events_for(user_id: &str, actions: &[RelationshipAction]) -> Vec<UnlinkEvent> {
    actions
        .iter()
        .filter(|a| a.action_type == ActionType::Unlink && a.source_user_id == user_id)
        .map(|a| UnlinkEvent {
            partner_id: a.target_user_id.clone(),
            created_at_ms: a.created_at_ms(),
        })
        .collect()
}
