//! Pure profile transformations for the partner fields.
//!
//! Each plan takes the current profile and returns the next one; callers
//! persist the difference with the payload codec.

use crate::profiles::{PartnerRef, Profile, RoutineSync};

/// Result of planning a partner upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    pub profile: Profile,
    /// The profile was already exclusively linked to this exact partner.
    pub no_op: bool,
}

/// Replaces the partner set with `[partner]`.
///
/// A full overwrite: any prior partner is evicted. A sync channel pointing at
/// an evicted partner is reset.
pub fn plan_partner_upsert(profile: &Profile, partner: &PartnerRef, now: &str) -> UpsertPlan {
    if profile.is_exclusively_linked_to(partner) {
        return UpsertPlan {
            profile: profile.clone(),
            no_op: true,
        };
    }

    let mut next = profile.clone();
    next.partners = vec![partner.clone()];
    next.partner_ids = vec![partner.id.clone()];
    next.partner_id = Some(partner.id.clone());
    next.active_partner_id = Some(partner.id.clone());
    next.link_setup_pending_partner_id = Some(partner.id.clone());
    if let Some(stale) = next.routine_sync.partner_id.as_deref() {
        if stale != partner.id {
            next.routine_sync = RoutineSync::disabled(Some(now.to_string()));
        }
    }
    UpsertPlan {
        profile: next,
        no_op: false,
    }
}

fn references(profile: &Profile, partner_id: &str) -> bool {
    profile.has_partner(partner_id)
        || profile.partner_id.as_deref() == Some(partner_id)
        || profile.active_partner_id.as_deref() == Some(partner_id)
        || profile.link_setup_pending_partner_id.as_deref() == Some(partner_id)
        || profile.routine_sync.points_at(partner_id)
}

/// Removes `partner_id` from every partner field. `None` when the profile does
/// not reference it anywhere.
pub fn plan_partner_removal(profile: &Profile, partner_id: &str, now: &str) -> Option<Profile> {
    if !references(profile, partner_id) {
        return None;
    }

    let mut next = profile.clone();
    next.partners.retain(|p| p.id != partner_id);
    next.partner_ids.retain(|id| id != partner_id);
    let fallback = next.partners.first().map(|p| p.id.clone());
    if next.active_partner_id.as_deref() == Some(partner_id) {
        next.active_partner_id = fallback.clone();
    }
    if next.partner_id.as_deref() == Some(partner_id) {
        next.partner_id = fallback;
    }
    if next.link_setup_pending_partner_id.as_deref() == Some(partner_id) {
        next.link_setup_pending_partner_id = None;
    }
    if next.routine_sync.points_at(partner_id) {
        next.routine_sync = RoutineSync::disabled(Some(now.to_string()));
    }
    Some(next)
}

/// Rewrites the partner fields to exactly `resolved`. Stored partner details
/// are kept when the partner is already known. `None` when nothing changes.
pub fn plan_resolved_partners(
    profile: &Profile,
    resolved: &[PartnerRef],
    now: &str,
) -> Option<Profile> {
    let mut next = profile.clone();
    next.partners = resolved
        .iter()
        .map(|candidate| {
            profile
                .partners
                .iter()
                .find(|stored| stored.id == candidate.id)
                .cloned()
                .unwrap_or_else(|| candidate.clone())
        })
        .collect();
    next.partner_ids = next.partners.iter().map(|p| p.id.clone()).collect();

    let fallback = next.partner_ids.first().cloned();
    let keep_if_valid = |current: &Option<String>| match current {
        Some(id) if next.partner_ids.contains(id) => Some(id.clone()),
        _ => fallback.clone(),
    };
    next.active_partner_id = keep_if_valid(&profile.active_partner_id);
    next.partner_id = keep_if_valid(&profile.partner_id);

    if let Some(pending) = profile.link_setup_pending_partner_id.as_deref() {
        if !next.partner_ids.iter().any(|id| id == pending) {
            next.link_setup_pending_partner_id = None;
        }
    }
    if let Some(sync_partner) = profile.routine_sync.partner_id.as_deref() {
        if !next.partner_ids.iter().any(|id| id == sync_partner) {
            next.routine_sync = RoutineSync::disabled(Some(now.to_string()));
        }
    }

    if next == *profile {
        None
    } else {
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::RoutineSyncMode;

    const NOW: &str = "2026-10-14T12:00:00.000Z";

    fn partner(id: &str) -> PartnerRef {
        PartnerRef::new(id, format!("{}_alias", id), id.to_uppercase())
    }

    fn linked(owner: &str, other: &str) -> Profile {
        let mut profile = Profile::new(owner, owner.to_uppercase());
        profile.partners = vec![partner(other)];
        profile.partner_ids = vec![other.to_string()];
        profile.partner_id = Some(other.to_string());
        profile.active_partner_id = Some(other.to_string());
        profile
    }

    #[test]
    fn upsert_twice_is_a_no_op_the_second_time() {
        let profile = Profile::new("a", "A");
        let first = plan_partner_upsert(&profile, &partner("b"), NOW);
        assert!(!first.no_op);
        assert_eq!(first.profile.partner_ids, ["b"]);
        assert_eq!(first.profile.link_setup_pending_partner_id.as_deref(), Some("b"));

        let second = plan_partner_upsert(&first.profile, &partner("b"), NOW);
        assert!(second.no_op);
        assert_eq!(second.profile, first.profile);
    }

    #[test]
    fn upsert_evicts_previous_partner_and_its_sync_channel() {
        let mut profile = linked("a", "old");
        profile.routine_sync = RoutineSync {
            enabled: true,
            partner_id: Some("old".into()),
            mode: RoutineSyncMode::Auto,
            sync_id: Some("s1".into()),
            updated_at: None,
        };
        let plan = plan_partner_upsert(&profile, &partner("new"), NOW);
        assert_eq!(plan.profile.partners, vec![partner("new")]);
        assert!(!plan.profile.routine_sync.enabled);
        assert!(plan.profile.routine_sync.sync_id.is_none());
    }

    #[test]
    fn upsert_with_changed_details_is_not_a_no_op() {
        let profile = linked("a", "b");
        let mut renamed = partner("b");
        renamed.display_name = "Bee".into();
        let plan = plan_partner_upsert(&profile, &renamed, NOW);
        assert!(!plan.no_op);
        assert_eq!(plan.profile.partners[0].display_name, "Bee");
    }

    #[test]
    fn removal_falls_back_and_resets_sync() {
        let mut profile = linked("a", "b");
        profile.link_setup_pending_partner_id = Some("b".into());
        profile.routine_sync.enabled = true;
        profile.routine_sync.partner_id = Some("b".into());
        profile.routine_sync.sync_id = Some("s1".into());

        let next = plan_partner_removal(&profile, "b", NOW).unwrap();
        assert!(next.partners.is_empty());
        assert!(next.partner_ids.is_empty());
        assert!(next.partner_id.is_none());
        assert!(next.active_partner_id.is_none());
        assert!(next.link_setup_pending_partner_id.is_none());
        assert_eq!(next.routine_sync, RoutineSync::disabled(Some(NOW.into())));
    }

    #[test]
    fn removal_of_unknown_partner_is_none() {
        assert!(plan_partner_removal(&linked("a", "b"), "c", NOW).is_none());
    }

    #[test]
    fn resolved_set_keeps_stored_details_and_valid_pointers() {
        let mut profile = linked("a", "b");
        profile.partners[0].display_name = "Stored".into();
        assert!(plan_resolved_partners(&profile, &[partner("b")], NOW).is_none());

        let next = plan_resolved_partners(&profile, &[], NOW).unwrap();
        assert!(next.partner_ids.is_empty());
        assert!(next.active_partner_id.is_none());
    }
}
