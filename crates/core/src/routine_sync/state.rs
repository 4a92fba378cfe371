//! Routine sync state machine.
//!
//! `disabled ⇄ manual ⇄ auto`. A channel is real only when both profiles are
//! enabled, point at each other and store the same non-null `syncId`.
//! Routine bodies are ordered by `syncMeta.version`, a strictly increasing
//! integer per `syncId`; wall-clock timestamps are never compared here.

use uuid::Uuid;

use crate::errors::{Error, ErrorCode, Result};
use crate::profiles::{Profile, Routine, RoutineSync, RoutineSyncMode, SyncMeta};

/// An agreed sync channel between two profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChannel {
    pub sync_id: String,
    pub left: String,
    pub right: String,
}

fn side_points_at<'a>(profile: &'a Profile, other_id: &str) -> Option<&'a str> {
    let sync = &profile.routine_sync;
    if !sync.enabled || !sync.points_at(other_id) || !profile.has_partner(other_id) {
        return None;
    }
    sync.sync_id.as_deref().filter(|id| !id.is_empty())
}

/// The channel both sides agree on, if any. A one-sided or mismatched
/// `syncId` is inert.
pub fn effective_channel(a: &Profile, b: &Profile) -> Option<SyncChannel> {
    let a_id = side_points_at(a, &b.user_id)?;
    let b_id = side_points_at(b, &a.user_id)?;
    (a_id == b_id).then(|| SyncChannel {
        sync_id: a_id.to_string(),
        left: a.user_id.clone(),
        right: b.user_id.clone(),
    })
}

pub fn new_sync_id() -> String {
    Uuid::new_v4().to_string()
}

/// Enables sync towards `partner_id` in `mode`, reusing a `syncId` that
/// either side already holds for this pair.
pub fn plan_enable_sync(
    own: &Profile,
    partner_id: &str,
    partner: Option<&Profile>,
    mode: RoutineSyncMode,
    now: &str,
) -> Result<Profile> {
    if !own.has_partner(partner_id) {
        return Err(Error::code(
            ErrorCode::NotPartners,
            format!("'{}' is not a partner of '{}'", partner_id, own.user_id),
        ));
    }
    let own_id = own
        .routine_sync
        .sync_id
        .clone()
        .filter(|_| own.routine_sync.points_at(partner_id));
    let partner_id_for_us = partner
        .filter(|p| p.routine_sync.points_at(&own.user_id))
        .and_then(|p| p.routine_sync.sync_id.clone());
    let sync_id = partner_id_for_us
        .or(own_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_sync_id);

    let mut next = own.clone();
    next.routine_sync = RoutineSync {
        enabled: true,
        partner_id: Some(partner_id.to_string()),
        mode,
        sync_id: Some(sync_id),
        updated_at: Some(now.to_string()),
    };
    Ok(next)
}

/// Switches between `manual` and `auto` on an enabled channel.
pub fn plan_set_mode(own: &Profile, mode: RoutineSyncMode, now: &str) -> Result<Profile> {
    if !own.routine_sync.enabled {
        return Err(Error::code(
            ErrorCode::SyncNotAllowed,
            format!("routine sync is disabled for '{}'", own.user_id),
        ));
    }
    let mut next = own.clone();
    if next.routine_sync.mode != mode {
        next.routine_sync.mode = mode;
        next.routine_sync.updated_at = Some(now.to_string());
    }
    Ok(next)
}

pub fn plan_disable_sync(own: &Profile, now: &str) -> Profile {
    let mut next = own.clone();
    if next.routine_sync.enabled || next.routine_sync.sync_id.is_some() {
        next.routine_sync = RoutineSync::disabled(Some(now.to_string()));
    }
    next
}

/// Prepares a locally edited routine for storage.
///
/// With a live channel the routine gets `syncMeta` one past the highest
/// version either side knows; otherwise stale `syncMeta` is stripped.
/// `partner` may be `None` when the partner document is not at hand, in which
/// case only the own side is checked.
pub fn stamp_routine_edit(
    own: &Profile,
    partner: Option<&Profile>,
    mut routine: Routine,
    now: &str,
) -> Routine {
    let sync_id = match partner {
        Some(partner) => effective_channel(own, partner).map(|c| c.sync_id),
        None => own
            .routine_sync
            .partner_id
            .as_deref()
            .and_then(|partner_id| side_points_at(own, partner_id))
            .map(str::to_string),
    };
    routine.updated_at = Some(now.to_string());

    let Some(sync_id) = sync_id else {
        routine.sync_meta = None;
        return routine;
    };
    let known = [
        own.routine.as_ref().map(|r| r.version_for(&sync_id)),
        partner.and_then(|p| p.routine.as_ref()).map(|r| r.version_for(&sync_id)),
        Some(routine.version_for(&sync_id)),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(0);
    routine.sync_meta = Some(SyncMeta {
        sync_id,
        version: known.saturating_add(1),
        updated_by: own.user_id.clone(),
        updated_at: Some(now.to_string()),
    });
    routine
}

/// For a profile transition, the auto-sync candidate: partner id, routine and
/// channel id, when the updater's own auto-mode edit should be offered.
pub fn auto_propagation_candidate<'a>(
    before: Option<&Profile>,
    after: &'a Profile,
) -> Option<(&'a str, &'a Routine, &'a str)> {
    let routine = after.routine.as_ref()?;
    if before.and_then(|b| b.routine.as_ref()) == Some(routine) {
        return None;
    }
    let sync = &after.routine_sync;
    if !sync.enabled || sync.mode != RoutineSyncMode::Auto {
        return None;
    }
    let sync_id = sync.sync_id.as_deref()?;
    let meta = routine.sync_meta.as_ref()?;
    if meta.sync_id != sync_id || meta.updated_by != after.user_id {
        return None;
    }
    let partner_id = sync.partner_id.as_deref()?;
    Some((partner_id, routine, sync_id))
}

/// Routine to write onto `partner`, or `None` when the push must not happen.
/// Never writes a version the partner already has or exceeds.
pub fn plan_auto_propagation(
    before: Option<&Profile>,
    after: &Profile,
    partner: &Profile,
) -> Option<Routine> {
    let (partner_id, routine, sync_id) = auto_propagation_candidate(before, after)?;
    if partner.user_id != partner_id {
        return None;
    }
    let channel = effective_channel(after, partner)?;
    if channel.sync_id != sync_id {
        return None;
    }
    let source_version = routine.version_for(sync_id);
    let partner_version = partner
        .routine
        .as_ref()
        .map_or(0, |r| r.version_for(sync_id));
    (partner_version < source_version).then(|| routine.clone())
}

/// Routines to store on `(source, target)` for an explicit sync-now.
pub fn plan_sync_now(source: &Profile, target: &Profile, now: &str) -> Result<(Routine, Routine)> {
    let not_allowed = |reason: &str| {
        Error::code(
            ErrorCode::SyncNotAllowed,
            format!(
                "cannot sync '{}' to '{}': {}",
                source.user_id, target.user_id, reason
            ),
        )
    };
    let routine = source
        .routine
        .as_ref()
        .ok_or_else(|| not_allowed("source has no routine"))?;
    let channel =
        effective_channel(source, target).ok_or_else(|| not_allowed("no shared sync channel"))?;

    let version = routine
        .version_for(&channel.sync_id)
        .max(
            target
                .routine
                .as_ref()
                .map_or(0, |r| r.version_for(&channel.sync_id)),
        )
        .saturating_add(1);
    let mut synced = routine.clone();
    synced.updated_at = Some(now.to_string());
    synced.sync_meta = Some(SyncMeta {
        sync_id: channel.sync_id,
        version,
        updated_by: source.user_id.clone(),
        updated_at: Some(now.to_string()),
    });
    Ok((synced.clone(), synced))
}

/// Resets whichever side's channel points at the other. `None` for an
/// untouched side.
pub fn plan_break_sync(a: &Profile, b: &Profile, now: &str) -> (Option<Profile>, Option<Profile>) {
    let reset = |own: &Profile, other_id: &str| {
        let sync = &own.routine_sync;
        (sync.points_at(other_id) && (sync.enabled || sync.sync_id.is_some()))
            .then(|| plan_disable_sync(own, now))
    };
    (reset(a, &b.user_id), reset(b, &a.user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::PartnerRef;

    const NOW: &str = "2026-10-14T12:00:00.000Z";

    fn synced(me: &str, other: &str, sync_id: &str, version: i64) -> Profile {
        let mut profile = Profile::new(me, me.to_uppercase());
        profile.partners = vec![PartnerRef::new(other, other, other)];
        profile.partner_ids = vec![other.into()];
        profile.partner_id = Some(other.into());
        profile.active_partner_id = Some(other.into());
        profile.routine_sync = RoutineSync {
            enabled: true,
            partner_id: Some(other.into()),
            mode: RoutineSyncMode::Auto,
            sync_id: Some(sync_id.into()),
            updated_at: None,
        };
        profile.routine = Some(Routine {
            name: format!("{} plan", me),
            sync_meta: Some(SyncMeta {
                sync_id: sync_id.into(),
                version,
                updated_by: me.into(),
                updated_at: None,
            }),
            ..Default::default()
        });
        profile
    }

    #[test]
    fn channel_requires_matching_ids_on_both_sides() {
        let a = synced("a", "b", "s1", 1);
        let b = synced("b", "a", "s1", 1);
        assert_eq!(effective_channel(&a, &b).unwrap().sync_id, "s1");

        let other = synced("b", "a", "s2", 1);
        assert!(effective_channel(&a, &other).is_none());

        let mut disabled = b.clone();
        disabled.routine_sync.enabled = false;
        assert!(effective_channel(&a, &disabled).is_none());
    }

    #[test]
    fn enable_reuses_the_partners_sync_id() {
        let b = synced("b", "a", "s9", 0);
        let mut a = synced("a", "b", "ignored", 0);
        a.routine_sync = RoutineSync::default();
        let next = plan_enable_sync(&a, "b", Some(&b), RoutineSyncMode::Manual, NOW).unwrap();
        assert_eq!(next.routine_sync.sync_id.as_deref(), Some("s9"));
        assert!(next.routine_sync.enabled);

        let fresh = plan_enable_sync(&a, "b", None, RoutineSyncMode::Manual, NOW).unwrap();
        assert!(fresh.routine_sync.sync_id.is_some());

        let err = plan_enable_sync(&a, "z", None, RoutineSyncMode::Auto, NOW).unwrap_err();
        assert!(err.is_code(ErrorCode::NotPartners));
    }

    #[test]
    fn set_mode_requires_enabled_channel() {
        let mut a = synced("a", "b", "s1", 0);
        let manual = plan_set_mode(&a, RoutineSyncMode::Manual, NOW).unwrap();
        assert_eq!(manual.routine_sync.mode, RoutineSyncMode::Manual);
        a.routine_sync.enabled = false;
        assert!(plan_set_mode(&a, RoutineSyncMode::Auto, NOW)
            .unwrap_err()
            .is_code(ErrorCode::SyncNotAllowed));
    }

    #[test]
    fn newer_version_is_pushed_to_partner() {
        let a = synced("a", "b", "s1", 3);
        let before = {
            let mut p = a.clone();
            p.routine.as_mut().unwrap().name = "old".into();
            p
        };
        let b = synced("b", "a", "s1", 2);
        let pushed = plan_auto_propagation(Some(&before), &a, &b).unwrap();
        assert_eq!(pushed.version_for("s1"), 3);

        let b_current = synced("b", "a", "s1", 3);
        assert!(plan_auto_propagation(Some(&before), &a, &b_current).is_none());
        let b_ahead = synced("b", "a", "s1", 7);
        assert!(plan_auto_propagation(Some(&before), &a, &b_ahead).is_none());
    }

    #[test]
    fn propagation_ignores_foreign_and_manual_edits() {
        let b = synced("b", "a", "s1", 0);
        let mut a = synced("a", "b", "s1", 3);
        a.routine.as_mut().unwrap().sync_meta.as_mut().unwrap().updated_by = "b".into();
        assert!(plan_auto_propagation(None, &a, &b).is_none());

        let mut manual = synced("a", "b", "s1", 3);
        manual.routine_sync.mode = RoutineSyncMode::Manual;
        assert!(plan_auto_propagation(None, &manual, &b).is_none());

        let unchanged = synced("a", "b", "s1", 3);
        assert!(plan_auto_propagation(Some(&unchanged), &unchanged, &b).is_none());
    }

    #[test]
    fn stamping_increments_past_both_sides() {
        let a = synced("a", "b", "s1", 2);
        let b = synced("b", "a", "s1", 5);
        let stamped = stamp_routine_edit(&a, Some(&b), Routine::default(), NOW);
        let meta = stamped.sync_meta.unwrap();
        assert_eq!(meta.version, 6);
        assert_eq!(meta.updated_by, "a");

        let mut lonely = a.clone();
        lonely.routine_sync = RoutineSync::default();
        let stripped = stamp_routine_edit(&lonely, None, a.routine.clone().unwrap(), NOW);
        assert!(stripped.sync_meta.is_none());
    }

    #[test]
    fn versions_at_the_ceiling_stay_there() {
        let a = synced("a", "b", "s1", i64::MAX);
        let b = synced("b", "a", "s1", 1);
        let stamped = stamp_routine_edit(&a, Some(&b), Routine::default(), NOW);
        assert_eq!(stamped.version_for("s1"), i64::MAX);

        let (_, for_target) = plan_sync_now(&a, &b, NOW).unwrap();
        assert_eq!(for_target.version_for("s1"), i64::MAX);
    }

    #[test]
    fn sync_now_checks_preconditions_and_bumps_version() {
        let a = synced("a", "b", "s1", 4);
        let b = synced("b", "a", "s1", 6);
        let (for_source, for_target) = plan_sync_now(&a, &b, NOW).unwrap();
        assert_eq!(for_target.version_for("s1"), 7);
        assert_eq!(for_source, for_target);
        assert_eq!(for_target.name, "a plan");

        let mut no_routine = a.clone();
        no_routine.routine = None;
        assert!(plan_sync_now(&no_routine, &b, NOW)
            .unwrap_err()
            .is_code(ErrorCode::SyncNotAllowed));
        let mismatched = synced("b", "a", "s2", 0);
        assert!(plan_sync_now(&a, &mismatched, NOW).is_err());
    }

    #[test]
    fn break_sync_resets_sides_pointing_at_each_other() {
        let a = synced("a", "b", "s1", 1);
        let mut b = synced("b", "a", "s1", 1);
        b.routine_sync = RoutineSync::default();
        let (next_a, next_b) = plan_break_sync(&a, &b, NOW);
        assert!(!next_a.unwrap().routine_sync.enabled);
        assert!(next_b.is_none());
    }
}
