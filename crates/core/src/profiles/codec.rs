//! Sync payload codec.
//!
//! The only place profile defaults are applied. Raw documents go through
//! [`normalize_profile`]; outgoing state goes through [`to_sync_payload`]; and
//! [`diff_patch`] turns two payload snapshots into the minimal field writes.

use serde_json::{Map, Value};

use super::profile_model::Profile;
use crate::errors::{Error, Result};
use crate::store::DocumentPatch;

/// Wire representation of a profile: a JSON object keyed by field name.
pub type SyncPayload = Map<String, Value>;

/// Transport timestamp, ignored when deciding whether anything changed.
pub const TRANSPORT_TIMESTAMP_FIELD: &str = "updatedAt";

/// Nested map diffed per key instead of as a whole.
pub const DAY_STATUS_FIELD: &str = "dayStatus";

/// Parses a stored profile document, filling every missing field with its default.
pub fn normalize_profile(user_id: &str, data: &Value) -> Result<Profile> {
    let mut profile: Profile = serde_json::from_value(data.clone())?;
    if profile.user_id.trim().is_empty() {
        profile.user_id = user_id.to_string();
    }
    Ok(profile)
}

pub fn to_sync_payload(profile: &Profile) -> Result<SyncPayload> {
    match serde_json::to_value(profile)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::internal(format!(
            "profile serialized to non-object: {}",
            other
        ))),
    }
}

pub fn to_comparable_payload(profile: &Profile) -> Result<SyncPayload> {
    let mut payload = to_sync_payload(profile)?;
    payload.remove(TRANSPORT_TIMESTAMP_FIELD);
    Ok(payload)
}

fn as_map(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

fn diff_nested_map(prev: Option<&Value>, next: Option<&Value>, patch: &mut DocumentPatch) {
    let (prev_map, next_map) = match (as_map(prev), as_map(next)) {
        (Some(p), Some(n)) => (p, n),
        _ => {
            // Absent or not a map on one side: write the field whole.
            if prev != next {
                match next {
                    Some(v) => patch.set(DAY_STATUS_FIELD, v.clone()),
                    None => patch.delete(DAY_STATUS_FIELD),
                };
            }
            return;
        }
    };

    // Dotted paths cannot address keys that contain a dot.
    if prev_map.keys().chain(next_map.keys()).any(|k| k.contains('.')) {
        if prev_map != next_map {
            patch.set(DAY_STATUS_FIELD, Value::Object(next_map.clone()));
        }
        return;
    }

    for (key, next_value) in next_map {
        if prev_map.get(key) != Some(next_value) {
            patch.set(format!("{}.{}", DAY_STATUS_FIELD, key), next_value.clone());
        }
    }
    for key in prev_map.keys() {
        if !next_map.contains_key(key) {
            patch.delete(format!("{}.{}", DAY_STATUS_FIELD, key));
        }
    }
}

/// Minimal patch turning `prev` into `next`.
///
/// Top-level fields are compared by deep equality and written whole. The
/// `dayStatus` map is written per key, with explicit deletes for keys that
/// disappeared.
pub fn diff_patch(prev: &SyncPayload, next: &SyncPayload) -> DocumentPatch {
    let mut patch = DocumentPatch::new();

    for (field, next_value) in next {
        if field == DAY_STATUS_FIELD {
            continue;
        }
        if prev.get(field) != Some(next_value) {
            patch.set(field.clone(), next_value.clone());
        }
    }
    for field in prev.keys() {
        if field != DAY_STATUS_FIELD && !next.contains_key(field) {
            patch.delete(field.clone());
        }
    }

    diff_nested_map(prev.get(DAY_STATUS_FIELD), next.get(DAY_STATUS_FIELD), &mut patch);
    patch
}

/// Autosave patch between two in-memory profiles, stamped with `updated_at`.
/// `None` when no comparable field changed.
pub fn autosave_patch(
    prev: &Profile,
    next: &Profile,
    updated_at: &str,
) -> Result<Option<DocumentPatch>> {
    let mut patch = diff_patch(&to_comparable_payload(prev)?, &to_comparable_payload(next)?);
    if patch.is_empty() {
        return Ok(None);
    }
    patch.set(TRANSPORT_TIMESTAMP_FIELD, updated_at);
    Ok(Some(patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{DayStatus, PartnerRef, Routine, RoutineSync};
    use crate::store::{apply_patch, PatchValue};
    use serde_json::json;

    fn day(status: &str) -> DayStatus {
        DayStatus {
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn sample() -> Profile {
        let mut profile = Profile::new("u1", "Uma");
        profile.partners = vec![PartnerRef::new("u2", "bo", "Bo")];
        profile.partner_ids = vec!["u2".into()];
        profile.partner_id = Some("u2".into());
        profile.day_status.insert("2026-10-12".into(), day("done"));
        profile.day_status.insert("2026-10-13".into(), day("rest"));
        profile
    }

    #[test]
    fn missing_fields_are_defaulted() {
        let profile = normalize_profile("u9", &json!({ "displayName": "Nia", "partners": null }))
            .unwrap();
        assert_eq!(profile.user_id, "u9");
        assert!(profile.partners.is_empty());
        assert_eq!(profile.routine_sync, RoutineSync::disabled(None));

        let payload = to_sync_payload(&profile).unwrap();
        assert_eq!(
            payload["routineSync"],
            json!({ "enabled": false, "partnerId": null, "mode": "manual", "syncId": null, "updatedAt": null })
        );
        assert_eq!(payload["partnerIds"], json!([]));
    }

    #[test]
    fn comparable_payload_drops_transport_timestamp() {
        let mut profile = sample();
        profile.updated_at = Some("2026-10-14T00:00:00.000Z".into());
        let payload = to_comparable_payload(&profile).unwrap();
        assert!(!payload.contains_key(TRANSPORT_TIMESTAMP_FIELD));
    }

    #[test]
    fn identical_payloads_produce_empty_patch() {
        let payload = to_sync_payload(&sample()).unwrap();
        assert!(diff_patch(&payload, &payload).is_empty());
    }

    #[test]
    fn day_status_is_patched_per_key_with_deletes() {
        let prev = sample();
        let mut next = sample();
        next.day_status.remove("2026-10-12");
        next.day_status.insert("2026-10-13".into(), day("done"));
        next.day_status.insert("2026-10-14".into(), day("skipped"));

        let patch = diff_patch(
            &to_sync_payload(&prev).unwrap(),
            &to_sync_payload(&next).unwrap(),
        );
        assert_eq!(patch.len(), 3);
        assert_eq!(patch.get("dayStatus.2026-10-12"), Some(&PatchValue::Delete));
        assert_eq!(
            patch.get("dayStatus.2026-10-13"),
            Some(&PatchValue::Set(json!({ "status": "done" })))
        );
        assert!(patch.contains_key("dayStatus.2026-10-14"));
    }

    #[test]
    fn unchanged_fields_never_appear_in_patch() {
        let prev = sample();
        let mut next = sample();
        next.routine = Some(Routine {
            name: "Legs".into(),
            ..Default::default()
        });
        let patch = diff_patch(
            &to_sync_payload(&prev).unwrap(),
            &to_sync_payload(&next).unwrap(),
        );
        assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["routine"]);
    }

    #[test]
    fn applying_patch_then_rediffing_is_empty() {
        let prev = sample();
        let mut next = sample();
        next.partners.clear();
        next.partner_ids.clear();
        next.partner_id = None;
        next.day_status.clear();
        next.day_status.insert("2026-10-20".into(), day("done"));

        let prev_payload = to_sync_payload(&prev).unwrap();
        let next_payload = to_sync_payload(&next).unwrap();
        let patch = diff_patch(&prev_payload, &next_payload);

        let mut stored = Value::Object(prev_payload);
        apply_patch(&mut stored, &patch);
        let stored = stored.as_object().unwrap().clone();
        assert!(diff_patch(&stored, &next_payload).is_empty());
    }

    #[test]
    fn autosave_ignores_timestamp_only_changes() {
        let prev = sample();
        let mut next = sample();
        next.updated_at = Some("later".into());
        assert!(autosave_patch(&prev, &next, "now").unwrap().is_none());

        next.display_name = "Uma B".into();
        let patch = autosave_patch(&prev, &next, "now").unwrap().unwrap();
        assert!(patch.contains_key("displayName"));
        assert_eq!(
            patch.get(TRANSPORT_TIMESTAMP_FIELD),
            Some(&PatchValue::Set(json!("now")))
        );
    }
}
