use std::sync::Arc;

use serde_json::{json, Value};
use spotter_core::audit::{ApplyMode, ReconciliationAuditor};
use spotter_core::profiles::{
    diff_patch, profile_path, require_profile, to_sync_payload, DayStatus, PartnerRef, Profile,
    SyncPayload,
};
use spotter_core::relationships::{
    plan_partner_upsert, resolve_active_partners, AcceptedLinkEvent, UnlinkEvent,
};
use spotter_core::store::{apply_patch, DocumentStore, InMemoryDocumentStore, SetOptions};
use spotter_core::RelationshipPolicy;

const NOW: &str = "2026-10-14T09:00:00.000Z";

fn accepted(id: &str, at: i64) -> AcceptedLinkEvent {
    AcceptedLinkEvent {
        partner: PartnerRef::new(id, id, id.to_uppercase()),
        accepted_at_ms: at,
    }
}

fn unlinked(id: &str, at: i64) -> UnlinkEvent {
    UnlinkEvent {
        partner_id: id.into(),
        created_at_ms: at,
    }
}

#[test]
fn partner_upsert_is_idempotent() {
    let mut profile = Profile::new("me", "Me");
    profile.link_setup_pending_partner_id = Some("old".into());
    let partner = PartnerRef::new("p", "pal", "Pal");

    let first = plan_partner_upsert(&profile, &partner, NOW);
    assert!(!first.no_op);
    let second = plan_partner_upsert(&first.profile, &partner, NOW);
    assert!(second.no_op);
    assert_eq!(second.profile, first.profile);
}

#[test]
fn resolver_ignores_event_order() {
    let accepted_events = vec![
        accepted("a", 10),
        accepted("b", 20),
        accepted("a", 40),
        accepted("c", 5),
    ];
    let unlink_events = vec![unlinked("a", 30), unlinked("b", 25), unlinked("c", 1)];
    let expected = resolve_active_partners(&accepted_events, &unlink_events, 3);
    let expected_ids: Vec<&str> = expected.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(expected_ids, ["a", "c"]);

    for shift in 0..accepted_events.len() {
        let mut acc = accepted_events.clone();
        acc.rotate_left(shift);
        for reverse in [false, true] {
            let mut unl = unlink_events.clone();
            if reverse {
                unl.reverse();
            }
            assert_eq!(resolve_active_partners(&acc, &unl, 3), expected);
        }
    }
}

#[test]
fn later_acceptance_beats_earlier_unlink_and_not_the_reverse() {
    let relinked = resolve_active_partners(&[accepted("p", 200)], &[unlinked("p", 100)], 1);
    assert_eq!(relinked.len(), 1);
    let unlinked_after = resolve_active_partners(&[accepted("p", 100)], &[unlinked("p", 200)], 1);
    assert!(unlinked_after.is_empty());
}

fn payload(profile: &Profile) -> SyncPayload {
    to_sync_payload(profile).unwrap()
}

fn snapshots() -> (Profile, Profile) {
    let mut a = Profile::new("u1", "Uma");
    a.alias = Some("uma".into());
    a.day_status.insert(
        "2026-10-12".into(),
        DayStatus {
            status: "done".into(),
            ..Default::default()
        },
    );
    a.day_status.insert(
        "2026-10-13".into(),
        DayStatus {
            status: "rest".into(),
            ..Default::default()
        },
    );
    let mut b = a.clone();
    b.alias = None;
    b.display_name = "Uma B".into();
    b.partners = vec![PartnerRef::new("u2", "bo", "Bo")];
    b.partner_ids = vec!["u2".into()];
    b.day_status.remove("2026-10-12");
    b.day_status.insert(
        "2026-10-14".into(),
        DayStatus {
            status: "done".into(),
            mood: Some(4),
            ..Default::default()
        },
    );
    (a, b)
}

#[test]
fn applying_a_diff_reaches_the_target() {
    let (a, b) = snapshots();
    for (from, to) in [(&a, &b), (&b, &a)] {
        let patch = diff_patch(&payload(from), &payload(to));
        assert!(!patch.is_empty());
        let mut stored = Value::Object(payload(from));
        apply_patch(&mut stored, &patch);
        let Value::Object(result) = stored else {
            panic!("patched document is not an object");
        };
        assert!(diff_patch(&result, &payload(to)).is_empty());
    }
}

#[test]
fn diff_of_a_snapshot_with_itself_is_empty() {
    let (a, b) = snapshots();
    assert!(diff_patch(&payload(&a), &payload(&a)).is_empty());
    assert!(diff_patch(&payload(&b), &payload(&b)).is_empty());
    let empty = SyncPayload::new();
    assert!(diff_patch(&empty, &empty).is_empty());
}

#[tokio::test]
async fn auditor_fixed_point_leaves_only_reciprocal_links() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let dataset = [
        ("p1", json!({"partnerIds": ["p2", "p3"], "partnerId": "p2"})),
        ("p2", json!({"partnerIds": ["p1"]})),
        ("p3", json!({"partnerIds": ["p4"]})),
        ("p4", json!({"partnerIds": ["p3", "p1"], "activePartnerId": "p1"})),
        ("p5", json!({"partnerIds": ["p5", "ghost"], "linkSetupPendingPartnerId": "ghost"})),
        ("p6", json!({"partners": [{"id": "p7", "alias": "seven"}]})),
        ("p7", json!({"partnerId": "p6"})),
    ];
    for (id, mut data) in dataset {
        data["userId"] = json!(id);
        data["displayName"] = json!(id.to_uppercase());
        store
            .set(&profile_path(id).unwrap(), data, SetOptions::overwrite())
            .await
            .unwrap();
    }

    let policy = RelationshipPolicy {
        max_partners: 2,
        ..Default::default()
    };
    let auditor = ReconciliationAuditor::new(store.clone(), policy);
    let summary = auditor.run_to_fixed_point(ApplyMode::Apply).await.unwrap();
    assert!(summary.converged);

    let mut profiles = Vec::new();
    for id in ["p1", "p2", "p3", "p4", "p5", "p6", "p7"] {
        profiles.push(require_profile(store.as_ref(), id).await.unwrap());
    }
    for profile in &profiles {
        assert!(!profile.partner_ids.contains(&profile.user_id));
        for partner in &profile.partner_ids {
            let other = profiles
                .iter()
                .find(|p| &p.user_id == partner)
                .unwrap_or_else(|| panic!("{} lists missing {}", profile.user_id, partner));
            assert!(other.partner_ids.contains(&profile.user_id));
        }
        let listed: Vec<&str> = profile.partners.iter().map(|p| p.id.as_str()).collect();
        let ids: Vec<&str> = profile.partner_ids.iter().map(String::as_str).collect();
        assert_eq!(listed, ids);
    }
    let p5 = &profiles[4];
    assert!(p5.partner_ids.is_empty());
    assert!(p5.link_setup_pending_partner_id.is_none());

    let second = auditor.run_to_fixed_point(ApplyMode::Apply).await.unwrap();
    assert_eq!(second.written, 0);
}
