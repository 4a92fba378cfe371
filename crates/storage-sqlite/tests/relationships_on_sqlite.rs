use std::sync::Arc;

use spotter_core::audit::ReconciliationAuditor;
use spotter_core::profiles::{create_profile, require_profile, Profile};
use spotter_core::relationships::{LinkService, SendLinkOutcome, SendLinkRequest, UnlinkService};
use spotter_core::store::DocumentStore;
use spotter_core::triggers::TriggerDispatcher;
use spotter_core::RelationshipPolicy;
use spotter_storage_sqlite::SqliteDocumentStore;

fn request(from: &str, to: &str) -> SendLinkRequest {
    SendLinkRequest {
        requester_id: from.into(),
        requester_alias: format!("{}_alias", from),
        recipient_id: to.into(),
        recipient_alias: None,
    }
}

#[tokio::test]
async fn link_and_unlink_round_trip_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteDocumentStore::open(&dir.path().to_string_lossy()).unwrap());
    for id in ["a", "b"] {
        create_profile(store.as_ref(), &Profile::new(id, id.to_uppercase()))
            .await
            .unwrap();
    }
    let policy = RelationshipPolicy::default();
    let links = LinkService::new(store.clone(), policy.clone());
    let dispatcher = TriggerDispatcher::new(store.clone(), policy.clone());
    let mut rx = store.subscribe();

    links.send_link_request(request("a", "b")).await.unwrap();
    let outcome = links.send_link_request(request("b", "a")).await.unwrap();
    assert!(matches!(outcome, SendLinkOutcome::AutoAccepted { .. }));
    dispatcher.pump(&mut rx).await.unwrap();

    assert_eq!(require_profile(store.as_ref(), "a").await.unwrap().partner_ids, ["b"]);
    assert_eq!(require_profile(store.as_ref(), "b").await.unwrap().partner_ids, ["a"]);
    let auditor = ReconciliationAuditor::new(store.clone(), policy);
    assert_eq!(auditor.scan().await.unwrap().fixable_count, 0);

    UnlinkService::new(store.clone())
        .unlink_partner("b", "a")
        .await
        .unwrap();
    dispatcher.pump(&mut rx).await.unwrap();
    assert!(require_profile(store.as_ref(), "a").await.unwrap().partner_ids.is_empty());
    assert!(require_profile(store.as_ref(), "b").await.unwrap().partner_ids.is_empty());
}
