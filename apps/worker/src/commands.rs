use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use spotter_core::audit::{ApplyMode, ReconciliationAuditor};
use spotter_core::notifications::LogNotificationSink;
use spotter_core::routine_requests::RoutineRequestService;
use spotter_core::store::DocumentStore;
use spotter_core::triggers::{TriggerDispatcher, TriggerOutcome};
use spotter_core::RelationshipPolicy;
use spotter_storage_sqlite::SqliteDocumentStore;

pub fn open_store(db_path: &str) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let store = SqliteDocumentStore::open(db_path)
        .with_context(|| format!("failed to open document store at {}", db_path))?;
    Ok(Arc::new(store))
}

/// Runs triggers off the change feed. Catches up on start, after a lag, and on
/// each sweep tick so work committed by other processes is picked up too.
pub async fn run(store: Arc<dyn DocumentStore>, policy: RelationshipPolicy) -> anyhow::Result<()> {
    let dispatcher = TriggerDispatcher::with_notification_sink(
        store.clone(),
        policy.clone(),
        Arc::new(LogNotificationSink),
    );
    let mut rx = store.subscribe();

    let caught_up = dispatcher.catch_up().await?;
    info!(handled = caught_up, "Initial catch-up finished");

    let mut ticker =
        tokio::time::interval(Duration::from_secs(policy.expiry_sweep_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            event = rx.recv() => match event {
                Ok(event) => match dispatcher.handle(&event).await {
                    TriggerOutcome::Failed(reason) => {
                        warn!(path = %event.path, %reason, "Trigger failed");
                    }
                    TriggerOutcome::Applied => info!(path = %event.path, "Trigger applied"),
                    TriggerOutcome::Ignored | TriggerOutcome::NoOp => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change feed lagged, catching up");
                    if let Err(err) = dispatcher.catch_up().await {
                        error!(error = %err, "Catch-up failed");
                    }
                }
                Err(RecvError::Closed) => {
                    warn!("Change feed closed, stopping");
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                match sweep(store.clone(), policy.clone()).await {
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "Expiry sweep failed"),
                }
                if let Err(err) = dispatcher.catch_up().await {
                    error!(error = %err, "Catch-up failed");
                }
            }
        }
    }
}

pub async fn audit(
    store: Arc<dyn DocumentStore>,
    policy: RelationshipPolicy,
    apply: bool,
) -> anyhow::Result<()> {
    let auditor = ReconciliationAuditor::new(store, policy);
    let mode = if apply {
        ApplyMode::Apply
    } else {
        ApplyMode::DryRun
    };
    let summary = auditor.run_to_fixed_point(mode).await?;
    info!(
        passes = summary.passes,
        written = summary.written,
        converged = summary.converged,
        ?mode,
        "Audit finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary.last_report)?);
    if !apply && summary.last_report.fixable_count > 0 {
        info!("Dry run only. Re-run with --apply to write the fixes");
    }
    Ok(())
}

pub async fn sweep(store: Arc<dyn DocumentStore>, policy: RelationshipPolicy) -> anyhow::Result<usize> {
    let expired = RoutineRequestService::new(store, policy)
        .sweep_expired(Utc::now())
        .await?;
    info!(expired, "Expiry sweep finished");
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spotter_core::routine_requests::ROUTINE_REQUESTS_COLLECTION;
    use spotter_core::store::{DocPath, SetOptions};

    #[tokio::test]
    async fn sweep_expires_stale_pending_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().to_string_lossy()).unwrap();
        let path = DocPath::doc(ROUTINE_REQUESTS_COLLECTION, "r1").unwrap();
        store
            .set(
                &path,
                json!({
                    "fromUserId": "a",
                    "fromName": "A",
                    "toUserId": "b",
                    "toName": "B",
                    "sourceUserId": "a",
                    "targetUserId": "b",
                    "type": "share",
                    "status": "pending",
                    "syncAfterAccept": false,
                    "createdAt": "2026-01-01T00:00:00.000Z",
                    "expiresAt": "2026-01-04T00:00:00.000Z"
                }),
                SetOptions::overwrite(),
            )
            .await
            .unwrap();

        let expired = sweep(store.clone(), RelationshipPolicy::default()).await.unwrap();
        assert_eq!(expired, 1);
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.data["status"], "expired");
    }
}
