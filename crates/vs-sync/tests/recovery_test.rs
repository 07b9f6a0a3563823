//! Crash-recovery scenarios for pending ops.

mod common;

use common::*;
use vs_core::types::{PendingOp, PendingOpType, System};
use vs_sync::PendingOpRecovery;

/// Scenario: the workflow crashed after the tracker journal append but
/// before the mapping write. Recovery finds the issue by its PM link
/// label, links it, and does not create a second entry.
#[tokio::test]
async fn crash_mid_create_links_existing_tracker_issue() {
    let env = test_env().await;

    // The surviving intent record.
    let op = PendingOp::new(
        PendingOpType::CreateIssue,
        System::Tracker,
        serde_json::json!({
            "project": "HVSYN",
            "identifier": "HVSYN-12",
            "title": "Crashy task",
        }),
    );
    env.store.create_pending_op(&op).await.unwrap();

    // The journal append landed: the tracker has the issue, labelled.
    env.tracker.seed_issue(tracker_issue(
        "bd-surv1",
        "Crashy task",
        "open",
        2,
        &["huly:HVSYN-12"],
        1_000,
    ));

    let recovery = PendingOpRecovery::new(env.store.clone(), env.tracker.clone());
    let report = recovery.run().await.unwrap();
    assert_eq!(report.linked, 1);
    assert_eq!(report.abandoned, 0);

    // Linked, resolved, and no second entry was created.
    let row = env.store.get_issue("HVSYN-12").await.unwrap().unwrap();
    assert_eq!(row.tracker_id.as_deref(), Some("bd-surv1"));
    assert!(env.store.list_unresolved_pending_ops().await.unwrap().is_empty());
    assert_eq!(env.tracker.creates.load(std::sync::atomic::Ordering::SeqCst), 0);

    // A subsequent sync does not duplicate either: the dedup index now
    // sees the linked row.
    env.pm.seed_issue(pm_issue(
        "HVSYN-12", "HVSYN", "Crashy task", "", "Backlog", "Medium", 2_000,
    ));
    env.orchestrator
        .sync_project("HVSYN", vs_sync::FetchPlan::Incremental)
        .await
        .unwrap();
    assert_eq!(env.tracker.creates.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// A create whose mapping write actually landed before the crash is
/// resolved without touching anything.
#[tokio::test]
async fn create_with_persisted_mapping_is_marked_applied() {
    let env = test_env().await;

    let mut row = vs_core::types::Issue::new("HVSYN-13", "HVSYN");
    row.title = "Done already".into();
    row.tracker_id = Some("bd-done".into());
    row.rehash();
    env.store.upsert_issue(&row).await.unwrap();

    let op = PendingOp::new(
        PendingOpType::CreateIssue,
        System::Tracker,
        serde_json::json!({"project": "HVSYN", "identifier": "HVSYN-13", "title": "Done already"}),
    );
    env.store.create_pending_op(&op).await.unwrap();

    let recovery = PendingOpRecovery::new(env.store.clone(), env.tracker.clone());
    let report = recovery.run().await.unwrap();
    assert_eq!(report.already_applied, 1);
    assert!(env.store.list_unresolved_pending_ops().await.unwrap().is_empty());
}

/// A create with no trace upstream is abandoned; the next sync recreates
/// it from the PM side.
#[tokio::test]
async fn create_with_no_upstream_trace_is_abandoned() {
    let env = test_env().await;

    let op = PendingOp::new(
        PendingOpType::CreateIssue,
        System::Tracker,
        serde_json::json!({"project": "HVSYN", "identifier": "HVSYN-14", "title": "Lost"}),
    );
    env.store.create_pending_op(&op).await.unwrap();

    let recovery = PendingOpRecovery::new(env.store.clone(), env.tracker.clone());
    let report = recovery.run().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.linked, 0);
    assert!(env.store.list_unresolved_pending_ops().await.unwrap().is_empty());
}

/// Update-shaped survivors are abandoned for the next convergent pass.
#[tokio::test]
async fn update_survivors_are_abandoned() {
    let env = test_env().await;
    let op = PendingOp::new(
        PendingOpType::UpdateIssue,
        System::Pm,
        serde_json::json!({"identifiers": ["HVSYN-1"]}),
    );
    env.store.create_pending_op(&op).await.unwrap();

    let recovery = PendingOpRecovery::new(env.store.clone(), env.tracker.clone());
    let report = recovery.run().await.unwrap();
    assert_eq!(report.abandoned, 1);
}
