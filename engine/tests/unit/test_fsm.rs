//! Deployment lifecycle tests

use std::time::Duration;

use chrono::Utc;
use shipyard::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use shipyard::errors::ShipyardError;
use shipyard::models::deployment::{
    Deployment, DeploymentError, DeploymentStatus, FailureKind, RoutingRole, SourceRevision,
    TriggerKind,
};
use shipyard::models::project::{BuildConfig, Project};
use shipyard::storage::state::{Authority, StateStore};
use tokio_test::{assert_err, assert_ok};

fn failure() -> DeploymentError {
    DeploymentError::new(FailureKind::Build, "exit status 1")
}

#[test]
fn test_success_path_cannot_skip_steps() {
    let mut fsm = DeploymentFsm::new();
    assert_err!(fsm.process(DeploymentEvent::StartBuild));
    assert_err!(fsm.process(DeploymentEvent::Complete));
    assert_eq!(fsm.status(), DeploymentStatus::Queued);

    assert_ok!(fsm.process(DeploymentEvent::StartClone));
    assert_err!(fsm.process(DeploymentEvent::StartUpload));
    assert_eq!(fsm.status(), DeploymentStatus::Cloning);
}

#[test]
fn test_interrupts_from_every_running_status() {
    let steps = [
        DeploymentEvent::StartClone,
        DeploymentEvent::StartBuild,
        DeploymentEvent::StartUpload,
        DeploymentEvent::StartActivation,
    ];
    for depth in 0..=steps.len() {
        let mut failed = DeploymentFsm::new();
        let mut cancelled = DeploymentFsm::new();
        for step in steps.iter().take(depth) {
            failed.process(step.clone()).unwrap();
            cancelled.process(step.clone()).unwrap();
        }
        failed.process(DeploymentEvent::Fail(failure())).unwrap();
        assert_eq!(failed.status(), DeploymentStatus::Failed);
        assert_eq!(failed.error().unwrap().kind, FailureKind::Build);

        cancelled.process(DeploymentEvent::Cancel).unwrap();
        assert_eq!(cancelled.status(), DeploymentStatus::Cancelled);
        assert!(cancelled.error().is_none());
    }
}

#[test]
fn test_terminal_statuses_reject_everything_but_purge_of_active() {
    for status in [
        DeploymentStatus::Failed,
        DeploymentStatus::Cancelled,
        DeploymentStatus::Purged,
    ] {
        let mut fsm = DeploymentFsm::resume(status, None);
        assert!(fsm.process(DeploymentEvent::Cancel).is_err());
        assert!(fsm.process(DeploymentEvent::Fail(failure())).is_err());
        assert!(fsm.process(DeploymentEvent::Purge).is_err());
        assert!(fsm.process(DeploymentEvent::StartClone).is_err());
        assert_eq!(fsm.status(), status);
    }

    let mut active = DeploymentFsm::resume(DeploymentStatus::Active, None);
    assert!(active.process(DeploymentEvent::Cancel).is_err());
    assert!(active.process(DeploymentEvent::Fail(failure())).is_err());
    active.process(DeploymentEvent::Purge).unwrap();
    assert_eq!(active.status(), DeploymentStatus::Purged);
}

#[test]
fn test_status_serializes_as_one_vocabulary() {
    assert_eq!(
        serde_json::to_string(&DeploymentStatus::Activating).unwrap(),
        "\"ACTIVATING\""
    );
    assert_eq!(DeploymentStatus::Activating.to_string(), "ACTIVATING");
}

async fn store_with_queued() -> (StateStore, Deployment) {
    let state = StateStore::in_memory();
    state
        .upsert_project(Project {
            id: "p1".to_string(),
            slug: "site".to_string(),
            repo_url: "https://git.example.com/site.git".to_string(),
            production_branch: "main".to_string(),
            build: BuildConfig::default(),
            active_production: None,
            active_staging: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let deployment = Deployment::new(
        "d1".to_string(),
        "p1".to_string(),
        SourceRevision {
            commit: "abc".to_string(),
            branch: "main".to_string(),
        },
        RoutingRole::Production,
        TriggerKind::Manual,
    );
    let (stored, created) = state.insert_or_get(deployment).await.unwrap();
    assert!(created);
    (state, stored)
}

#[tokio::test]
async fn test_only_the_lease_holder_advances() {
    let (state, deployment) = store_with_queued().await;

    let (_, lease) = state
        .claim(&deployment.id, "w1", Duration::from_secs(30))
        .await
        .unwrap();
    // a second worker cannot claim it
    let second = state.claim(&deployment.id, "w2", Duration::from_secs(30)).await;
    assert!(matches!(second, Err(ShipyardError::LeaseError(_))));

    let stranger = state
        .transition(
            &deployment.id,
            Authority::Worker { token: "not-the-token" },
            DeploymentEvent::StartBuild,
            |_| {},
        )
        .await;
    assert!(matches!(stranger, Err(ShipyardError::LeaseError(_))));

    let building = state
        .transition(
            &deployment.id,
            Authority::Worker { token: &lease.token },
            DeploymentEvent::StartBuild,
            |_| {},
        )
        .await
        .unwrap();
    assert_eq!(building.status, DeploymentStatus::Building);

    // the reaper only acts on expired leases
    let reaped = state
        .transition(
            &deployment.id,
            Authority::Reaper,
            DeploymentEvent::Fail(failure()),
            |_| {},
        )
        .await;
    assert!(matches!(reaped, Err(ShipyardError::TransitionError(_))));
}

#[tokio::test]
async fn test_idempotent_while_in_flight() {
    let (state, first) = store_with_queued().await;

    let duplicate = Deployment::new(
        "d2".to_string(),
        "p1".to_string(),
        first.revision.clone(),
        RoutingRole::Production,
        TriggerKind::Webhook,
    );
    let (stored, created) = state.insert_or_get(duplicate.clone()).await.unwrap();
    assert!(!created);
    assert_eq!(stored.id, first.id);

    // once terminal, the same key starts a new deployment
    state
        .transition(&first.id, Authority::Canceller, DeploymentEvent::Cancel, |_| {})
        .await
        .unwrap();
    let (stored, created) = state.insert_or_get(duplicate).await.unwrap();
    assert!(created);
    assert_eq!(stored.id, "d2");
}

#[tokio::test]
async fn test_expired_lease_is_reapable() {
    let (state, deployment) = store_with_queued().await;
    state
        .claim(&deployment.id, "w1", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let expired = state.expired_leases(Utc::now()).await;
    assert_eq!(expired.len(), 1);

    let failed = state
        .transition(
            &deployment.id,
            Authority::Reaper,
            DeploymentEvent::Fail(DeploymentError::new(FailureKind::WorkerLost, "lost")),
            |_| {},
        )
        .await
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.lease.is_none());
    assert!(failed.finished_at.is_some());
}
