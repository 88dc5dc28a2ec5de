//! Pipeline tests: a deployment from submission to its terminal status

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{build_with, static_build, FaultyStore, Harness};
use shipyard::deploy::git::{CopyFetcher, FetchContext, SourceFetcher};
use shipyard::deploy::sandbox::StepError;
use shipyard::models::binding::ArtifactLocation;
use shipyard::models::deployment::{BuildStep, DeploymentStatus, FailureKind};
use shipyard::models::project::{BuildConfig, CommandSetting};
use shipyard::storage::settings::Settings;
use shipyard::workers::builder;

/// Fetcher that ignores cancellation and never finishes in time
struct StallingFetcher;

#[async_trait]
impl SourceFetcher for StallingFetcher {
    async fn fetch(&self, _ctx: FetchContext<'_>) -> Result<(), StepError> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(())
    }
}

/// Fetcher whose first run crashes; later runs copy the source
#[derive(Default)]
struct CrashOnceFetcher {
    crashed: AtomicBool,
}

#[async_trait]
impl SourceFetcher for CrashOnceFetcher {
    async fn fetch(&self, ctx: FetchContext<'_>) -> Result<(), StepError> {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            panic!("fetcher crashed");
        }
        CopyFetcher.fetch(ctx).await
    }
}

#[tokio::test]
async fn test_static_deployment_goes_live() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Active);
    assert!(done.lease.is_none());
    assert!(done.activated_at.is_some());
    assert_eq!(done.build_stats.as_ref().unwrap().file_count, 1);

    let prefix = match done.artifact.as_ref().unwrap() {
        ArtifactLocation::Static { prefix } => prefix.clone(),
        other => panic!("unexpected artifact {:?}", other),
    };
    let page = tokio::fs::read_to_string(h.objects.object_path(&format!("{}/index.html", prefix)))
        .await
        .unwrap();
    assert_eq!(page, "<h1>site</h1>");

    // the default production hostname auto-promotes, staging stays empty
    let production = h.app.directory.lookup(&h.hostname("site")).await.unwrap();
    assert_eq!(production.active_deployment.as_deref(), Some(done.id.as_str()));
    let routes = h.edge.routes().await;
    assert_eq!(routes[&h.hostname("site")].deployment_id, done.id);

    let staging = h.app.directory.lookup(&h.staging_hostname("site")).await.unwrap();
    assert!(staging.active_deployment.is_none());
    assert!(!routes.contains_key(&h.staging_hostname("site")));

    // the sandbox does not outlive the run
    assert!(!h.layout().workspaces_dir().subdir(&done.id).exists().await);
}

#[tokio::test]
async fn test_feature_branch_builds_for_staging() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;

    let done = h.deploy(&project, "cafe1", "feature/login").await;
    assert_eq!(done.status, DeploymentStatus::Active);

    let staging = h.app.directory.lookup(&h.staging_hostname("site")).await.unwrap();
    assert_eq!(staging.active_deployment.as_deref(), Some(done.id.as_str()));
    let production = h.app.directory.lookup(&h.hostname("site")).await.unwrap();
    assert!(production.active_deployment.is_none());
}

#[tokio::test]
async fn test_build_failure_records_exit_code_and_tail() {
    let h = Harness::new().await;
    let project = h
        .project("broken", build_with("echo compiling; echo 'syntax error' >&2; exit 3"))
        .await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert!(done.finished_at.is_some());

    let error = done.error.unwrap();
    assert_eq!(error.kind, FailureKind::Build);
    assert_eq!(error.step, Some(BuildStep::Build));
    assert_eq!(error.exit_code, Some(3));
    assert!(error.log_tail.iter().any(|line| line.contains("syntax error")));

    // nothing was published or routed
    let binding = h.app.directory.lookup(&h.hostname("broken")).await.unwrap();
    assert!(binding.active_deployment.is_none());
    assert!(h.edge.routes().await.is_empty());
    assert!(!h.layout().workspaces_dir().subdir(&done.id).exists().await);
}

#[tokio::test]
async fn test_skipped_build_command_logs_nothing_for_the_step() {
    let h = Harness::new().await;
    let project = h.project("plain", static_build()).await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Active);

    let lines = h.app.logs.read(&done.id, 0, 1000).await.unwrap();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|l| l.step != Some(BuildStep::Build)));
    assert!(lines.iter().all(|l| l.step != Some(BuildStep::Install)));
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn test_dependency_cache_miss_then_hit() {
    let h = Harness::new().await;
    h.write_source("app", "package.json", r#"{"dependencies":{"dep":"1.0.0"}}"#)
        .await;
    let build = BuildConfig {
        install_command: CommandSetting::Run(
            "mkdir -p node_modules/dep && echo installed > node_modules/dep/index.js".to_string(),
        ),
        build_command: CommandSetting::Run("cp node_modules/dep/index.js dist/dep.js".to_string()),
        ..Default::default()
    };
    let project = h.project("app", build).await;

    let first = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(first.status, DeploymentStatus::Active);
    assert!(!first.build_stats.unwrap().cache_hit);
    assert_eq!(h.app.cache.len(), 1);

    let second = h.deploy(&project, "cafe2", "main").await;
    assert_eq!(second.status, DeploymentStatus::Active);
    assert!(second.build_stats.unwrap().cache_hit);

    // the install command did not run again
    let lines = h.app.logs.read(&second.id, 0, 1000).await.unwrap();
    assert!(lines.iter().any(|l| l.message.contains("Restored dependencies")));
    assert!(!lines
        .iter()
        .any(|l| l.step == Some(BuildStep::Install) && l.message.contains("mkdir")));

    // a changed manifest misses again
    h.write_source("app", "package.json", r#"{"dependencies":{"dep":"2.0.0"}}"#)
        .await;
    let third = h.deploy(&project, "cafe3", "main").await;
    assert!(!third.build_stats.unwrap().cache_hit);
    assert_eq!(h.app.cache.len(), 2);
}

#[tokio::test]
async fn test_missing_output_fails_verification() {
    let h = Harness::new().await;
    let project = h.project("empty", build_with("rm -rf dist")).await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.kind, FailureKind::Build);
    assert_eq!(error.step, Some(BuildStep::Verify));
}

#[tokio::test]
async fn test_cancel_while_building() {
    let h = Harness::new().await;
    let project = h.project("slow", build_with("sleep 30")).await;
    let (queued, _) = h.submit(&project, "cafe1", "main").await;

    let scheduler = h.app.scheduler.clone();
    let pipeline = h.app.pipeline.clone();
    let id = queued.id.clone();
    let run = tokio::spawn(async move {
        let next = scheduler.next_queued().await;
        scheduler.run_one(common::WORKER, &next, &pipeline).await
    });

    h.wait_for(&id, DeploymentStatus::Building).await;
    let requested = h.app.scheduler.cancel(&id).await.unwrap();
    assert_eq!(requested.status, DeploymentStatus::Building);

    let done = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(done.status, DeploymentStatus::Cancelled);
    assert!(done.error.is_none());

    let binding = h.app.directory.lookup(&h.hostname("slow")).await.unwrap();
    assert!(binding.active_deployment.is_none());
    assert!(h.edge.routes().await.is_empty());

    // cancelling again is a no-op
    let again = h.app.scheduler.cancel(&id).await.unwrap();
    assert_eq!(again.status, DeploymentStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let (queued, _) = h.submit(&project, "cafe1", "main").await;

    let cancelled = h.app.scheduler.cancel(&queued.id).await.unwrap();
    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
    assert_eq!(h.app.scheduler.queue_depth().total(), 0);

    // a worker that already popped it cannot claim it
    let run = h
        .app
        .scheduler
        .run_one(common::WORKER, &queued.id, &h.app.pipeline)
        .await;
    assert!(run.is_none());
}

#[tokio::test]
async fn test_cancel_rejects_finished_deployment() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let done = h.deploy(&project, "cafe1", "main").await;

    let result = h.app.scheduler.cancel(&done.id).await;
    assert!(matches!(result, Err(shipyard::errors::ShipyardError::Conflict(_))));
}

#[tokio::test]
async fn test_pipeline_time_limit_fails_the_run() {
    let h = Harness::with_options(|options| {
        options.scheduler.pipeline_timeout = Duration::from_millis(300);
    })
    .await;
    let project = h.project("slow", build_with("sleep 30")).await;

    let done = tokio::time::timeout(Duration::from_secs(10), h.deploy(&project, "cafe1", "main"))
        .await
        .unwrap();
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(done.error.unwrap().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_submit_is_idempotent_while_in_flight() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;

    let (first, created) = h.submit(&project, "cafe1", "main").await;
    assert!(created);
    let (second, created) = h.submit(&project, "cafe1", "main").await;
    assert!(!created);
    assert_eq!(first.id, second.id);
    assert_eq!(h.app.scheduler.queue_depth().total(), 1);

    // the same commit on another branch builds for the other role
    let (staging, created) = h.submit(&project, "cafe1", "develop").await;
    assert!(created);
    assert_ne!(staging.id, first.id);

    h.run_next().await;
    h.run_next().await;

    // once finished, the same revision may be deployed again
    let (redeploy, created) = h.submit(&project, "cafe1", "main").await;
    assert!(created);
    assert_ne!(redeploy.id, first.id);
}

#[tokio::test]
async fn test_submit_validates_before_queueing() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;

    let bad = [
        (" ", "main"),
        ("--upload-pack=touch /tmp/owned", "main"),
        ("-c", "main"),
        ("HEAD", "main"),
        ("cafe1", "--upload-pack=touch /tmp/owned"),
    ];
    for (commit, branch) in bad {
        let result = h
            .app
            .scheduler
            .submit(shipyard::scheduler::dispatch::SubmitRequest {
                project_id: project.id.clone(),
                revision: shipyard::models::deployment::SourceRevision {
                    commit: commit.to_string(),
                    branch: branch.to_string(),
                },
                role: None,
                trigger: shipyard::models::deployment::TriggerKind::Manual,
                promote_to: None,
            })
            .await;
        assert!(
            matches!(result, Err(shipyard::errors::ShipyardError::ValidationError(_))),
            "{:?} on {:?} was accepted",
            commit,
            branch
        );
    }
    assert_eq!(h.app.scheduler.queue_depth().total(), 0);
    assert!(h.app.state.list_deployments(&project.id).await.is_empty());
}

#[tokio::test]
async fn test_lost_worker_is_retried() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let (queued, _) = h.submit(&project, "cafe1", "main").await;

    // a worker claims it and vanishes
    h.app
        .state
        .claim(&queued.id, "ghost", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let retries = h.app.scheduler.reap_expired_leases().await;
    assert_eq!(retries.len(), 1);
    let retry = &retries[0];
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.retry_of.as_deref(), Some(queued.id.as_str()));

    let lost = h.app.state.get_deployment(&queued.id).await.unwrap();
    assert_eq!(lost.status, DeploymentStatus::Failed);
    assert_eq!(lost.error.unwrap().kind, FailureKind::WorkerLost);

    let done = h.run_next().await;
    assert_eq!(done.id, retry.id);
    assert_eq!(done.status, DeploymentStatus::Active);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let h = Harness::with_options(|options| options.scheduler.max_attempts = 1).await;
    let project = h.project("site", static_build()).await;
    let (queued, _) = h.submit(&project, "cafe1", "main").await;

    h.app
        .state
        .claim(&queued.id, "ghost", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(h.app.scheduler.reap_expired_leases().await.is_empty());
    let lost = h.app.state.get_deployment(&queued.id).await.unwrap();
    assert_eq!(lost.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_stuck_run_is_forced_to_cancelled_after_the_grace_period() {
    let h = Harness::with_backends(
        Settings::default(),
        |options| options.scheduler.cancel_grace = Duration::from_millis(200),
        |backends| backends.fetcher = Arc::new(StallingFetcher),
    )
    .await;
    let project = h.project("site", static_build()).await;
    let (queued, _) = h.submit(&project, "cafe1", "main").await;
    let run = h.spawn_next();

    h.wait_for(&queued.id, DeploymentStatus::Cloning).await;
    let requested = h.app.scheduler.cancel(&queued.id).await.unwrap();
    assert_eq!(requested.status, DeploymentStatus::Cloning);

    let forced = h.wait_for(&queued.id, DeploymentStatus::Cancelled).await;
    assert!(forced.finished_at.is_some());
    assert!(forced.lease.is_none());
    // the worker is still stuck in its fetch
    assert!(!run.is_finished());

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());
    assert_eq!(h.app.scheduler.running_count(), 0);
    let again = h.app.scheduler.cancel(&queued.id).await.unwrap();
    assert_eq!(again.status, DeploymentStatus::Cancelled);
}

#[tokio::test]
async fn test_partial_upload_leaves_nothing_behind() {
    let mut store = None;
    let h = Harness::with_backends(Settings::default(), |_| {}, |backends| {
        store = Some(FaultyStore::install(backends));
    })
    .await;
    let store = store.unwrap();
    store.fail_puts_ending_with("broken.css");
    let project = h.project("site", static_build()).await;
    h.write_source("site", "dist/app.js", "console.log(1)").await;
    h.write_source("site", "dist/broken.css", "body {}").await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert_eq!(done.error.unwrap().step, Some(BuildStep::Publish));
    assert!(done.artifact.is_none());

    for file in ["index.html", "app.js", "broken.css"] {
        let path = h.objects.object_path(&format!("site/{}/{}", done.id, file));
        assert!(!path.exists(), "{} survived the failed upload", file);
    }
    let binding = h.app.directory.lookup(&h.hostname("site")).await.unwrap();
    assert!(binding.active_deployment.is_none());
    assert!(h.edge.routes().await.is_empty());
}

#[tokio::test]
async fn test_cancel_recorded_during_activation_wins_over_completion() {
    let mut store = None;
    let h = Harness::with_backends(Settings::default(), |_| {}, |backends| {
        store = Some(FaultyStore::install(backends));
    })
    .await;
    let store = store.unwrap();
    let project = h.project("site", static_build()).await;

    store.hold_next_exists();
    let (queued, _) = h.submit(&project, "cafe1", "main").await;
    let run = h.spawn_next();
    store.held().await;

    // the cancel lands durably but the stop signal never reaches the run
    let requested = h.app.state.request_cancel(&queued.id).await.unwrap();
    assert_eq!(requested.status, DeploymentStatus::Activating);
    store.release();

    let done = run.await.unwrap();
    assert_eq!(done.status, DeploymentStatus::Cancelled);
    assert!(done.activated_at.is_none());
    let binding = h.app.directory.lookup(&h.hostname("site")).await.unwrap();
    assert!(binding.active_deployment.is_none());
    assert!(h.edge.routes().await.is_empty());
}

#[tokio::test]
async fn test_crashed_run_releases_its_lease_and_the_worker_carries_on() {
    let h = Harness::with_backends(
        Settings::default(),
        |options| {
            options.scheduler.lease_ttl = Duration::from_millis(300);
            options.scheduler.heartbeat_interval = Duration::from_millis(50);
        },
        |backends| backends.fetcher = Arc::new(CrashOnceFetcher::default()),
    )
    .await;
    let project = h.project("site", static_build()).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = {
        let scheduler = h.app.scheduler.clone();
        let pipeline = h.app.pipeline.clone();
        tokio::spawn(async move {
            let options = builder::Options {
                worker_id: "crashy".to_string(),
            };
            let shutdown = Box::pin(async move {
                let _ = shutdown_rx.await;
            });
            builder::run(&options, scheduler, pipeline, shutdown).await;
        })
    };

    let (queued, _) = h.submit(&project, "cafe1", "main").await;

    // the crashed run stops renewing, so the reaper gets to retry it
    let retries = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let retries = h.app.scheduler.reap_expired_leases().await;
            if !retries.is_empty() {
                return retries;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the crashed run kept its lease");
    assert_eq!(retries[0].retry_of.as_deref(), Some(queued.id.as_str()));
    let lost = h.app.state.get_deployment(&queued.id).await.unwrap();
    assert_eq!(lost.error.unwrap().kind, FailureKind::WorkerLost);

    // the same worker picks up the retry
    let retried = h.wait_for(&retries[0].id, DeploymentStatus::Active).await;
    assert_eq!(retried.attempt, 2);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
}
