//! Activation tests: promotion, rollback, retention and edge consistency

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{build_with, static_build, FaultyStore, Harness};
use shipyard::app::state::Promotion;
use shipyard::errors::ShipyardError;
use shipyard::models::binding::{ArtifactLocation, HostnameBinding};
use shipyard::models::deployment::{DeploymentStatus, RoutingRole, TriggerKind};
use shipyard::models::project::{ArtifactKind, BuildConfig, CommandSetting};
use shipyard::routing::edge::EdgeControlPlane;
use shipyard::storage::settings::Settings;

fn service_build() -> BuildConfig {
    BuildConfig {
        kind: ArtifactKind::Service,
        start_command: CommandSetting::Run("node server.js".to_string()),
        entry_point: Some("server.js".to_string()),
        ..static_build()
    }
}

#[tokio::test]
async fn test_rollback_round_trip() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let host = h.hostname("site");

    let first = h.deploy(&project, "cafe1", "main").await;
    h.write_source("site", "dist/index.html", "<h1>v2</h1>").await;
    let second = h.deploy(&project, "cafe2", "main").await;
    assert_eq!(h.edge.routes().await[&host].deployment_id, second.id);

    let rolled = h.app.rollback(&host, None).await.unwrap();
    assert_eq!(rolled.active_deployment.as_deref(), Some(first.id.as_str()));
    let route = &h.edge.routes().await[&host];
    assert_eq!(route.deployment_id, first.id);
    assert_eq!(route.revision, "cafe1");

    // nothing older than the first deployment
    let result = h.app.rollback(&host, None).await;
    assert!(matches!(result, Err(ShipyardError::Conflict(_))));

    // an explicit target rolls forward again
    let forward = h.app.rollback(&host, Some(&second.id)).await.unwrap();
    assert_eq!(forward.active_deployment.as_deref(), Some(second.id.as_str()));
    assert_eq!(h.edge.routes().await[&host].deployment_id, second.id);

    // no rebuild happened
    assert_eq!(h.app.state.list_deployments(&project.id).await.len(), 2);
}

#[tokio::test]
async fn test_activation_rejects_unservable_deployments() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let other = h.project("other", static_build()).await;
    let host = h.hostname("site");

    let live = h.deploy(&project, "cafe1", "main").await;
    let staging = h.deploy(&project, "cafe2", "develop").await;
    let foreign = h.deploy(&other, "cafe1", "main").await;

    // failed deployments never serve
    h.write_source("site", "fail.sh", "exit 1").await;
    let mut broken_build = static_build();
    broken_build.build_command = CommandSetting::Run("sh fail.sh".to_string());
    let broken_project = h
        .app
        .register_project(
            Some(project.id.clone()),
            shipyard::app::state::ProjectRequest {
                slug: project.slug.clone(),
                repo_url: project.repo_url.clone(),
                production_branch: None,
                build: broken_build,
            },
        )
        .await
        .unwrap();
    let failed = h.deploy(&broken_project, "cafe3", "main").await;
    assert_eq!(failed.status, DeploymentStatus::Failed);

    let result = h.app.directory.activate(&host, &failed.id).await;
    assert!(matches!(result, Err(ShipyardError::ActivationError(_))));

    let result = h.app.directory.activate(&host, &staging.id).await;
    assert!(matches!(result, Err(ShipyardError::Conflict(_))));

    let result = h.app.directory.activate(&host, &foreign.id).await;
    assert!(matches!(result, Err(ShipyardError::Conflict(_))));

    let result = h.app.directory.activate("unknown.example.com", &live.id).await;
    assert!(matches!(result, Err(ShipyardError::NotFound(_))));

    // the live deployment kept the hostname throughout
    let binding = h.app.directory.lookup(&host).await.unwrap();
    assert_eq!(binding.active_deployment.as_deref(), Some(live.id.as_str()));
    assert_eq!(h.edge.routes().await[&host].deployment_id, live.id);
}

#[tokio::test]
async fn test_retention_keeps_recent_and_pinned() {
    let h = Harness::with_options(|options| options.retention.keep_recent = 3).await;
    let project = h.project("site", static_build()).await;

    let mut deployments = Vec::new();
    for n in 1..=5 {
        h.write_source("site", "dist/index.html", &format!("<h1>v{}</h1>", n))
            .await;
        deployments.push(h.deploy(&project, &format!("cafe{}", n), "main").await);
    }

    // pin the oldest behind a manually managed hostname
    let pinned_host = "pinned.example.com";
    h.app
        .directory
        .bind(HostnameBinding::new(
            pinned_host.to_string(),
            project.id.clone(),
            RoutingRole::Production,
            false,
        ))
        .await
        .unwrap();
    h.app
        .directory
        .activate(pinned_host, &deployments[0].id)
        .await
        .unwrap();

    let report = h.app.sweeper.sweep_project(&project.id).await.unwrap();
    assert_eq!(report.purged, vec![deployments[1].id.clone()]);
    assert_eq!(report.kept, 4);
    assert!(report.failed.is_empty());
    assert!(report.deleted_objects > 0);

    let purged = h.app.state.get_deployment(&deployments[1].id).await.unwrap();
    assert_eq!(purged.status, DeploymentStatus::Purged);
    let prefix = purged.artifact.as_ref().unwrap().prefix().to_string();
    assert!(!h
        .objects
        .object_path(&format!("{}/index.html", prefix))
        .exists());

    // the log outlives the artifact
    let lines = h.app.logs.read(&purged.id, 0, 100).await.unwrap();
    assert!(!lines.is_empty());

    for kept in [&deployments[0], &deployments[2], &deployments[3], &deployments[4]] {
        let kept = h.app.state.get_deployment(&kept.id).await.unwrap();
        assert_eq!(kept.status, DeploymentStatus::Active);
    }

    let result = h.app.rollback(&h.hostname("site"), Some(&purged.id)).await;
    assert!(matches!(result, Err(ShipyardError::ActivationError(_))));

    // a second sweep finds nothing new
    let again = h.app.sweeper.sweep_project(&project.id).await.unwrap();
    assert!(again.purged.is_empty());
}

#[tokio::test]
async fn test_concurrent_activations_stay_consistent() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let host = h.hostname("site");

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(h.deploy(&project, &format!("cafe{}", n), "main").await.id);
    }

    let mut tasks = Vec::new();
    for round in 0..12 {
        let directory = Arc::clone(&h.app.directory);
        let host = host.clone();
        let id = ids[round % ids.len()].clone();
        tasks.push(tokio::spawn(async move { directory.activate(&host, &id).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let binding = h.app.directory.lookup(&host).await.unwrap();
    let active = binding.active_deployment.clone().unwrap();
    assert_eq!(binding.value.as_ref().unwrap().deployment_id, active);
    assert_eq!(h.edge.routes().await[&host].deployment_id, active);
    assert!(!h.app.directory.is_activating(&active));
}

#[tokio::test]
async fn test_deactivate_then_resync() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let host = h.hostname("site");
    let done = h.deploy(&project, "cafe1", "main").await;

    let cleared = h.app.directory.deactivate(&host).await.unwrap();
    assert!(cleared.active_deployment.is_none());
    assert!(!h.edge.routes().await.contains_key(&host));

    h.app.directory.activate(&host, &done.id).await.unwrap();

    // the edge loses its state; durable bindings rebuild it
    h.edge.delete_mapping(&host).await.unwrap();
    assert!(h.edge.routes().await.is_empty());

    let report = h.app.directory.resync().await;
    assert_eq!(report.mapped, 1);
    assert_eq!(report.cleared, 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.edge.routes().await[&host].deployment_id, done.id);
}

#[tokio::test]
async fn test_unbind_removes_the_hostname() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let host = h.hostname("site");
    h.deploy(&project, "cafe1", "main").await;

    h.app.directory.unbind(&host).await.unwrap();
    assert!(h.app.directory.lookup(&host).await.is_none());
    assert!(!h.edge.routes().await.contains_key(&host));
}

#[tokio::test]
async fn test_promotion_across_roles_rebuilds() {
    let h = Harness::new().await;
    let project = h.project("site", static_build()).await;
    let www = "www.example.com";
    h.app
        .directory
        .bind(HostnameBinding::new(
            www.to_string(),
            project.id.clone(),
            RoutingRole::Production,
            false,
        ))
        .await
        .unwrap();

    let staged = h.deploy(&project, "cafe1", "develop").await;
    assert_eq!(staged.role, RoutingRole::Staging);

    let rebuild = match h.app.promote(www, &staged.id).await.unwrap() {
        Promotion::Queued(rebuild) => rebuild,
        other => panic!("expected a rebuild, got {:?}", other),
    };
    assert_eq!(rebuild.role, RoutingRole::Production);
    assert_eq!(rebuild.trigger, TriggerKind::Promotion);
    assert_eq!(rebuild.revision.commit, "cafe1");
    assert_eq!(rebuild.promote_to.as_deref(), Some(www));

    let done = h.run_next().await;
    assert_eq!(done.id, rebuild.id);
    assert_eq!(done.status, DeploymentStatus::Active);

    let binding = h.app.directory.lookup(www).await.unwrap();
    assert_eq!(binding.active_deployment.as_deref(), Some(done.id.as_str()));
    assert_eq!(h.edge.routes().await[www].deployment_id, done.id);

    // same role activates directly
    let again = h.app.promote(www, &done.id).await.unwrap();
    assert!(matches!(again, Promotion::Activated(_)));
}

#[tokio::test]
async fn test_service_project_registers_a_function() {
    let h = Harness::new().await;
    h.write_source("api", "dist/server.js", "require('http').createServer().listen(8080);")
        .await;
    let project = h.project("api", service_build()).await;

    let done = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(done.status, DeploymentStatus::Active);

    let function = project.function_name(RoutingRole::Production);
    match done.artifact.as_ref().unwrap() {
        ArtifactLocation::Service {
            function: registered,
            endpoint,
            ..
        } => {
            assert_eq!(registered, &function);
            assert_eq!(endpoint, &format!("local://functions/{}", function));
        }
        other => panic!("unexpected artifact {:?}", other),
    }

    let dir = h.runtime.function_dir(&function);
    assert!(dir.file("function.json").exists().await);
    assert!(dir.subdir("bundle").file("server.js").exists().await);

    let route = &h.edge.routes().await[&h.hostname("api")];
    assert!(matches!(route.target, ArtifactLocation::Service { .. }));
}

#[tokio::test]
async fn test_service_without_start_command_is_rejected() {
    let h = Harness::new().await;
    let build = BuildConfig {
        kind: ArtifactKind::Service,
        ..build_with("true")
    };
    let result = h
        .app
        .register_project(
            None,
            shipyard::app::state::ProjectRequest {
                slug: "api".to_string(),
                repo_url: "file:///nowhere".to_string(),
                production_branch: None,
                build,
            },
        )
        .await;
    assert!(matches!(result, Err(ShipyardError::ConfigError(_))));
}

#[tokio::test]
async fn test_sweeps_racing_promotions_never_purge_a_live_artifact() {
    let h = Harness::with_options(|options| options.retention.keep_recent = 0).await;
    let project = h.project("site", static_build()).await;
    let host = h.hostname("site");

    let mut ids = Vec::new();
    for n in 1..=4 {
        ids.push(h.deploy(&project, &format!("cafe{}", n), "main").await.id);
    }

    let mut tasks = Vec::new();
    for round in 0..8 {
        let directory = Arc::clone(&h.app.directory);
        let host = host.clone();
        let id = ids[round % ids.len()].clone();
        tasks.push(tokio::spawn(async move {
            // losing the race to the sweeper is the only acceptable failure
            match directory.activate(&host, &id).await {
                Ok(_) | Err(ShipyardError::ActivationError(_)) => {}
                Err(e) => panic!("unexpected activation error: {}", e),
            }
        }));
        let sweeper = Arc::clone(&h.app.sweeper);
        let project_id = project.id.clone();
        tasks.push(tokio::spawn(async move {
            sweeper.sweep_project(&project_id).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let binding = h.app.directory.lookup(&host).await.unwrap();
    let active = h
        .app
        .state
        .get_deployment(binding.active_deployment.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(active.status, DeploymentStatus::Active);
    let prefix = active.artifact.as_ref().unwrap().prefix().to_string();
    assert!(h
        .objects
        .object_path(&format!("{}/index.html", prefix))
        .exists());
    assert_eq!(h.edge.routes().await[&host].deployment_id, active.id);

    let pointer = h.app.state.get_project(&project.id).await.unwrap();
    let pointed = h
        .app
        .state
        .get_deployment(pointer.active_production.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(pointed.status, DeploymentStatus::Active);
}

#[tokio::test]
async fn test_cancel_while_activating_keeps_the_live_service() {
    let mut store = None;
    let h = Harness::with_backends(Settings::default(), |_| {}, |backends| {
        store = Some(FaultyStore::install(backends));
    })
    .await;
    let store = store.unwrap();

    h.write_source("api", "dist/server.js", "// v1").await;
    let project = h.project("api", service_build()).await;
    let live = h.deploy(&project, "cafe1", "main").await;
    assert_eq!(live.status, DeploymentStatus::Active);
    let function = project.function_name(RoutingRole::Production);
    let served = h.runtime.function_dir(&function).subdir("bundle").file("server.js");
    assert_eq!(served.read_string().await.unwrap(), "// v1");

    // stop the next run inside ACTIVATING, at its manifest check
    h.write_source("api", "dist/server.js", "// v2").await;
    store.hold_next_exists();
    let (queued, _) = h.submit(&project, "cafe2", "main").await;
    let run = h.spawn_next();
    store.held().await;
    let activating = h.app.state.get_deployment(&queued.id).await.unwrap();
    assert_eq!(activating.status, DeploymentStatus::Activating);

    let requested = h.app.scheduler.cancel(&queued.id).await.unwrap();
    assert!(requested.cancel_requested);
    store.release();
    let done = run.await.unwrap();
    assert_eq!(done.status, DeploymentStatus::Cancelled);

    // nothing of the cancelled deployment reached the runtime
    assert_eq!(served.read_string().await.unwrap(), "// v1");
    assert_eq!(
        h.app.state.function_deployment(&function).await.as_deref(),
        Some(live.id.as_str())
    );
    let binding = h.app.directory.lookup(&h.hostname("api")).await.unwrap();
    assert_eq!(binding.active_deployment.as_deref(), Some(live.id.as_str()));
    assert_eq!(h.edge.routes().await[&h.hostname("api")].deployment_id, live.id);
}

#[tokio::test]
async fn test_service_loads_only_when_a_hostname_activates_it() {
    let h = Harness::new().await;
    h.write_source("api", "dist/server.js", "// v1").await;
    let project = h.project("api", service_build()).await;
    let live = h.deploy(&project, "cafe1", "main").await;

    // a manually managed binding holds the live deployment
    let host = h.hostname("api");
    h.app
        .directory
        .bind(HostnameBinding::new(
            host.clone(),
            project.id.clone(),
            RoutingRole::Production,
            false,
        ))
        .await
        .unwrap();

    h.write_source("api", "dist/server.js", "// v2").await;
    let fresh = h.deploy(&project, "cafe2", "main").await;
    assert_eq!(fresh.status, DeploymentStatus::Active);

    let function = project.function_name(RoutingRole::Production);
    let served = h.runtime.function_dir(&function).subdir("bundle").file("server.js");
    assert_eq!(served.read_string().await.unwrap(), "// v1");
    assert_eq!(
        h.app.state.function_deployment(&function).await.as_deref(),
        Some(live.id.as_str())
    );

    h.app.directory.activate(&host, &fresh.id).await.unwrap();
    assert_eq!(served.read_string().await.unwrap(), "// v2");
    let loaded = h.app.state.get_deployment(&fresh.id).await.unwrap();
    match loaded.artifact.unwrap() {
        ArtifactLocation::Service { endpoint, .. } => assert!(!endpoint.is_empty()),
        other => panic!("unexpected artifact {:?}", other),
    }

    // rolling back reloads the earlier bundle
    h.app.directory.activate(&host, &live.id).await.unwrap();
    assert_eq!(served.read_string().await.unwrap(), "// v1");
}

#[tokio::test]
async fn test_failed_byte_deletes_are_retried_by_the_next_sweep() {
    let mut store = None;
    let h = Harness::with_backends(
        Settings::default(),
        |options| options.retention.keep_recent = 1,
        |backends| store = Some(FaultyStore::install(backends)),
    )
    .await;
    let store = store.unwrap();
    let project = h.project("site", static_build()).await;
    let old = h.deploy(&project, "cafe1", "main").await;
    h.deploy(&project, "cafe2", "main").await;
    let prefix = old.artifact.as_ref().unwrap().prefix().to_string();
    let index = h.objects.object_path(&format!("{}/index.html", prefix));

    store.fail_deletes(true);
    let first = h.app.sweeper.sweep_project(&project.id).await.unwrap();
    assert_eq!(first.purged, vec![old.id.clone()]);
    assert_eq!(first.failed, vec![old.id.clone()]);
    assert!(index.exists());
    let purged = h.app.state.get_deployment(&old.id).await.unwrap();
    assert_eq!(purged.status, DeploymentStatus::Purged);
    assert!(!purged.bytes_reclaimed);

    store.fail_deletes(false);
    let second = h.app.sweeper.sweep_project(&project.id).await.unwrap();
    assert!(second.purged.is_empty());
    assert_eq!(second.reclaimed, vec![old.id.clone()]);
    assert!(second.failed.is_empty());
    assert!(!index.exists());
    assert!(h.app.state.get_deployment(&old.id).await.unwrap().bytes_reclaimed);

    // nothing is left to reclaim afterwards
    let third = h.app.sweeper.sweep_project(&project.id).await.unwrap();
    assert!(third.reclaimed.is_empty());
}
