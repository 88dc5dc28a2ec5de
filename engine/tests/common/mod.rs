//! Shared harness for the integration tests: a full engine over a temporary
//! data directory, local backends and sources copied from disk.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use shipyard::app::options::AppOptions;
use shipyard::app::state::{AppState, Backends, ProjectRequest};
use shipyard::deploy::git::CopyFetcher;
use shipyard::errors::RemoteError;
use shipyard::filesys::dir::Dir;
use shipyard::models::deployment::{Deployment, DeploymentStatus, SourceRevision, TriggerKind};
use shipyard::models::project::{BuildConfig, CommandSetting, Project};
use shipyard::publish::object_store::{LocalObjectStore, ObjectMeta, ObjectStore};
use shipyard::publish::runtime::LocalComputeRuntime;
use shipyard::routing::edge::LocalEdge;
use shipyard::scheduler::dispatch::SubmitRequest;
use shipyard::storage::layout::StorageLayout;
use shipyard::storage::settings::Settings;
use shipyard::storage::state::StateStore;

pub const WORKER: &str = "test-worker";

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub app: Arc<AppState>,
    pub edge: Arc<LocalEdge>,
    pub objects: Arc<LocalObjectStore>,
    pub runtime: Arc<LocalComputeRuntime>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(|_| {}).await
    }

    pub async fn with_options(configure: impl FnOnce(&mut AppOptions)) -> Self {
        Self::with_settings(Settings::default(), configure).await
    }

    pub async fn with_settings(settings: Settings, configure: impl FnOnce(&mut AppOptions)) -> Self {
        Self::with_backends(settings, configure, |_| {}).await
    }

    /// Like [`Harness::with_settings`], with a hook to wrap or swap the
    /// local backends before the engine is wired around them
    pub async fn with_backends(
        settings: Settings,
        configure: impl FnOnce(&mut AppOptions),
        wrap: impl FnOnce(&mut Backends),
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path().join("data"));
        layout.setup().await.unwrap();

        let mut options = AppOptions::from_settings(layout.clone(), settings);
        configure(&mut options);

        let edge = Arc::new(LocalEdge::in_memory());
        let objects = Arc::new(LocalObjectStore::new(layout.objects_dir()));
        let runtime = Arc::new(LocalComputeRuntime::new(layout.functions_dir()));
        let mut backends = Backends {
            store: objects.clone(),
            runtime: runtime.clone(),
            edge: edge.clone(),
            fetcher: Arc::new(CopyFetcher),
        };
        wrap(&mut backends);

        let app = AppState::assemble(
            "test".to_string(),
            &options,
            Arc::new(StateStore::in_memory()),
            backends,
        )
        .await
        .unwrap();

        Self {
            tmp,
            app: Arc::new(app),
            edge,
            objects,
            runtime,
        }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.tmp.path().join("data"))
    }

    /// Source tree of a project
    pub fn source_dir(&self, slug: &str) -> PathBuf {
        self.tmp.path().join("sources").join(slug)
    }

    pub async fn write_source(&self, slug: &str, relative: &str, contents: &str) {
        Dir::new(self.source_dir(slug))
            .file(relative)
            .write_bytes(contents.as_bytes())
            .await
            .unwrap();
    }

    /// Register a project whose source holds `dist/index.html`
    pub async fn project(&self, slug: &str, build: BuildConfig) -> Project {
        self.write_source(slug, "dist/index.html", &format!("<h1>{}</h1>", slug))
            .await;
        self.app
            .register_project(
                None,
                ProjectRequest {
                    slug: slug.to_string(),
                    repo_url: format!("file://{}", self.source_dir(slug).display()),
                    production_branch: None,
                    build,
                },
            )
            .await
            .unwrap()
    }

    pub async fn submit(&self, project: &Project, commit: &str, branch: &str) -> (Deployment, bool) {
        self.app
            .scheduler
            .submit(SubmitRequest {
                project_id: project.id.clone(),
                revision: SourceRevision {
                    commit: commit.to_string(),
                    branch: branch.to_string(),
                },
                role: None,
                trigger: TriggerKind::Manual,
                promote_to: None,
            })
            .await
            .unwrap()
    }

    /// Take queued deployments until one can be claimed and run it
    pub async fn run_next(&self) -> Deployment {
        loop {
            let id = tokio::time::timeout(Duration::from_secs(5), self.app.scheduler.next_queued())
                .await
                .expect("nothing queued");
            if let Some(done) = self.app.scheduler.run_one(WORKER, &id, &self.app.pipeline).await {
                return done;
            }
        }
    }

    /// Submit and run one revision
    pub async fn deploy(&self, project: &Project, commit: &str, branch: &str) -> Deployment {
        let (queued, created) = self.submit(project, commit, branch).await;
        assert!(created, "{} was already in flight", commit);
        let done = self.run_next().await;
        assert_eq!(done.id, queued.id);
        done
    }

    /// Poll until the deployment reaches `status`
    pub async fn wait_for(&self, id: &str, status: DeploymentStatus) -> Deployment {
        let wait = async {
            loop {
                if let Some(deployment) = self.app.state.get_deployment(id).await {
                    if deployment.status == status {
                        return deployment;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}", id, status))
    }

    /// Run the next queued deployment on a background task
    pub fn spawn_next(&self) -> tokio::task::JoinHandle<Deployment> {
        let app = self.app.clone();
        tokio::spawn(async move {
            let id = tokio::time::timeout(Duration::from_secs(5), app.scheduler.next_queued())
                .await
                .expect("nothing queued");
            app.scheduler
                .run_one(WORKER, &id, &app.pipeline)
                .await
                .expect("deployment was not claimable")
        })
    }

    pub fn hostname(&self, slug: &str) -> String {
        format!("{}.{}", slug, self.app.platform_domain)
    }

    pub fn staging_hostname(&self, slug: &str) -> String {
        format!("{}-staging.{}", slug, self.app.platform_domain)
    }
}

/// A static site served straight from the source's `dist/`
pub fn static_build() -> BuildConfig {
    BuildConfig {
        install_command: CommandSetting::Skip,
        build_command: CommandSetting::Skip,
        ..Default::default()
    }
}

pub fn build_with(command: &str) -> BuildConfig {
    BuildConfig {
        build_command: CommandSetting::Run(command.to_string()),
        ..static_build()
    }
}

/// Object store that fails or stalls on demand in front of a real one
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    /// Uploads of paths ending with this are rejected
    fail_put_suffix: Mutex<Option<String>>,
    fail_deletes: AtomicBool,
    hold_exists: AtomicBool,
    held: Notify,
    release: Notify,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_put_suffix: Mutex::new(None),
            fail_deletes: AtomicBool::new(false),
            hold_exists: AtomicBool::new(false),
            held: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Swap the harness object store for a faulty one wrapping it
    pub fn install(backends: &mut Backends) -> Arc<Self> {
        let store = Arc::new(Self::new(backends.store.clone()));
        backends.store = store.clone();
        store
    }

    pub fn fail_puts_ending_with(&self, suffix: &str) {
        *self.fail_put_suffix.lock().unwrap() = Some(suffix.to_string());
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// The next `exists` call blocks until [`FaultyStore::release`]
    pub fn hold_next_exists(&self) {
        self.hold_exists.store(true, Ordering::SeqCst);
    }

    /// Wait until a held `exists` call is blocked
    pub async fn held(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.held.notified())
            .await
            .expect("no exists call was held");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, meta: &ObjectMeta) -> Result<(), RemoteError> {
        let rejected = self
            .fail_put_suffix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|suffix| path.ends_with(suffix));
        if rejected {
            return Err(RemoteError::Rejected {
                status: 403,
                message: format!("refusing {}", path),
            });
        }
        self.inner.put(path, bytes, meta).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.inner.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        if self.hold_exists.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.release.notified().await;
        }
        self.inner.exists(path).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected {
                status: 403,
                message: format!("deletes under {} are denied", prefix),
            });
        }
        self.inner.delete_prefix(prefix).await
    }
}
