//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::ShipyardError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{builder, reaper, sweeper};

/// Run the Shipyard engine
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ShipyardError> {
    info!("Initializing Shipyard engine...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), &options);

    if let Err(e) = init(version, &options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start engine: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn shutdown_future(mut shutdown_rx: broadcast::Receiver<()>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = shutdown_rx.recv().await;
    })
}

// =============================== INITIALIZATION ================================== //

async fn init(
    version: String,
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, ShipyardError> {
    let app_state = Arc::new(AppState::init(version, options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    app_state.recover().await;

    init_build_workers(options, app_state.clone(), shutdown_manager, &shutdown_tx)?;

    init_reaper_worker(
        options.reaper_worker.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_sweeper {
        init_sweeper_worker(
            options.sweeper_worker.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(app_state)
}

fn init_build_workers(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), ShipyardError> {
    let concurrency = options.scheduler.concurrency;
    info!("Initializing {} build workers...", concurrency);

    for index in 0..concurrency {
        let worker_options = builder::Options {
            worker_id: format!("builder-{}-{}", std::process::id(), index),
        };
        let scheduler = app_state.scheduler.clone();
        let pipeline = app_state.pipeline.clone();
        let shutdown = shutdown_future(shutdown_tx.subscribe());

        let handle = tokio::spawn(async move {
            builder::run(&worker_options, scheduler, pipeline, shutdown).await;
        });
        shutdown_manager.with_build_worker_handle(handle);
    }
    Ok(())
}

fn init_reaper_worker(
    options: reaper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ShipyardError> {
    info!("Initializing lease reaper worker...");

    let scheduler = app_state.scheduler.clone();
    let handle = tokio::spawn(async move {
        reaper::run(&options, scheduler, tokio::time::sleep, shutdown_future(shutdown_rx)).await;
    });

    shutdown_manager.with_reaper_worker_handle(handle)
}

fn init_sweeper_worker(
    options: sweeper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ShipyardError> {
    info!("Initializing retention sweeper worker...");

    let retention = app_state.sweeper.clone();
    let handle = tokio::spawn(async move {
        sweeper::run(&options, retention, tokio::time::sleep, shutdown_future(shutdown_rx)).await;
    });

    shutdown_manager.with_sweeper_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ShipyardError> {
    info!("Initializing HTTP control API...");

    let server_state = ServerState::new(app_state);
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    max_shutdown_delay: std::time::Duration,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), ShipyardError>>>,
    build_worker_handles: Vec<JoinHandle<()>>,
    reaper_worker_handle: Option<JoinHandle<()>>,
    sweeper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, options: &AppOptions) -> Self {
        Self {
            shutdown_tx,
            max_shutdown_delay: options.lifecycle.max_shutdown_delay,
            app_state: None,
            server_handle: None,
            build_worker_handles: Vec::new(),
            reaper_worker_handle: None,
            sweeper_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ShipyardError> {
        if self.app_state.is_some() {
            return Err(ShipyardError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_build_worker_handle(&mut self, handle: JoinHandle<()>) {
        self.build_worker_handles.push(handle);
    }

    pub fn with_reaper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ShipyardError> {
        if self.reaper_worker_handle.is_some() {
            return Err(ShipyardError::ShutdownError("reaper_handle already set".to_string()));
        }
        self.reaper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_sweeper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ShipyardError> {
        if self.sweeper_worker_handle.is_some() {
            return Err(ShipyardError::ShutdownError("sweeper_handle already set".to_string()));
        }
        self.sweeper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ShipyardError>>,
    ) -> Result<(), ShipyardError> {
        if self.server_handle.is_some() {
            return Err(ShipyardError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ShipyardError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ShipyardError> {
        info!("Shutting down Shipyard engine...");

        // 1. Server, so no new work arrives
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ShipyardError::ShutdownError(e.to_string()))??;
        }

        // 2. Build workers finish the deployment they hold
        for handle in self.build_worker_handles.drain(..) {
            handle.await.map_err(|e| ShipyardError::ShutdownError(e.to_string()))?;
        }

        // 3. Reaper worker
        if let Some(handle) = self.reaper_worker_handle.take() {
            handle.await.map_err(|e| ShipyardError::ShutdownError(e.to_string()))?;
        }

        // 4. Sweeper worker
        if let Some(handle) = self.sweeper_worker_handle.take() {
            handle.await.map_err(|e| ShipyardError::ShutdownError(e.to_string()))?;
        }

        // 5. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
