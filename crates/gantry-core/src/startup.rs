//! Application assembly: wires the config store, loader, watchdog, and
//! installer together from one immutable [`AppOptions`] value.

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::gallery::{self, Gallery, GalleryInstaller, InstallJob};
use crate::loader::ModelLoader;
use crate::options::AppOptions;
use crate::watchdog::Watchdog;

/// The assembled gateway core shared by the HTTP surface and the CLI.
pub struct Application {
    pub opts: AppOptions,
    pub store: Arc<ConfigStore>,
    pub loader: Arc<ModelLoader>,
    pub dispatcher: Arc<Dispatcher>,
    pub installer: Arc<GalleryInstaller>,
    /// Registered galleries; mutable through the management endpoints.
    pub galleries: Arc<RwLock<Vec<Gallery>>>,
    shutdown: CancellationToken,
}

/// Run all startup tasks and return the assembled application.
pub async fn startup(opts: AppOptions) -> Result<Application> {
    for dir in [
        &opts.models_path,
        &opts.backend_assets_path,
        &opts.audio_path,
        &opts.image_path,
        &opts.upload_path,
    ] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let shutdown = CancellationToken::new();

    let store = Arc::new(ConfigStore::load(&opts.models_path, &opts)?);
    if let Some(interval) = opts.config_poll_interval {
        let _ = store.spawn_watcher(interval, shutdown.child_token());
    }

    let loader = Arc::new(ModelLoader::new(opts.clone()));

    if opts.watchdog_idle_timeout.is_some() || opts.watchdog_busy_timeout.is_some() {
        info!(
            idle = ?opts.watchdog_idle_timeout,
            busy = ?opts.watchdog_busy_timeout,
            "starting watchdog"
        );
        let _ = Watchdog::new(
            Arc::clone(&loader),
            opts.watchdog_idle_timeout,
            opts.watchdog_busy_timeout,
            opts.watchdog_interval,
        )
        .spawn(shutdown.child_token());
    }

    let installer = Arc::new(GalleryInstaller::new(
        opts.models_path.clone(),
        shutdown.child_token(),
    ));

    if !opts.preload_models.is_empty() {
        preload(&opts, &shutdown).await?;
        store.reload()?;
    }

    let dispatcher = Arc::new(Dispatcher::new(
        opts.clone(),
        Arc::clone(&store),
        Arc::clone(&loader),
    ));
    let galleries = Arc::new(RwLock::new(opts.galleries.clone()));

    Ok(Application {
        opts,
        store,
        loader,
        dispatcher,
        installer,
        galleries,
        shutdown,
    })
}

/// Install preload references synchronously so the models are servable
/// before the HTTP listener comes up.
async fn preload(opts: &AppOptions, shutdown: &CancellationToken) -> Result<()> {
    let client = reqwest::Client::new();
    for reference in &opts.preload_models {
        info!(model = %reference, "preloading model");
        let job = InstallJob {
            id: Uuid::new_v4(),
            model: reference.clone(),
            name: None,
            galleries: opts.galleries.clone(),
            overlay: None,
        };
        gallery::apply_model(&client, &opts.models_path, &job, &|_, _, _, _| {}, shutdown)
            .await?;
    }
    Ok(())
}

impl Application {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and every live backend.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.loader.stop_all().await;
    }
}
