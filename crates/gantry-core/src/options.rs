//! Global application options.
//!
//! One immutable value assembled by the CLI (or tests) and passed by
//! reference into every component at construction. Nothing mutates it after
//! startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::gallery::Gallery;

/// Immutable gateway-wide configuration.
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Root of model files and per-model YAML configs.
    pub models_path: PathBuf,
    /// Directory holding backend worker binaries (and extracted runtime libs).
    pub backend_assets_path: PathBuf,
    /// Output directory for generated audio files.
    pub audio_path: PathBuf,
    /// Output directory for generated images.
    pub image_path: PathBuf,
    /// Staging directory for uploaded files.
    pub upload_path: PathBuf,

    /// Default context window for models that do not set one.
    pub context_size: usize,
    /// Default thread count for models that do not set one.
    pub threads: usize,
    /// Hint backends to run in half precision.
    pub f16: bool,

    /// Allow multiple in-flight calls per backend instance.
    pub parallel_requests: bool,
    /// Keep at most one live backend across all models.
    pub single_active_backend: bool,
    /// Pre-registered workers, backend name -> RPC address. Spawning is
    /// skipped for these.
    pub external_backends: HashMap<String, String>,

    /// Idle reaper threshold; `None` disables the idle check.
    pub watchdog_idle_timeout: Option<Duration>,
    /// Busy reaper threshold; `None` disables the busy check.
    pub watchdog_busy_timeout: Option<Duration>,
    /// Watchdog tick interval.
    pub watchdog_interval: Duration,

    /// How long a spawned worker may take to answer its first Health RPC.
    pub startup_timeout: Duration,
    /// Grace window between a Stop RPC and the hard kill.
    pub stop_grace: Duration,

    /// Remote galleries to resolve install references against.
    pub galleries: Vec<Gallery>,
    /// Install the preload references at startup.
    pub autoload_galleries: bool,
    /// Model config URLs or gallery references applied at startup.
    pub preload_models: Vec<String>,

    /// Poll interval for config-directory hot reload; `None` disables it.
    pub config_poll_interval: Option<Duration>,

    /// Bearer tokens required on every HTTP request when non-empty.
    pub api_keys: Vec<String>,
    /// Replace all error responses with a blank 500.
    pub opaque_errors: bool,
    /// HTTP listen address.
    pub address: String,
    /// Enable permissive CORS on the HTTP server.
    pub cors: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            models_path: default_models_path(),
            backend_assets_path: PathBuf::from("/tmp/gantry/backend_data"),
            audio_path: PathBuf::from("/tmp/generated/audio"),
            image_path: PathBuf::from("/tmp/generated/images"),
            upload_path: PathBuf::from("/tmp/gantry/upload"),
            context_size: 512,
            threads: default_threads(),
            f16: false,
            parallel_requests: false,
            single_active_backend: false,
            external_backends: HashMap::new(),
            watchdog_idle_timeout: None,
            watchdog_busy_timeout: None,
            watchdog_interval: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            galleries: Vec::new(),
            autoload_galleries: false,
            preload_models: Vec::new(),
            config_poll_interval: Some(Duration::from_secs(60)),
            api_keys: Vec::new(),
            opaque_errors: false,
            address: "0.0.0.0:8080".to_string(),
            cors: false,
        }
    }
}

fn default_models_path() -> PathBuf {
    if let Ok(from_env) = std::env::var("MODELS_PATH") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gantry")
        .join("models")
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
