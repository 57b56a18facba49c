//! Config directory loading and hot reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::options::AppOptions;

type Snapshot = Arc<HashMap<String, Arc<BackendConfig>>>;

/// In-memory view of the per-model YAML directory.
///
/// Readers clone the current snapshot Arc and keep a consistent set for the
/// duration of their request; reloads build a fresh map and swap it in whole.
pub struct ConfigStore {
    dir: PathBuf,
    defaults: AppOptions,
    snapshot: RwLock<Snapshot>,
}

impl ConfigStore {
    /// Scan the directory and build the initial snapshot.
    pub fn load(dir: impl Into<PathBuf>, defaults: &AppOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let map = parse_dir(&dir, defaults)?;
        info!(configs = map.len(), dir = %dir.display(), "loaded model configurations");
        Ok(Self {
            dir,
            defaults: defaults.clone(),
            snapshot: RwLock::new(Arc::new(map)),
        })
    }

    /// Current consistent view. Cheap to clone; never mutated in place.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendConfig>> {
        self.snapshot().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-parse the directory and atomically replace the snapshot.
    ///
    /// On any parse error (including duplicate names) the previous snapshot
    /// is retained and the error surfaced.
    pub fn reload(&self) -> Result<()> {
        let map = parse_dir(&self.dir, &self.defaults)?;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(map);
        Ok(())
    }

    /// Poll the directory for changes and reload when its contents moved.
    ///
    /// Filesystem events are unreliable on some target platforms, so the
    /// store watches by mtime/name polling instead.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut seen = fingerprint_dir(&store.dir);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = fingerprint_dir(&store.dir);
                if current == seen {
                    continue;
                }
                seen = current;
                match store.reload() {
                    Ok(()) => info!("model configuration directory reloaded"),
                    Err(err) => {
                        warn!(%err, "config reload failed; keeping previous snapshot")
                    }
                }
            }
        })
    }
}

/// (name, mtime) pairs of the YAML files in the directory.
fn fingerprint_dir(dir: &Path) -> Vec<(String, SystemTime)> {
    let mut entries = Vec::new();
    let Ok(read) = std::fs::read_dir(dir) else {
        return entries;
    };
    for entry in read.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !is_config_file(&path) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((path.display().to_string(), mtime));
    }
    entries.sort();
    entries
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn parse_dir(dir: &Path, defaults: &AppOptions) -> Result<HashMap<String, Arc<BackendConfig>>> {
    let mut raw: HashMap<String, BackendConfig> = HashMap::new();

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_config_file(p))
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path)?;
        let mut cfg: BackendConfig = serde_yaml::from_str(&text)?;
        if cfg.name.is_empty() {
            cfg.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
        }
        debug!(name = %cfg.name, file = %path.display(), "parsed model config");
        if raw.contains_key(&cfg.name) {
            return Err(Error::ConfigConflict(cfg.name));
        }
        raw.insert(cfg.name.clone(), cfg);
    }

    // Resolve inheritance against the raw set, then apply defaults.
    let mut resolved = HashMap::new();
    for name in raw.keys().cloned().collect::<Vec<_>>() {
        let mut cfg = resolve_bases(&raw, &name, 0)?;
        cfg.set_defaults(defaults);
        resolved.insert(name, Arc::new(cfg));
    }
    Ok(resolved)
}

const MAX_BASE_DEPTH: usize = 8;

fn resolve_bases(
    raw: &HashMap<String, BackendConfig>,
    name: &str,
    depth: usize,
) -> Result<BackendConfig> {
    if depth > MAX_BASE_DEPTH {
        return Err(Error::ConfigConflict(format!(
            "base chain for '{name}' exceeds {MAX_BASE_DEPTH} levels"
        )));
    }
    let cfg = raw
        .get(name)
        .ok_or_else(|| Error::ConfigNotFound(name.to_string()))?;
    match &cfg.base {
        None => Ok(cfg.clone()),
        Some(base_name) => {
            let base = resolve_bases(raw, base_name, depth + 1)?;
            Ok(cfg.merge_over(&base))
        }
    }
}
