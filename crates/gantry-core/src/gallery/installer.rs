//! Async install pipeline: one job channel, one worker, per-job progress.
//!
//! Files are streamed to a `tmp-<uuid>` path, SHA-256 verified, fsynced, and
//! atomically renamed into the models directory; the derived backend config
//! is written last. No file ever appears under its final name unless its
//! checksum matched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::gallery::{resolve_model, Gallery, ManifestFile};

/// One asynchronous gallery operation.
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub id: Uuid,
    /// Gallery-model reference: `gallery@model` or a bare model name.
    pub model: String,
    /// Local name override; defaults to the gallery model name.
    pub name: Option<String>,
    pub galleries: Vec<Gallery>,
    /// Config overlay applied on top of the manifest defaults.
    pub overlay: Option<BackendConfig>,
}

/// Observable job state. Monotone non-decreasing until terminal
/// (`done` or `error`).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobProgress {
    pub file_name: String,
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub message: String,
    pub error: Option<String>,
    pub done: bool,
}

/// Owner of the install queue and of every [`InstallJob`].
pub struct GalleryInstaller {
    job_tx: mpsc::UnboundedSender<InstallJob>,
    statuses: Arc<RwLock<HashMap<Uuid, JobProgress>>>,
}

impl GalleryInstaller {
    /// Start the worker task. It drains on cancellation: the file being
    /// downloaded is finished, then the queue stops and leftover temp files
    /// are removed.
    pub fn new(models_path: PathBuf, cancel: CancellationToken) -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<InstallJob>();
        let statuses: Arc<RwLock<HashMap<Uuid, JobProgress>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let worker_statuses = Arc::clone(&statuses);
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = job_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                let id = job.id;
                info!(%id, model = %job.model, "processing install job");
                set_status(&worker_statuses, id, |s| {
                    s.message = format!("installing {}", job.model);
                });

                let progress_statuses = Arc::clone(&worker_statuses);
                let progress = move |file: &str, downloaded: u64, total: u64, pct: f64| {
                    set_status(&progress_statuses, id, |s| {
                        s.file_name = file.to_string();
                        s.downloaded = downloaded;
                        s.total = total;
                        s.percentage = pct;
                    });
                };

                match apply_model(&client, &models_path, &job, &progress, &cancel).await {
                    Ok(()) => set_status(&worker_statuses, id, |s| {
                        s.done = true;
                        s.percentage = 100.0;
                        s.message = format!("installed {}", job.model);
                    }),
                    Err(err) => {
                        warn!(%id, %err, "install job failed");
                        set_status(&worker_statuses, id, |s| {
                            s.error = Some(err.to_string());
                        });
                    }
                }
            }
            cleanup_temp_files(&models_path);
        });

        Self { job_tx, statuses }
    }

    /// Queue a job. Exactly one status record exists per UUID.
    pub fn enqueue(&self, job: InstallJob) -> Uuid {
        let id = job.id;
        set_status(&self.statuses, id, |s| {
            s.message = format!("queued {}", job.model);
        });
        if self.job_tx.send(job).is_err() {
            set_status(&self.statuses, id, |s| {
                s.error = Some("installer is shut down".into());
            });
        }
        id
    }

    pub fn status(&self, id: Uuid) -> Option<JobProgress> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn all_statuses(&self) -> HashMap<Uuid, JobProgress> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn set_status(
    statuses: &Arc<RwLock<HashMap<Uuid, JobProgress>>>,
    id: Uuid,
    update: impl FnOnce(&mut JobProgress),
) {
    let mut map = statuses.write().unwrap_or_else(|e| e.into_inner());
    update(map.entry(id).or_default());
}

/// Resolve, download, verify, and materialize one gallery model under
/// `models_path`. Shared by the queue worker and the CLI's synchronous
/// install path.
pub async fn apply_model(
    client: &reqwest::Client,
    models_path: &Path,
    job: &InstallJob,
    progress: &(impl Fn(&str, u64, u64, f64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<()> {
    let (_, model) = resolve_model(client, &job.galleries, &job.model).await?;

    // Preflight sizes so the fraction is over total bytes across all files.
    let mut sizes = Vec::with_capacity(model.files.len());
    for file in &model.files {
        let size = client
            .head(&file.uri)
            .send()
            .await
            .ok()
            .and_then(|r| r.content_length())
            .unwrap_or(0);
        sizes.push(size);
    }
    let total: u64 = sizes.iter().sum();

    let mut downloaded: u64 = 0;
    for file in &model.files {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let bytes = download_verified(client, models_path, file, &|file_bytes| {
            let current = downloaded + file_bytes;
            let pct = if total > 0 {
                (current as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            progress(&file.filename, current, total, pct.min(100.0));
        })
        .await?;
        downloaded += bytes;
    }

    write_model_config(models_path, job, &model.name, &model.files, model.config).await?;
    progress("", downloaded, total, 100.0);
    Ok(())
}

/// Stream one manifest file to a temp path, verify its SHA-256, and rename
/// it into place. Returns the byte count. On any failure the temp file is
/// removed and nothing appears under the final name.
async fn download_verified(
    client: &reqwest::Client,
    models_path: &Path,
    file: &ManifestFile,
    on_bytes: &(impl Fn(u64) + Sync),
) -> Result<u64> {
    let tmp = models_path.join(format!("tmp-{}", Uuid::new_v4()));

    let result = async {
        let response = client.get(&file.uri).send().await?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "HTTP {} for {}",
                response.status(),
                file.uri
            )));
        }

        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_bytes(written);
        }
        out.sync_all().await?;
        drop(out);

        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(&file.sha256) {
            return Err(Error::IntegrityFailure {
                file: file.filename.clone(),
                expected: file.sha256.clone(),
                actual,
            });
        }

        let dest = models_path.join(&file.filename);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_model_config(
    models_path: &Path,
    job: &InstallJob,
    model_name: &str,
    files: &[ManifestFile],
    manifest_config: Option<BackendConfig>,
) -> Result<()> {
    let mut derived = manifest_config.unwrap_or_default();
    if let Some(overlay) = &job.overlay {
        derived = overlay.merge_over(&derived);
    }
    derived.name = job.name.clone().unwrap_or_else(|| model_name.to_string());
    if derived.model.is_empty() {
        if let Some(first) = files.first() {
            derived.model = first.filename.clone();
        }
    }

    let yaml = serde_yaml::to_string(&derived)?;
    let tmp = models_path.join(format!("tmp-{}", Uuid::new_v4()));
    tokio::fs::write(&tmp, yaml).await?;
    let dest = models_path.join(format!("{}.yaml", derived.name));
    tokio::fs::rename(&tmp, &dest).await?;
    Ok(())
}

fn cleanup_temp_files(models_path: &Path) {
    let Ok(entries) = std::fs::read_dir(models_path) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("tmp-") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::testserver;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn sha(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    struct Servers {
        _files: testserver::TestServer,
        _index: testserver::TestServer,
    }

    async fn gallery_with_one_model(
        weights: &'static [u8],
        sha256: String,
    ) -> (Servers, Vec<Gallery>) {
        // The index references the file server, so that one comes up first.
        let files = testserver::serve(vec![("/tiny.gguf".into(), weights.to_vec())]).await;
        let index = serde_json::json!([{
            "name": "tiny",
            "description": "test model",
            "files": [{
                "filename": "tiny.gguf",
                "uri": format!("http://{}/tiny.gguf", files.addr()),
                "sha256": sha256,
            }],
            "config": { "backend": "llama-cpp" },
        }]);

        let index_server =
            testserver::serve(vec![("/index.json".into(), serde_json::to_vec(&index).unwrap())])
                .await;
        let galleries = vec![Gallery {
            name: "test".into(),
            url: format!("http://{}/index.json", index_server.addr()),
            priority: 0,
        }];
        (
            Servers {
                _files: files,
                _index: index_server,
            },
            galleries,
        )
    }

    fn job(galleries: Vec<Gallery>) -> InstallJob {
        InstallJob {
            id: Uuid::new_v4(),
            model: "test@tiny".into(),
            name: None,
            galleries,
            overlay: None,
        }
    }

    #[tokio::test]
    async fn install_materializes_files_and_config() {
        const WEIGHTS: &[u8] = b"not really a gguf";
        let (_servers, galleries) = gallery_with_one_model(WEIGHTS, sha(WEIGHTS)).await;
        let models = tempfile::tempdir().unwrap();

        let last_pct = AtomicU64::new(0);
        let client = reqwest::Client::new();
        apply_model(
            &client,
            models.path(),
            &job(galleries),
            &|_, _, _, pct| {
                last_pct.store(pct as u64, Ordering::SeqCst);
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let weights = std::fs::read(models.path().join("tiny.gguf")).unwrap();
        assert_eq!(weights, WEIGHTS);
        assert_eq!(last_pct.load(Ordering::SeqCst), 100);

        let yaml = std::fs::read_to_string(models.path().join("tiny.yaml")).unwrap();
        let cfg: BackendConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.name, "tiny");
        assert_eq!(cfg.backend, "llama-cpp");
        assert_eq!(cfg.model, "tiny.gguf");
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        const WEIGHTS: &[u8] = b"corrupted payload";
        let (_servers, galleries) =
            gallery_with_one_model(WEIGHTS, sha(b"the expected bytes")).await;
        let models = tempfile::tempdir().unwrap();

        let client = reqwest::Client::new();
        let err = apply_model(
            &client,
            models.path(),
            &job(galleries),
            &|_, _, _, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(models.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[tokio::test]
    async fn queued_job_reaches_a_terminal_status() {
        const WEIGHTS: &[u8] = b"queued install";
        let (_servers, galleries) = gallery_with_one_model(WEIGHTS, sha(WEIGHTS)).await;
        let models = tempfile::tempdir().unwrap();

        let installer =
            GalleryInstaller::new(models.path().to_path_buf(), CancellationToken::new());
        let id = installer.enqueue(job(galleries));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = installer.status(id).expect("status exists from enqueue");
            if status.done {
                assert!(status.error.is_none());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job never finished: {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(models.path().join("tiny.yaml").exists());
    }

    #[tokio::test]
    async fn unknown_reference_fails_the_job() {
        const WEIGHTS: &[u8] = b"x";
        let (_servers, galleries) = gallery_with_one_model(WEIGHTS, sha(WEIGHTS)).await;
        let models = tempfile::tempdir().unwrap();

        let installer =
            GalleryInstaller::new(models.path().to_path_buf(), CancellationToken::new());
        let mut bad = job(galleries);
        bad.model = "test@missing".into();
        let id = installer.enqueue(bad);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = installer.status(id).unwrap();
            if let Some(error) = &status.error {
                assert!(error.contains("not found"), "unexpected error: {error}");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
