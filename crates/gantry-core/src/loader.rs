//! Keyed cache of live backend instances and the dispatch policy around it.
//!
//! The loader exclusively owns every [`BackendInstance`]; callers borrow one
//! for the duration of a single RPC. At most one non-terminal instance exists
//! per [`LoaderKey`], and with the single-active policy at most one exists
//! across all keys.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::options::AppOptions;
use crate::process::{self, ProcessSupervisor, WorkerProcess};
use crate::rpc::{
    Completion, ImageOptions, ModelOptions, PredictOptions, PredictStream, StreamEvent,
    TranscriptSegment, WorkerClient,
};

/// Fingerprint determining instance reuse: two requests share an instance iff
/// they share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoaderKey(String);

impl LoaderKey {
    pub fn for_config(cfg: &BackendConfig) -> Self {
        Self(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            cfg.name,
            cfg.backend,
            cfg.model,
            cfg.context_size.unwrap_or(0),
            cfg.threads.unwrap_or(0),
            cfg.f16.unwrap_or(false),
            cfg.options.join(","),
            cfg.quantization.as_deref().unwrap_or(""),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live worker: one child process (unless external) plus its RPC binding.
#[derive(Debug)]
pub struct BackendInstance {
    key: LoaderKey,
    model_name: String,
    backend: String,
    client: WorkerClient,
    process: Option<WorkerProcess>,
    loaded_at: Instant,
    last_used: std::sync::Mutex<Instant>,
    terminal: AtomicBool,
    evicted: AtomicBool,
    /// Cancelled when the instance is torn down; unblocks in-flight calls.
    halt: CancellationToken,
    /// Present when parallel requests are disabled: one in-flight call.
    gate: Option<Arc<Semaphore>>,
}

impl BackendInstance {
    pub fn key(&self) -> &LoaderKey {
        &self.key
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn busy(&self) -> usize {
        self.client.busy()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn last_used(&self) -> Instant {
        *self
            .last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn oldest_call_start(&self) -> Option<Instant> {
        self.client.oldest_call_start()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self
            .last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.gate {
            Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
            None => None,
        }
    }

    fn halt_error(&self) -> Error {
        if self.evicted.load(Ordering::SeqCst) {
            Error::BackendEvicted
        } else {
            Error::BackendCrashed("backend shut down".into())
        }
    }

    /// Stop the worker and mark the instance dead. Idempotent.
    async fn teardown(&self, supervisor: &ProcessSupervisor) {
        if self.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        self.halt.cancel();
        match &self.process {
            Some(process) => supervisor.kill(process, Some(&self.client)).await,
            None => {
                // External worker: we do not own the process, only ask nicely.
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(500),
                    self.client.stop(),
                )
                .await;
            }
        }
    }
}

/// Point-in-time view of one instance, for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub key: String,
    pub model: String,
    pub backend: String,
    pub busy: usize,
    pub idle_for_secs: u64,
    pub loaded_for_secs: u64,
}

pub struct ModelLoader {
    opts: AppOptions,
    supervisor: ProcessSupervisor,
    instances: Mutex<HashMap<LoaderKey, Arc<BackendInstance>>>,
    /// Per-key leader election: concurrent loads for one key queue here, so
    /// the supervisor spawns at most once per contention window.
    load_gates: Mutex<HashMap<LoaderKey, Arc<Mutex<()>>>>,
    /// Serializes whole loads when the single-active policy is on.
    single_active: Option<Mutex<()>>,
}

impl ModelLoader {
    pub fn new(opts: AppOptions) -> Self {
        let supervisor = ProcessSupervisor::new(opts.startup_timeout, opts.stop_grace);
        let single_active = opts.single_active_backend.then(|| Mutex::new(()));
        Self {
            opts,
            supervisor,
            instances: Mutex::new(HashMap::new()),
            load_gates: Mutex::new(HashMap::new()),
            single_active,
        }
    }

    /// Return the live instance for this config, spawning and loading one if
    /// needed. Concurrent callers for the same key block on the first load;
    /// if it fails they retry from scratch.
    pub async fn load_backend(&self, cfg: &BackendConfig) -> Result<Arc<BackendInstance>> {
        let key = LoaderKey::for_config(cfg);

        if let Some(instance) = self.lookup(&key).await {
            instance.touch();
            return Ok(instance);
        }

        let gate = self.load_gate(&key).await;
        let _leader = gate.lock().await;

        // The previous leader may have finished while we queued.
        if let Some(instance) = self.lookup(&key).await {
            instance.touch();
            return Ok(instance);
        }

        self.load_fresh(&key, cfg).await
    }

    async fn lookup(&self, key: &LoaderKey) -> Option<Arc<BackendInstance>> {
        let mut instances = self.instances.lock().await;
        match instances.get(key) {
            Some(instance) if !instance.is_terminal() => Some(Arc::clone(instance)),
            Some(_) => {
                instances.remove(key);
                None
            }
            None => None,
        }
    }

    async fn load_gate(&self, key: &LoaderKey) -> Arc<Mutex<()>> {
        let mut gates = self.load_gates.lock().await;
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    async fn load_fresh(&self, key: &LoaderKey, cfg: &BackendConfig) -> Result<Arc<BackendInstance>> {
        // Under single-active the token is held for the whole load, and any
        // earlier instance is stopped before the new one starts.
        let _token = match &self.single_active {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        if self.single_active.is_some() {
            self.evict_all_except(key).await;
        }

        info!(model = %cfg.name, backend = %cfg.backend, "loading backend");
        let (process, client) = self.launch(cfg).await?;

        if let Err(err) = client.load(self.model_options(cfg)).await {
            warn!(model = %cfg.name, %err, "model load rejected; tearing worker down");
            if let Some(process) = &process {
                self.supervisor.kill(process, Some(&client)).await;
            }
            return Err(match err {
                Error::BackendLoadFailed(_) => err,
                other => Error::BackendLoadFailed(other.to_string()),
            });
        }

        let gate = (!self.opts.parallel_requests).then(|| Arc::new(Semaphore::new(1)));
        let instance = Arc::new(BackendInstance {
            key: key.clone(),
            model_name: cfg.name.clone(),
            backend: cfg.backend.clone(),
            client,
            process,
            loaded_at: Instant::now(),
            last_used: std::sync::Mutex::new(Instant::now()),
            terminal: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            halt: CancellationToken::new(),
            gate,
        });

        self.instances
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&instance));
        Ok(instance)
    }

    async fn launch(&self, cfg: &BackendConfig) -> Result<(Option<WorkerProcess>, WorkerClient)> {
        if let Some(addr) = self.opts.external_backends.get(&cfg.backend) {
            debug!(backend = %cfg.backend, %addr, "using external worker");
            let client = WorkerClient::connect(addr).await.map_err(|err| {
                Error::BackendLaunchFailed(format!("external backend {}: {err}", cfg.backend))
            })?;
            return Ok((None, client));
        }

        let binary = self.opts.backend_assets_path.join(&cfg.backend);
        if !binary.is_file() {
            return Err(Error::BackendLoadFailed(format!(
                "unknown backend '{}'",
                cfg.backend
            )));
        }

        match self.supervisor.spawn(&binary, &[], &[]).await {
            Ok(pair) => Ok((Some(pair.0), pair.1)),
            Err(err) if process::is_retryable_launch(&err) => {
                warn!(backend = %cfg.backend, %err, "launch failed; retrying once");
                let (process, client) = self.supervisor.spawn(&binary, &[], &[]).await?;
                Ok((Some(process), client))
            }
            Err(err) => Err(err),
        }
    }

    fn model_options(&self, cfg: &BackendConfig) -> ModelOptions {
        let model = if cfg.model.starts_with('/') || cfg.model.contains("://") {
            cfg.model.clone()
        } else {
            self.opts
                .models_path
                .join(&cfg.model)
                .display()
                .to_string()
        };
        ModelOptions {
            model,
            context_size: cfg.context_size.unwrap_or(self.opts.context_size),
            threads: cfg.threads.unwrap_or(self.opts.threads),
            f16: cfg.f16.unwrap_or(self.opts.f16),
            quantization: cfg.quantization.clone(),
            options: cfg.options.clone(),
        }
    }

    async fn evict_all_except(&self, key: &LoaderKey) {
        let victims: Vec<Arc<BackendInstance>> = {
            let mut instances = self.instances.lock().await;
            let keys: Vec<LoaderKey> = instances
                .keys()
                .filter(|k| *k != key)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| instances.remove(k))
                .collect()
        };
        for victim in victims {
            info!(model = %victim.model_name(), "evicting backend for single-active load");
            victim.evicted.store(true, Ordering::SeqCst);
            victim.teardown(&self.supervisor).await;
        }
    }

    /// Look up a live instance by logical model name.
    pub async fn get_backend(&self, name: &str) -> Option<Arc<BackendInstance>> {
        let instances = self.instances.lock().await;
        instances
            .values()
            .find(|i| i.model_name() == name && !i.is_terminal())
            .cloned()
    }

    /// Remove and stop one instance. Idempotent.
    pub async fn shutdown_backend(&self, key: &LoaderKey) {
        let instance = self.instances.lock().await.remove(key);
        if let Some(instance) = instance {
            info!(model = %instance.model_name(), "shutting down backend");
            instance.teardown(&self.supervisor).await;
        }
    }

    /// Stop every live instance.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<BackendInstance>> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, i)| i).collect()
        };
        for instance in drained {
            instance.teardown(&self.supervisor).await;
        }
    }

    /// Live instances, for the watchdog and the status surface.
    pub async fn instances(&self) -> Vec<Arc<BackendInstance>> {
        self.instances.lock().await.values().cloned().collect()
    }

    pub async fn status(&self) -> Vec<InstanceStatus> {
        self.instances()
            .await
            .into_iter()
            .filter(|i| !i.is_terminal())
            .map(|i| InstanceStatus {
                key: i.key().to_string(),
                model: i.model_name().to_string(),
                backend: i.backend().to_string(),
                busy: i.busy(),
                idle_for_secs: i.last_used().elapsed().as_secs(),
                loaded_for_secs: i.loaded_at().elapsed().as_secs(),
            })
            .collect()
    }

    async fn run_guarded<T>(
        &self,
        instance: &Arc<BackendInstance>,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let halt = instance.halt.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = halt.cancelled() => Err(instance.halt_error()),
            result = call => result,
        };
        instance.touch();
        if matches!(result, Err(Error::BackendCrashed(_))) {
            self.shutdown_backend(instance.key()).await;
        }
        result
    }

    /// Synchronous completion under the parallelism policy.
    pub async fn predict(
        &self,
        cfg: &BackendConfig,
        options: PredictOptions,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let instance = self.load_backend(cfg).await?;
        let _permit = instance.acquire().await;
        instance.touch();
        self.run_guarded(&instance, cancel, instance.client.predict(options))
            .await
    }

    /// Streamed completion. The returned handle holds the serialization
    /// permit until the consumer is done with the stream.
    pub async fn predict_stream(
        &self,
        cfg: &BackendConfig,
        options: PredictOptions,
        cancel: &CancellationToken,
    ) -> Result<BackendStream> {
        let instance = self.load_backend(cfg).await?;
        let permit = instance.acquire().await;
        instance.touch();
        let stream = self
            .run_guarded(&instance, cancel, instance.client.predict_stream(options))
            .await?;
        Ok(BackendStream {
            stream,
            instance,
            _permit: permit,
        })
    }

    pub async fn embed(
        &self,
        cfg: &BackendConfig,
        text: String,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let instance = self.load_backend(cfg).await?;
        let _permit = instance.acquire().await;
        instance.touch();
        self.run_guarded(&instance, cancel, instance.client.embed(text))
            .await
    }

    pub async fn tts(
        &self,
        cfg: &BackendConfig,
        text: String,
        voice: Option<String>,
        destination: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let instance = self.load_backend(cfg).await?;
        let _permit = instance.acquire().await;
        instance.touch();
        self.run_guarded(&instance, cancel, instance.client.tts(text, voice, destination))
            .await
    }

    pub async fn transcribe(
        &self,
        cfg: &BackendConfig,
        audio_path: String,
        language: Option<String>,
        threads: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptSegment>> {
        let instance = self.load_backend(cfg).await?;
        let _permit = instance.acquire().await;
        instance.touch();
        self.run_guarded(
            &instance,
            cancel,
            instance.client.transcribe(audio_path, language, threads),
        )
        .await
    }

    pub async fn generate_image(
        &self,
        cfg: &BackendConfig,
        options: ImageOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let instance = self.load_backend(cfg).await?;
        let _permit = instance.acquire().await;
        instance.touch();
        self.run_guarded(&instance, cancel, instance.client.generate_image(options))
            .await
    }
}

/// A streamed completion bound to its instance: keeps the per-instance
/// serialization permit alive and refreshes `last_used` as chunks flow.
pub struct BackendStream {
    stream: PredictStream,
    instance: Arc<BackendInstance>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl BackendStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        let event = self.stream.next().await;
        self.instance.touch();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::fake::FakeWorker;
    use std::time::Duration;

    fn config(name: &str, backend: &str) -> BackendConfig {
        let mut cfg = BackendConfig {
            name: name.into(),
            backend: backend.into(),
            model: format!("{name}.bin"),
            ..Default::default()
        };
        cfg.set_defaults(&AppOptions::default());
        cfg
    }

    fn loader_for(workers: &[(&str, &str)], tune: impl FnOnce(&mut AppOptions)) -> ModelLoader {
        let mut opts = AppOptions::default();
        for (backend, addr) in workers {
            opts.external_backends
                .insert(backend.to_string(), addr.to_string());
        }
        tune(&mut opts);
        ModelLoader::new(opts)
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_instance() {
        let worker = FakeWorker::spawn().await;
        let loader = Arc::new(loader_for(&[("fake", worker.addr())], |_| {}));
        let cfg = config("m", "fake");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = Arc::clone(&loader);
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                loader.load_backend(&cfg).await.unwrap()
            }));
        }
        let instances: Vec<Arc<BackendInstance>> =
            futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();

        // One Load RPC for the whole contention window, all callers share it.
        assert_eq!(worker.load_count(), 1);
        for pair in instances.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
        assert_eq!(loader.instances().await.len(), 1);
    }

    #[tokio::test]
    async fn single_active_evicts_previous_instance() {
        let worker_a = FakeWorker::spawn().await;
        let worker_b = FakeWorker::spawn().await;
        let loader = loader_for(
            &[("fake-a", worker_a.addr()), ("fake-b", worker_b.addr())],
            |opts| opts.single_active_backend = true,
        );

        let first = loader.load_backend(&config("a", "fake-a")).await.unwrap();
        loader.load_backend(&config("b", "fake-b")).await.unwrap();

        assert!(first.is_terminal());
        let live = loader.instances().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].model_name(), "b");
    }

    #[tokio::test]
    async fn disabled_parallelism_serializes_calls() {
        let worker = FakeWorker::builder()
            .predict_delay(Duration::from_millis(50))
            .spawn()
            .await;
        let loader = Arc::new(loader_for(&[("fake", worker.addr())], |opts| {
            opts.parallel_requests = false;
        }));
        let cfg = config("m", "fake");

        let mut handles = Vec::new();
        for prompt in ["p1", "p2", "p3"] {
            let loader = Arc::clone(&loader);
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                loader
                    .predict(
                        &cfg,
                        PredictOptions {
                            prompt: prompt.into(),
                            ..Default::default()
                        },
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap()
            }));
            // Stagger arrivals so the semaphore queue order is the arrival
            // order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(worker.max_concurrent(), 1);
        assert_eq!(worker.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn parallel_requests_overlap_on_the_worker() {
        let worker = FakeWorker::builder()
            .predict_delay(Duration::from_millis(80))
            .spawn()
            .await;
        let loader = Arc::new(loader_for(&[("fake", worker.addr())], |opts| {
            opts.parallel_requests = true;
        }));
        let cfg = config("m", "fake");

        let mut handles = Vec::new();
        for prompt in ["p1", "p2", "p3"] {
            let loader = Arc::clone(&loader);
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                loader
                    .predict(
                        &cfg,
                        PredictOptions {
                            prompt: prompt.into(),
                            ..Default::default()
                        },
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(worker.max_concurrent() > 1);
    }

    #[tokio::test]
    async fn crashed_worker_surfaces_and_is_removed() {
        let worker = FakeWorker::spawn().await;
        let loader = loader_for(&[("fake", worker.addr())], |_| {});
        let cfg = config("m", "fake");

        loader.load_backend(&cfg).await.unwrap();
        worker.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = loader
            .predict(
                &cfg,
                PredictOptions {
                    prompt: "p".into(),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendCrashed(_)));
        assert!(loader.instances().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_slow_call() {
        let worker = FakeWorker::builder()
            .predict_delay(Duration::from_secs(30))
            .spawn()
            .await;
        let loader = Arc::new(loader_for(&[("fake", worker.addr())], |_| {}));
        let cfg = config("m", "fake");

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let loader = Arc::clone(&loader);
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            async move {
                loader
                    .predict(
                        &cfg,
                        PredictOptions {
                            prompt: "slow".into(),
                            ..Default::default()
                        },
                        &cancel,
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn rejected_load_tears_the_worker_down() {
        let worker = FakeWorker::builder().fail_load("out of memory").spawn().await;
        let loader = loader_for(&[("fake", worker.addr())], |_| {});

        let err = loader.load_backend(&config("m", "fake")).await.unwrap_err();
        assert!(matches!(err, Error::BackendLoadFailed(_)));
        assert!(loader.instances().await.is_empty());

        // A later caller retries from scratch instead of seeing a poisoned
        // entry.
        let err = loader.load_backend(&config("m", "fake")).await.unwrap_err();
        assert!(matches!(err, Error::BackendLoadFailed(_)));
        assert_eq!(worker.load_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_backend_is_idempotent() {
        let worker = FakeWorker::spawn().await;
        let loader = loader_for(&[("fake", worker.addr())], |_| {});
        let cfg = config("m", "fake");

        let instance = loader.load_backend(&cfg).await.unwrap();
        let key = instance.key().clone();
        loader.shutdown_backend(&key).await;
        loader.shutdown_backend(&key).await;
        assert!(loader.instances().await.is_empty());
    }

    #[test]
    fn loader_key_covers_load_relevant_fields() {
        let opts = AppOptions::default();
        let mut a = config("m", "fake");
        let mut b = config("m", "fake");
        a.set_defaults(&opts);
        b.set_defaults(&opts);
        assert_eq!(LoaderKey::for_config(&a), LoaderKey::for_config(&b));

        b.context_size = Some(9999);
        assert_ne!(LoaderKey::for_config(&a), LoaderKey::for_config(&b));
    }
}
