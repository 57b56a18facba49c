//! In-process fake worker for tests.
//!
//! Listens on a loopback port and speaks the newline-delimited JSON protocol.
//! Requests are served concurrently, so serialization observed by the fake is
//! serialization enforced by the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::rpc::{
    TranscriptSegment, WorkerCommand, WorkerPayload, WorkerReply, WorkerRequest,
};

#[derive(Clone)]
pub(crate) struct FakeWorkerOptions {
    pub chunks: usize,
    pub chunk_delay: Duration,
    pub predict_delay: Duration,
    pub fail_load: Option<String>,
}

impl Default for FakeWorkerOptions {
    fn default() -> Self {
        Self {
            chunks: 2,
            chunk_delay: Duration::ZERO,
            predict_delay: Duration::ZERO,
            fail_load: None,
        }
    }
}

pub(crate) struct FakeWorkerBuilder {
    opts: FakeWorkerOptions,
}

impl FakeWorkerBuilder {
    pub fn chunks(mut self, n: usize) -> Self {
        self.opts.chunks = n;
        self
    }

    pub fn chunk_delay(mut self, d: Duration) -> Self {
        self.opts.chunk_delay = d;
        self
    }

    pub fn predict_delay(mut self, d: Duration) -> Self {
        self.opts.predict_delay = d;
        self
    }

    pub fn fail_load(mut self, message: &str) -> Self {
        self.opts.fail_load = Some(message.to_string());
        self
    }

    pub async fn spawn(self) -> FakeWorker {
        FakeWorker::spawn_with(self.opts).await
    }
}

struct FakeState {
    opts: FakeWorkerOptions,
    cancelled: Mutex<HashSet<u64>>,
    cancel_count: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    load_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

type TaskRegistry = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub(crate) struct FakeWorker {
    addr: String,
    state: Arc<FakeState>,
    tasks: TaskRegistry,
}

impl FakeWorker {
    pub async fn spawn() -> Self {
        Self::spawn_with(FakeWorkerOptions::default()).await
    }

    pub fn builder() -> FakeWorkerBuilder {
        FakeWorkerBuilder {
            opts: FakeWorkerOptions::default(),
        }
    }

    async fn spawn_with(opts: FakeWorkerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(FakeState {
            opts,
            cancelled: Mutex::new(HashSet::new()),
            cancel_count: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            load_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        });

        let tasks: TaskRegistry = Arc::new(Mutex::new(Vec::new()));
        let worker = Self {
            addr,
            state: Arc::clone(&state),
            tasks: Arc::clone(&tasks),
        };

        let accept_state = Arc::clone(&state);
        let accept_tasks = Arc::clone(&tasks);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = Arc::clone(&accept_state);
                let conn_tasks = Arc::clone(&accept_tasks);
                let handle = tokio::spawn(handle_connection(stream, conn_state, conn_tasks));
                accept_tasks.lock().unwrap().push(handle);
            }
        });
        tasks.lock().unwrap().push(accept);
        worker
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Tear down the listener and every open connection, as a crash would.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.state.load_count.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub async fn wait_for_cancel(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.state.cancel_count.load(Ordering::SeqCst) == 0 {
            if tokio::time::Instant::now() >= deadline {
                panic!("fake worker never saw a cancel frame");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<FakeState>, tasks: TaskRegistry) {
    let (read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WorkerReply>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let line = serde_json::to_string(&reply).unwrap();
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });
    tasks.lock().unwrap().push(writer);

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(request) = serde_json::from_str::<WorkerRequest>(&line) else {
            continue;
        };
        let state = Arc::clone(&state);
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            serve_request(request, state, reply_tx).await;
        });
    }

    drop(reply_tx);
}

async fn serve_request(
    request: WorkerRequest,
    state: Arc<FakeState>,
    reply_tx: mpsc::UnboundedSender<WorkerReply>,
) {
    let id = request.id;
    let reply = |payload| WorkerReply { id, payload };

    match request.command {
        WorkerCommand::Health | WorkerCommand::Stop => {
            let _ = reply_tx.send(reply(WorkerPayload::Ok));
        }
        WorkerCommand::Load { .. } => {
            state.load_count.fetch_add(1, Ordering::SeqCst);
            let payload = match &state.opts.fail_load {
                Some(message) => WorkerPayload::Error {
                    message: message.clone(),
                },
                None => WorkerPayload::Ok,
            };
            let _ = reply_tx.send(reply(payload));
        }
        WorkerCommand::Predict { options } => {
            let now = state.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_concurrent.fetch_max(now, Ordering::SeqCst);
            state.prompts.lock().unwrap().push(options.prompt.clone());

            if !state.opts.predict_delay.is_zero() {
                tokio::time::sleep(state.opts.predict_delay).await;
            }

            state.concurrent.fetch_sub(1, Ordering::SeqCst);
            let _ = reply_tx.send(reply(WorkerPayload::Completion {
                text: format!("echo:{}", options.prompt),
                finish_reason: Some("stop".into()),
            }));
        }
        WorkerCommand::PredictStream { options } => {
            for i in 0..state.opts.chunks {
                if state.cancelled.lock().unwrap().contains(&id) {
                    return;
                }
                if !state.opts.chunk_delay.is_zero() {
                    tokio::time::sleep(state.opts.chunk_delay).await;
                }
                let _ = reply_tx.send(reply(WorkerPayload::Chunk {
                    message: format!("{}-{}", options.prompt, i),
                }));
            }
            let _ = reply_tx.send(reply(WorkerPayload::StreamEnd {
                finish_reason: Some("stop".into()),
            }));
        }
        WorkerCommand::Embed { .. } => {
            let _ = reply_tx.send(reply(WorkerPayload::Embedding {
                values: vec![0.1, 0.2, 0.3],
            }));
        }
        WorkerCommand::Tts { destination, .. } => {
            let dir = destination.unwrap_or_else(|| "/tmp".into());
            let _ = reply_tx.send(reply(WorkerPayload::Audio {
                path: format!("{dir}/tts-{id}.wav"),
            }));
        }
        WorkerCommand::Transcribe { .. } => {
            let _ = reply_tx.send(reply(WorkerPayload::Segments {
                segments: vec![
                    TranscriptSegment {
                        start: 0.0,
                        end: 1.0,
                        text: "hello".into(),
                    },
                    TranscriptSegment {
                        start: 1.0,
                        end: 2.0,
                        text: "world".into(),
                    },
                ],
            }));
        }
        WorkerCommand::GenerateImage { options } => {
            let dir = options.destination.unwrap_or_else(|| "/tmp".into());
            let _ = reply_tx.send(reply(WorkerPayload::Image {
                path: format!("{dir}/image-{id}.png"),
            }));
        }
        WorkerCommand::Status => {
            let _ = reply_tx.send(reply(WorkerPayload::Status {
                memory_bytes: 1024,
                busy: state.concurrent.load(Ordering::SeqCst) > 0,
                finish_reason: None,
            }));
        }
        WorkerCommand::Cancel { request } => {
            state.cancelled.lock().unwrap().insert(request);
            state.cancel_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
