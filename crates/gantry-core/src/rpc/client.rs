//! RPC adapter binding one live worker.
//!
//! Owns the TCP connection: a writer task serializes outgoing frames, a
//! reader task correlates replies to pending calls by id. Streaming replies
//! are forwarded through a dedicated channel whose sender lives only in the
//! pending map, so the downstream channel closes exactly once no matter how
//! the stream ends (normal end, worker error, consumer abandonment, worker
//! death). Busy accounting is tied to the pending map: increment on
//! registration, decrement on removal, which is the terminal event for every
//! call shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::{
    Completion, ImageOptions, ModelOptions, PredictOptions, TranscriptSegment, WorkerCommand,
    WorkerPayload, WorkerReply, WorkerRequest, WorkerStatus,
};

/// One event of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    End { finish_reason: Option<String> },
    Error(String),
}

#[derive(Debug)]
enum Pending {
    Unary(oneshot::Sender<WorkerPayload>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

#[derive(Debug)]
struct Shared {
    writer_tx: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    busy: AtomicUsize,
    inflight_started: Mutex<HashMap<u64, Instant>>,
    alive: AtomicBool,
}

impl Shared {
    fn register(&self, id: u64, pending: Pending) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, pending);
        self.busy.fetch_add(1, Ordering::SeqCst);
        self.inflight_started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Instant::now());
    }

    /// Sole removal path; keeps the busy counter in lockstep with the map.
    fn remove_pending(&self, id: u64) -> Option<Pending> {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            self.inflight_started
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        }
        removed
    }

    fn drain_pending(&self) -> Vec<Pending> {
        let drained: Vec<(u64, Pending)> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let mut started = self
            .inflight_started
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(drained.len());
        for (id, pending) in drained {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            started.remove(&id);
            out.push(pending);
        }
        out
    }

    fn send_frame(&self, request: &WorkerRequest) -> Result<()> {
        let line = serde_json::to_string(request)?;
        self.writer_tx
            .send(line)
            .map_err(|_| Error::BackendCrashed("worker connection closed".into()))
    }

    fn send_cancel(&self, request: u64) {
        let _ = self.send_frame(&WorkerRequest {
            id: 0,
            command: WorkerCommand::Cancel { request },
        });
    }
}

/// Propagates cancellation when a unary call future is dropped mid-flight.
struct CallGuard {
    shared: Arc<Shared>,
    id: u64,
    completed: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.shared.remove_pending(self.id).is_some() {
            self.shared.send_cancel(self.id);
        }
    }
}

/// Client half of the wire protocol, bound to one worker address.
#[derive(Clone, Debug)]
pub struct WorkerClient {
    addr: String,
    shared: Arc<Shared>,
}

impl WorkerClient {
    /// Connect and start the IO tasks.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            busy: AtomicUsize::new(0),
            inflight_started: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });

        tokio::spawn(writer_task(writer_rx, write_half));
        tokio::spawn(reader_task(read_half, Arc::clone(&shared)));

        Ok(Self {
            addr: addr.to_string(),
            shared,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// False once the connection dropped (worker death or Stop).
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Number of outstanding calls.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Start instant of the longest-running outstanding call.
    pub fn oldest_call_start(&self) -> Option<Instant> {
        self.shared
            .inflight_started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .min()
            .copied()
    }

    async fn call(&self, command: WorkerCommand) -> Result<WorkerPayload> {
        if !self.is_alive() {
            return Err(Error::BackendCrashed("worker connection closed".into()));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.register(id, Pending::Unary(tx));
        let mut guard = CallGuard {
            shared: Arc::clone(&self.shared),
            id,
            completed: false,
        };

        if let Err(err) = self.shared.send_frame(&WorkerRequest { id, command }) {
            guard.completed = true;
            self.shared.remove_pending(id);
            return Err(err);
        }

        let payload = rx
            .await
            .map_err(|_| Error::BackendCrashed("worker connection closed".into()));
        guard.completed = true;
        payload
    }

    pub async fn health(&self) -> Result<()> {
        match self.call(WorkerCommand::Health).await? {
            WorkerPayload::Ok => Ok(()),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Health", &other)),
        }
    }

    pub async fn load(&self, options: ModelOptions) -> Result<()> {
        match self.call(WorkerCommand::Load { options }).await? {
            WorkerPayload::Ok => Ok(()),
            WorkerPayload::Error { message } => Err(Error::BackendLoadFailed(message)),
            other => Err(unexpected("Load", &other)),
        }
    }

    pub async fn predict(&self, options: PredictOptions) -> Result<Completion> {
        match self.call(WorkerCommand::Predict { options }).await? {
            WorkerPayload::Completion {
                text,
                finish_reason,
            } => Ok(Completion {
                text,
                finish_reason,
            }),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Predict", &other)),
        }
    }

    /// Open a streamed completion. Chunks arrive in worker-emit order; the
    /// stream yields a terminal `End` or `Error` event unless the consumer
    /// drops it first, in which case a Cancel frame is sent to the worker.
    pub async fn predict_stream(&self, options: PredictOptions) -> Result<PredictStream> {
        if !self.is_alive() {
            return Err(Error::BackendCrashed("worker connection closed".into()));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.register(id, Pending::Stream(tx));

        if let Err(err) = self.shared.send_frame(&WorkerRequest {
            id,
            command: WorkerCommand::PredictStream { options },
        }) {
            self.shared.remove_pending(id);
            return Err(err);
        }

        Ok(PredictStream {
            shared: Arc::clone(&self.shared),
            id,
            rx,
        })
    }

    pub async fn embed(&self, text: String) -> Result<Vec<f32>> {
        match self.call(WorkerCommand::Embed { text }).await? {
            WorkerPayload::Embedding { values } => Ok(values),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Embed", &other)),
        }
    }

    pub async fn tts(
        &self,
        text: String,
        voice: Option<String>,
        destination: Option<String>,
    ) -> Result<String> {
        let command = WorkerCommand::Tts {
            text,
            voice,
            destination,
        };
        match self.call(command).await? {
            WorkerPayload::Audio { path } => Ok(path),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Tts", &other)),
        }
    }

    pub async fn transcribe(
        &self,
        audio_path: String,
        language: Option<String>,
        threads: Option<usize>,
    ) -> Result<Vec<TranscriptSegment>> {
        let command = WorkerCommand::Transcribe {
            audio_path,
            language,
            threads,
        };
        match self.call(command).await? {
            WorkerPayload::Segments { segments } => Ok(segments),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Transcribe", &other)),
        }
    }

    pub async fn generate_image(&self, options: ImageOptions) -> Result<String> {
        match self.call(WorkerCommand::GenerateImage { options }).await? {
            WorkerPayload::Image { path } => Ok(path),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("GenerateImage", &other)),
        }
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        match self.call(WorkerCommand::Status).await? {
            WorkerPayload::Status {
                memory_bytes,
                busy,
                finish_reason,
            } => Ok(WorkerStatus {
                memory_bytes,
                busy,
                finish_reason,
            }),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Status", &other)),
        }
    }

    /// Best-effort graceful shutdown.
    pub async fn stop(&self) -> Result<()> {
        match self.call(WorkerCommand::Stop).await? {
            WorkerPayload::Ok => Ok(()),
            WorkerPayload::Error { message } => Err(Error::Internal(message)),
            other => Err(unexpected("Stop", &other)),
        }
    }
}

fn unexpected(op: &str, payload: &WorkerPayload) -> Error {
    Error::Internal(format!("unexpected reply to {op}: {payload:?}"))
}

/// Consumer handle for one streamed completion.
pub struct PredictStream {
    shared: Arc<Shared>,
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl PredictStream {
    /// Next event; `None` after the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Drop for PredictStream {
    fn drop(&mut self) {
        // Still pending means the consumer abandoned the stream mid-flight:
        // drop the forwarding sender and tell the worker to stop generating.
        if self.shared.remove_pending(self.id).is_some() {
            debug!(request = self.id, "stream abandoned; cancelling on worker");
            self.shared.send_cancel(self.id);
        }
    }
}

async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
) {
    while let Some(line) = rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_task(reader: tokio::net::tcp::OwnedReadHalf, shared: Arc<Shared>) {
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply: WorkerReply = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "unparseable worker reply; dropping frame");
                continue;
            }
        };
        dispatch_reply(&shared, reply);
    }

    // Connection gone: fail everything still outstanding.
    shared.alive.store(false, Ordering::SeqCst);
    for pending in shared.drain_pending() {
        match pending {
            Pending::Unary(tx) => {
                let _ = tx.send(WorkerPayload::Error {
                    message: "worker connection closed".into(),
                });
            }
            Pending::Stream(tx) => {
                let _ = tx.send(StreamEvent::Error("worker connection closed".into()));
            }
        }
    }
}

fn dispatch_reply(shared: &Arc<Shared>, reply: WorkerReply) {
    match reply.payload {
        WorkerPayload::Chunk { message } => {
            let pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(Pending::Stream(tx)) = pending.get(&reply.id) {
                // A closed receiver means the consumer is gone; the entry is
                // cleaned up by PredictStream::drop.
                let _ = tx.send(StreamEvent::Chunk(message));
            }
        }
        WorkerPayload::StreamEnd { finish_reason } => {
            if let Some(Pending::Stream(tx)) = shared.remove_pending(reply.id) {
                let _ = tx.send(StreamEvent::End { finish_reason });
            }
        }
        payload => match shared.remove_pending(reply.id) {
            Some(Pending::Unary(tx)) => {
                let _ = tx.send(payload);
            }
            Some(Pending::Stream(tx)) => {
                let message = match payload {
                    WorkerPayload::Error { message } => message,
                    other => format!("unexpected stream reply: {other:?}"),
                };
                let _ = tx.send(StreamEvent::Error(message));
            }
            None => {
                if reply.id != 0 {
                    debug!(id = reply.id, "reply with no pending request");
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::fake::FakeWorker;
    use std::time::Duration;

    #[tokio::test]
    async fn predict_roundtrip() {
        let worker = FakeWorker::spawn().await;
        let client = WorkerClient::connect(worker.addr()).await.unwrap();

        let completion = client
            .predict(PredictOptions {
                prompt: "ping".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "echo:ping");
        assert_eq!(client.busy(), 0);
    }

    #[tokio::test]
    async fn stream_delivers_in_order_and_closes_once() {
        let worker = FakeWorker::builder().chunks(4).spawn().await;
        let client = WorkerClient::connect(worker.addr()).await.unwrap();

        let mut stream = client
            .predict_stream(PredictOptions {
                prompt: "abc".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut chunks = Vec::new();
        loop {
            match stream.next().await {
                Some(StreamEvent::Chunk(c)) => chunks.push(c),
                Some(StreamEvent::End { .. }) => break,
                Some(StreamEvent::Error(e)) => panic!("stream error: {e}"),
                None => panic!("stream closed before terminal event"),
            }
        }
        assert_eq!(chunks, vec!["abc-0", "abc-1", "abc-2", "abc-3"]);
        // The terminal event is the decrement point.
        assert_eq!(client.busy(), 0);
        // Exactly one close: nothing further after the terminal event.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn abandoned_stream_cancels_on_worker() {
        let worker = FakeWorker::builder()
            .chunks(100)
            .chunk_delay(Duration::from_millis(10))
            .spawn()
            .await;
        let client = WorkerClient::connect(worker.addr()).await.unwrap();

        let mut stream = client
            .predict_stream(PredictOptions {
                prompt: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        // Consume a few chunks, then walk away.
        for _ in 0..2 {
            assert!(matches!(stream.next().await, Some(StreamEvent::Chunk(_))));
        }
        drop(stream);

        worker.wait_for_cancel(Duration::from_secs(1)).await;
        assert_eq!(client.busy(), 0);
    }

    #[tokio::test]
    async fn worker_death_fails_pending_calls() {
        let worker = FakeWorker::builder()
            .predict_delay(Duration::from_secs(30))
            .spawn()
            .await;
        let client = WorkerClient::connect(worker.addr()).await.unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .predict(PredictOptions {
                        prompt: "slow".into(),
                        ..Default::default()
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Internal(_) | Error::BackendCrashed(_)));
        assert!(!client.is_alive());
        assert_eq!(client.busy(), 0);
    }
}
