//! Worker subprocess supervision.
//!
//! Spawns backend binaries on a freshly allocated loopback port, waits for
//! them to answer a Health RPC, and tears them down with a graceful Stop
//! followed by a hard kill after the grace window.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::WorkerClient;

/// Readiness probe backoff, capped at the last entry.
const PROBE_DELAYS_MS: [u64; 4] = [100, 250, 500, 1000];

/// A spawned worker child. Owned by exactly one backend instance.
#[derive(Debug)]
pub struct WorkerProcess {
    addr: String,
    child: Mutex<Child>,
}

impl WorkerProcess {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn alive(&self) -> bool {
        self.child
            .lock()
            .await
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }
}

/// Stateless spawner/killer of worker subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    startup_timeout: Duration,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(startup_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            startup_timeout,
            stop_grace,
        }
    }

    /// Pick a free loopback port. The listener is dropped before the worker
    /// binds, so a raced bind is possible; the loader retries that once.
    pub fn allocate_port() -> Result<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }

    /// Launch `binary --address 127.0.0.1:<port> [args…]` and wait until it
    /// answers Health. On any failure the child is killed before returning
    /// `BackendLaunchFailed`.
    pub async fn spawn(
        &self,
        binary: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<(WorkerProcess, WorkerClient)> {
        let port = Self::allocate_port()?;
        let addr = format!("127.0.0.1:{port}");

        debug!(binary = %binary.display(), %addr, "spawning worker");
        let mut command = Command::new(binary);
        command
            .arg("--address")
            .arg(&addr)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            Error::BackendLaunchFailed(format!("{}: {err}", binary.display()))
        })?;

        match self.wait_ready(&mut child, &addr).await {
            Ok(client) => {
                info!(%addr, "worker ready");
                Ok((
                    WorkerProcess {
                        addr,
                        child: Mutex::new(child),
                    },
                    client,
                ))
            }
            Err(err) => {
                let _ = child.kill().await;
                Err(err)
            }
        }
    }

    async fn wait_ready(&self, child: &mut Child, addr: &str) -> Result<WorkerClient> {
        let deadline = Instant::now() + self.startup_timeout;
        let mut attempt = 0usize;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(Error::BackendLaunchFailed(format!(
                    "worker exited during startup: {status}"
                )));
            }

            if let Ok(client) = WorkerClient::connect(addr).await {
                if client.health().await.is_ok() {
                    return Ok(client);
                }
            }

            let delay = Duration::from_millis(
                PROBE_DELAYS_MS[attempt.min(PROBE_DELAYS_MS.len() - 1)],
            );
            attempt += 1;
            if Instant::now() + delay >= deadline {
                return Err(Error::BackendLaunchFailed(format!(
                    "worker at {addr} not ready within {:?}",
                    self.startup_timeout
                )));
            }
            sleep(delay).await;
        }
    }

    /// Graceful Stop RPC, then hard kill once the grace window elapses.
    pub async fn kill(&self, process: &WorkerProcess, client: Option<&WorkerClient>) {
        if let Some(client) = client {
            if client.is_alive() {
                let _ = timeout(Duration::from_millis(500), client.stop()).await;
            }
        }

        let mut child = process.child.lock().await;
        match timeout(self.stop_grace, child.wait()).await {
            Ok(_) => debug!(addr = %process.addr, "worker exited"),
            Err(_) => {
                warn!(addr = %process.addr, "worker ignored stop; killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// A launch failure worth one retry: the allocated port was raced away and
/// the worker died trying to bind it.
pub fn is_retryable_launch(err: &Error) -> bool {
    matches!(err, Error::BackendLaunchFailed(msg) if msg.contains("exited during startup"))
}
