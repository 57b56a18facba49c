//! Timer-driven reaper of idle and busy backends.
//!
//! The watchdog is the only component that tears backends down on a clock;
//! every other teardown is synchronous from user control.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::loader::ModelLoader;

pub struct Watchdog {
    loader: Arc<ModelLoader>,
    idle_timeout: Option<Duration>,
    busy_timeout: Option<Duration>,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        loader: Arc<ModelLoader>,
        idle_timeout: Option<Duration>,
        busy_timeout: Option<Duration>,
        interval: Duration,
    ) -> Self {
        Self {
            loader,
            idle_timeout,
            busy_timeout,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh instance
            // gets a full interval before its first check.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        for instance in self.loader.instances().await {
            if instance.is_terminal() {
                continue;
            }

            if let Some(idle_timeout) = self.idle_timeout {
                if instance.busy() == 0 && instance.last_used().elapsed() > idle_timeout {
                    info!(
                        model = %instance.model_name(),
                        idle_for = ?instance.last_used().elapsed(),
                        "reaping idle backend"
                    );
                    self.loader.shutdown_backend(instance.key()).await;
                    continue;
                }
            }

            if let Some(busy_timeout) = self.busy_timeout {
                let stuck = instance.busy() > 0
                    && instance
                        .oldest_call_start()
                        .map(|start| start.elapsed() > busy_timeout)
                        .unwrap_or(false);
                if stuck {
                    warn!(
                        model = %instance.model_name(),
                        busy = instance.busy(),
                        "reaping hung backend"
                    );
                    self.loader.shutdown_backend(instance.key()).await;
                }
            }
        }
    }
}
