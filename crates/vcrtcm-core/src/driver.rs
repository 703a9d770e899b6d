//! Tokio task that drives [`Vcrtcm::tick`] from a monotonic clock.
//!
//! `tick` runs collaborator callbacks and may wait on GPU pushes, so each call goes to the
//! blocking pool instead of running on a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::manager::Vcrtcm;

#[derive(Debug, Clone)]
pub struct VblankDriverConfig {
    /// How long to sleep when no pcon has a vblank scheduled.
    pub idle_poll: Duration,
}

impl Default for VblankDriverConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(50),
        }
    }
}

/// Running vblank driver. Dropping the handle aborts the task.
pub struct VblankDriverHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl VblankDriverHandle {
    /// Stop the loop and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for VblankDriverHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the driver on the current tokio runtime.
///
/// Time is measured from the moment of the call; `tick` sees nanoseconds since then.
pub fn spawn_vblank_driver(vcrtcm: Arc<Vcrtcm>, cfg: VblankDriverConfig) -> VblankDriverHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let epoch = Instant::now();

    let task = tokio::spawn(async move {
        tracing::debug!(idle_poll_ms = cfg.idle_poll.as_millis() as u64, "vblank driver started");
        loop {
            let now = Instant::now();
            let now_ns = now.duration_since(epoch).as_nanos().min(u64::MAX as u128) as u64;
            let vc = Arc::clone(&vcrtcm);
            let next = match tokio::task::spawn_blocking(move || vc.tick(now_ns)).await {
                Ok(next) => next,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    tracing::error!(%err, "vblank tick panicked");
                    None
                }
            };
            let wake = match next {
                Some(deadline_ns) => {
                    let delay = Duration::from_nanos(deadline_ns.saturating_sub(now_ns));
                    now + delay.min(cfg.idle_poll)
                }
                None => now + cfg.idle_poll,
            };

            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
        tracing::debug!("vblank driver stopped");
    });

    VblankDriverHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}
