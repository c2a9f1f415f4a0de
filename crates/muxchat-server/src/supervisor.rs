//! Capacity supervisor.
//!
//! One background task per registry recomputes the `full` flag on a fixed
//! interval. The sleep between checks races the cancellation token, so
//! cancelling takes effect immediately rather than at the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Default time between two capacity checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Handle on a running supervisor.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Ask the supervisor to stop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl ConnectionRegistry {
    /// Spawn the capacity supervisor for this registry.
    pub fn supervise(self: &Arc<Self>, interval: Duration) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_supervisor(self.clone(), interval, cancel.clone()));
        SupervisorHandle { cancel, task }
    }
}

async fn run_supervisor(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = interval.as_secs(),
        max_online = registry.max_online(),
        "connection registry supervisor started"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let full = registry.refresh_capacity().await;
        debug!(full, "capacity checked");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("connection registry supervisor cancelled");
}
