//! Graceful shutdown orchestration (§5, §10.5): one `CancellationToken` fans out to every
//! component, and a bounded grace window stops the top-level runner from hanging on a
//! collaborator that never drains.
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared shutdown signal. Cloning is cheap; every long-lived task gets its own clone of the
/// inner token.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for Ctrl-C, then cancels the shared token.
    pub async fn wait_for_signal(&self) {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("failed to install Ctrl-C handler; shutdown must be signalled some other way");
            return;
        }
        tracing::info!("received Ctrl-C, beginning graceful shutdown");
        self.cancel();
    }

    /// Runs `fut` to completion, returning `None` and logging a warning if `grace_period`
    /// elapses first (§6 `gracePeriod`). Used to bound how long the top-level runner waits on
    /// in-flight associations and background tasks to drain.
    pub async fn within_grace_period<F>(grace_period: Duration, fut: F) -> Option<F::Output>
    where
        F: std::future::Future,
    {
        match tokio::time::timeout(grace_period, fut).await {
            Ok(output) => Some(output),
            Err(_) => {
                tracing::warn!(?grace_period, "grace period elapsed before all components drained");
                None
            }
        }
    }
}
