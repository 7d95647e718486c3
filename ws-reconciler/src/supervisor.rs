//! Keeps the reconciliation loop alive.
//!
//! The loop runs in its own task. When that task panics the supervisor logs
//! the panic, waits a moment and starts a fresh loop; the cycle that
//! panicked is simply lost. The supervisor returns once the loop exits
//! after shutdown.

use crate::reconciler::Reconciler;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const RESTART_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs the loop until shutdown, relaunching it after panics. Returns the
/// number of restarts.
pub async fn supervise(reconciler: Arc<Reconciler>, shutdown: CancellationToken) -> u32 {
    let mut restarts = 0;

    loop {
        let task = tokio::spawn({
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            async move { reconciler.run(shutdown).await }
        });

        match task.await {
            Ok(()) => return restarts,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                error!(panic = %message, restarts, "reconciler loop panicked, restarting");
            }
            Err(e) => {
                warn!(error = %e, "reconciler loop cancelled");
                return restarts;
            }
        }

        restarts += 1;
        tokio::select! {
            _ = shutdown.cancelled() => return restarts,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}

pub fn spawn_supervised(reconciler: Arc<Reconciler>, shutdown: CancellationToken) -> JoinHandle<u32> {
    tokio::spawn(supervise(reconciler, shutdown))
}
