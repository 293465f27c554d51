//! Periodic save of unsaved changes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Session;

/// Running autosave loop. Dropping the handle stops the loop after one
/// last save; [`AutosaveHandle::stop`] also waits for that save.
#[derive(Debug)]
pub struct AutosaveHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AutosaveHandle {
    /// Stop the loop and wait for its final save.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "autosave task did not complete");
            }
        }
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Session {
    /// Save every [`SessionConfig::autosave_interval`](super::SessionConfig)
    /// while the session has unsaved changes. `None` when no interval is set.
    pub fn spawn_autosave(&self) -> Option<AutosaveHandle> {
        let interval = self.config.autosave_interval?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_autosave(self.clone(), interval, cancel.clone()));
        Some(AutosaveHandle {
            cancel,
            task: Some(task),
        })
    }
}

async fn run_autosave(session: Session, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticker.tick().await;
    debug!(
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "autosave started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => autosave_once(&session).await,
            () = cancel.cancelled() => {
                autosave_once(&session).await;
                debug!("autosave stopped");
                return;
            }
        }
    }
}

async fn autosave_once(session: &Session) {
    // `save` already logs and records the failure; the next tick retries.
    if let Err(e) = session.save_if_dirty().await {
        debug!(error = %e, "autosave attempt failed");
    }
}
