use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{CoreError, CoreErrorKind, CoreResult};
use crate::registry::Registry;

/// Running heartbeat loop. Dropping the handle leaves the loop running until the
/// runtime shuts down; call [`HeartbeatHandle::stop`] to end it.
pub struct HeartbeatHandle {
    stop: Arc<Notify>,
    rounds: Arc<HeartbeatRounds>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct HeartbeatRounds {
    beats: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<CoreError>>,
}

impl HeartbeatRounds {
    fn record_failure(&self, error: CoreError) {
        tracing::error!(
            kind = ?error.kind,
            message = %error.message,
            "heartbeat sync failed"
        );
        self.failures.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error);
        }
    }
}

impl HeartbeatHandle {
    /// Completed sync rounds so far.
    pub fn beats(&self) -> u64 {
        self.rounds.beats.load(Ordering::SeqCst)
    }

    /// Rounds in which at least one worker state could not be written.
    pub fn failures(&self) -> u64 {
        self.rounds.failures.load(Ordering::SeqCst)
    }

    /// Error of the most recent failed round.
    pub fn last_error(&self) -> Option<CoreError> {
        self.rounds
            .last_error
            .lock()
            .ok()
            .and_then(|last| last.clone())
    }

    pub async fn stop(self) -> CoreResult<u64> {
        self.stop.notify_one();
        self.join.await.map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("heartbeat join failure: {join_error}"),
            )
        })?;
        Ok(self.rounds.beats.load(Ordering::SeqCst))
    }
}

/// Periodically writes every registered worker's state to the store. The first
/// round runs immediately. Must be called inside a tokio runtime.
pub fn spawn_heartbeat(registry: Arc<Registry>, period: Duration) -> CoreResult<HeartbeatHandle> {
    if period.is_zero() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "heartbeat interval must be greater than zero",
        ));
    }

    let stop = Arc::new(Notify::new());
    let rounds = Arc::new(HeartbeatRounds::default());
    let signal = Arc::clone(&stop);
    let counter = Arc::clone(&rounds);

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.notified() => break,
                _ = ticker.tick() => {
                    let registry = Arc::clone(&registry);
                    match tokio::task::spawn_blocking(move || registry.sync_all_workers()).await {
                        Ok(Ok(synced)) => {
                            counter.beats.fetch_add(1, Ordering::SeqCst);
                            tracing::debug!(synced, "heartbeat synced worker states");
                        }
                        Ok(Err(error)) => counter.record_failure(error),
                        Err(join_error) => counter.record_failure(CoreError::new(
                            CoreErrorKind::Internal,
                            format!("heartbeat sync join failure: {join_error}"),
                        )),
                    }
                }
            }
        }
        tracing::debug!("heartbeat stopped");
    });

    Ok(HeartbeatHandle { stop, rounds, join })
}
