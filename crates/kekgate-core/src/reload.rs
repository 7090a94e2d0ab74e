//! Cooperative periodic task used by the hot-reload loops.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{error, info};

/// Handle to a periodic background task. The stop signal is observed at tick
/// boundaries; [`ReloadHandle::shutdown`] waits for the task to acknowledge
/// by joining it.
pub struct ReloadHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReloadHandle {
    pub fn spawn<F>(name: &'static str, interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let tick = Arc::new(tick);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tick = Arc::clone(&tick);
                        if let Err(err) = tokio::task::spawn_blocking(move || tick()).await {
                            error!(task = name, error = %err, "reload tick panicked");
                        }
                    }
                    _ = stopped.changed() => {
                        info!(task = name, "reload task stopping");
                        return;
                    }
                }
            }
        });
        info!(task = name, interval_secs = interval.as_secs(), "reload task started");
        Self { stop, task }
    }

    /// Signal the task to stop and wait for it to finish its current tick.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
