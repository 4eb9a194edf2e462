use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::info;

/// Fixed-interval refresh loop that stands in for the push channel while it is
/// down. The loop owns no merge logic; each tick hands off to `refresh`.
#[derive(Debug, Default)]
pub struct PollingFallback {
    task: Option<JoinHandle<()>>,
}

impl PollingFallback {
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts polling unless it is already running. The first refresh fires one
    /// interval after start. `refresh` returning false ends the loop.
    pub fn start<F, Fut>(&mut self, interval: Duration, mut refresh: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.is_active() {
            return false;
        }
        info!(interval_ms = interval.as_millis() as u64, "polling: started");
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !refresh().await {
                    break;
                }
            }
        }));
        true
    }

    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                info!("polling: stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
