use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use tstream_pipeline::{Pipeline, Tracer};
use tstream_types::{Component, Record, SecretVault};

use crate::client::HttpClientPool;
use crate::cycle::run_cycle;

/// Handle to one scheduled poller task
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
    }
}

/// Drives interval pollers on their timers and pull-mode pollers on
/// demand.
pub struct PollerScheduler {
    pipeline: Arc<Pipeline>,
    clients: Arc<HttpClientPool>,
    vault: Arc<dyn SecretVault>,
    tasks: Mutex<HashMap<String, PollerHandle>>,
}

impl PollerScheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        clients: Arc<HttpClientPool>,
        vault: Arc<dyn SecretVault>,
    ) -> Self {
        Self {
            pipeline,
            clients,
            vault,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the timer task for an interval poller. Pull-mode pollers
    /// (interval 0) are not scheduled; they run via `fire_on_demand`.
    pub fn start_poller(
        &self,
        component: &Component,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> Result<()> {
        let config = component
            .as_system_poller()
            .context("component is not a system poller")?;
        if config.is_pull_mode() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_scheduled(
            component.id.clone(),
            config.clone(),
            self.pipeline.clone(),
            self.clients.clone(),
            self.vault.clone(),
            tracer,
            shutdown_rx,
        ));

        let previous = self.tasks.lock().expect("scheduler lock poisoned").insert(
            component.id.clone(),
            PollerHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        if let Some(previous) = previous {
            // Replaced while running; tear the old task down in place
            tokio::spawn(previous.stop());
        }
        info!(poller_id = %component.id, interval = config.interval, "poller scheduled");
        Ok(())
    }

    pub async fn stop_poller(&self, id: &str) {
        let handle = self.tasks.lock().expect("scheduler lock poisoned").remove(id);
        if let Some(handle) = handle {
            handle.stop().await;
            info!(poller_id = %id, "poller stopped");
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<(String, PollerHandle)> = self
            .tasks
            .lock()
            .expect("scheduler lock poisoned")
            .drain()
            .collect();
        for (id, handle) in handles {
            handle.stop().await;
            info!(poller_id = %id, "poller stopped");
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .lock()
            .expect("scheduler lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Run one cycle of a pull-mode poller synchronously and return the
    /// record instead of sending it through the pipeline.
    pub async fn fire_on_demand(&self, component: &Component) -> Result<Record> {
        let config = component
            .as_system_poller()
            .context("component is not a system poller")?;
        let client = self.clients.client_for(&config.connection)?;
        run_cycle(&component.id, config, &client, self.vault.as_ref()).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduled(
    poller_id: String,
    config: tstream_types::SystemPollerConfig,
    pipeline: Arc<Pipeline>,
    clients: Arc<HttpClientPool>,
    vault: Arc<dyn SecretVault>,
    tracer: Option<Arc<dyn Tracer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.interval);

    // Spread simultaneous pollers; the jitter never exceeds the interval
    let jitter = jitter_for(interval);
    tokio::select! {
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    loop {
        let cycle_start = Instant::now();
        let client = match clients.client_for(&config.connection) {
            Ok(client) => client,
            Err(error) => {
                warn!(poller_id = %poller_id, %error, "could not build http client");
                return;
            }
        };

        match run_cycle(&poller_id, &config, &client, vault.as_ref()).await {
            Ok(record) => {
                if let Some(tracer) = &tracer
                    && let Ok(payload) = serde_json::to_value(&record)
                {
                    tracer.write(&payload);
                }
                pipeline.process(record).await;
            }
            Err(error) => {
                warn!(poller_id = %poller_id, %error, "poll cycle failed");
            }
        }

        // Overlap guard: a cycle that overran its interval eats the
        // ticks it missed
        let elapsed = cycle_start.elapsed();
        if elapsed >= interval {
            let skipped = elapsed.as_secs() / config.interval.max(1);
            warn!(poller_id = %poller_id, skipped, "cycle overran its interval, skipping ticks");
        }
        let wait = interval
            .checked_sub(Duration::from_secs(elapsed.as_secs() % config.interval.max(1)))
            .unwrap_or(interval);

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn jitter_for(interval: Duration) -> Duration {
    let cap = interval.as_millis().min(30_000).max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..cap))
}
