use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tstream_config::ResolvedConfig;
use tstream_pipeline::{
    Consumer, ConsumerEntry, ConsumerFilter, ConsumerRegistry, LoggingConsumer, Pipeline,
    PipelineState, Tracer,
};
use tstream_pollers::{HttpClientPool, PollerScheduler};
use tstream_receivers::{EventListener, ListenerHandle, PortReceiver, ReceiverManager};
use tstream_types::{Component, ComponentKind, ConsumerConfig, Record, SecretVault, TraceSpec};

use crate::reconcile::diff;
use crate::storage::DeclarationStore;
use crate::tracer::FileTracer;
use crate::worker::{ConfigEvent, ConfigWorker};

/// Builds a dispatch handle for a consumer component. The default
/// factory returns the logging adapter for every type; deployments
/// register real adapters here.
pub type ConsumerFactory =
    Arc<dyn Fn(&Component, &ConsumerConfig) -> Arc<dyn Consumer> + Send + Sync>;

struct RunningListener {
    port: u16,
    receiver: Arc<PortReceiver>,
    handle: ListenerHandle,
}

#[derive(Default)]
struct RunningState {
    components: Vec<Component>,
    listeners: HashMap<String, RunningListener>,
}

/// The assembled agent: owns the pipeline, receivers, pollers, and the
/// config worker, and applies reconcile plans across them.
pub struct Agent {
    worker: Arc<ConfigWorker>,
    pipeline: Arc<Pipeline>,
    receivers: Arc<ReceiverManager>,
    scheduler: Arc<PollerScheduler>,
    consumer_factory: ConsumerFactory,
    running: Mutex<RunningState>,
}

impl Agent {
    pub fn new(store: Arc<DeclarationStore>, vault: Arc<dyn SecretVault>) -> Self {
        let pipeline = Arc::new(Pipeline::new());
        let scheduler = Arc::new(PollerScheduler::new(
            pipeline.clone(),
            Arc::new(HttpClientPool::new()),
            vault,
        ));
        Self {
            worker: Arc::new(ConfigWorker::new(store)),
            pipeline,
            receivers: Arc::new(ReceiverManager::new()),
            scheduler,
            consumer_factory: Arc::new(|_, _| Arc::new(LoggingConsumer)),
            running: Mutex::new(RunningState::default()),
        }
    }

    pub fn with_consumer_factory(mut self, factory: ConsumerFactory) -> Self {
        self.consumer_factory = factory;
        self
    }

    pub fn worker(&self) -> &Arc<ConfigWorker> {
        &self.worker
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Load the stored declaration and apply it, then keep applying
    /// every subsequent `change` event until the task is aborted.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self.worker.subscribe();
        let resolved = self.worker.load().await?;
        self.apply(&resolved).await?;

        let agent = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConfigEvent::Change { config, .. }) => {
                        if let Err(error) = agent.apply(&config).await {
                            warn!(%error, "reconfiguration failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "config events lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }))
    }

    /// Reconcile the running workers against a resolved configuration.
    pub async fn apply(&self, config: &ResolvedConfig) -> Result<()> {
        let mut running = self.running.lock().await;
        let plan = diff(&running.components, &config.components);
        info!(
            start = plan.start.len(),
            stop = plan.stop.len(),
            in_place = plan.update_in_place.len(),
            unchanged = plan.unchanged.len(),
            "applying reconcile plan"
        );

        let unchanged: HashSet<&str> = plan.unchanged.iter().map(String::as_str).collect();
        self.swap_pipeline(config, &unchanged);

        // Tear down removed and changed workers first
        for id in &plan.stop {
            if let Some(listener) = running.listeners.remove(id) {
                listener.handle.stop().await;
                self.receivers.release(listener.port).await;
            }
            self.scheduler.stop_poller(id).await;
        }

        // In-place listener updates: same sockets, new configuration
        for component in &plan.update_in_place {
            if let ComponentKind::Listener(listener_config) = &component.kind {
                let Some(old) = running.listeners.remove(&component.id) else {
                    continue;
                };
                old.handle.stop().await;
                if component.enable {
                    let handle = self.spawn_listener(component, listener_config, &old.receiver);
                    running.listeners.insert(
                        component.id.clone(),
                        RunningListener {
                            port: old.port,
                            receiver: old.receiver,
                            handle,
                        },
                    );
                } else {
                    self.receivers.release(old.port).await;
                }
            }
        }

        for component in &plan.start {
            if !component.enable {
                continue;
            }
            match &component.kind {
                ComponentKind::Listener(listener_config) => {
                    let receiver = self
                        .receivers
                        .acquire(listener_config.port)
                        .await
                        .with_context(|| {
                            format!("could not open port {} for {}", listener_config.port, component.id)
                        })?;
                    let handle = self.spawn_listener(component, listener_config, &receiver);
                    running.listeners.insert(
                        component.id.clone(),
                        RunningListener {
                            port: listener_config.port,
                            receiver,
                            handle,
                        },
                    );
                }
                ComponentKind::SystemPoller(_) => {
                    let (_, output_tracer) = tracers_for(&component.trace);
                    self.scheduler.start_poller(component, output_tracer)?;
                }
                _ => {}
            }
        }

        running.components = config.components.clone();
        Ok(())
    }

    /// Swap the routing table and consumer registry atomically.
    /// Unchanged consumers keep their handles.
    fn swap_pipeline(&self, config: &ResolvedConfig, unchanged: &HashSet<&str>) {
        let old = self.pipeline.snapshot();
        let mut consumers = ConsumerRegistry::new();

        for component in &config.components {
            let ComponentKind::Consumer(consumer_config) = &component.kind else {
                continue;
            };
            if unchanged.contains(component.id.as_str())
                && let Some(existing) = old.consumers.get(&component.id)
            {
                consumers.insert_shared(existing.clone());
                continue;
            }

            let tracer: Option<Arc<dyn Tracer>> = component
                .trace
                .output
                .as_ref()
                .map(|target| Arc::new(FileTracer::new(target)) as Arc<dyn Tracer>);
            consumers.insert(ConsumerEntry {
                id: component.id.clone(),
                enable: component.enable,
                config: consumer_config.clone(),
                actions: consumer_config.actions.clone(),
                filter: ConsumerFilter::All,
                handle: (self.consumer_factory)(component, consumer_config),
                tracer,
            });
        }

        self.pipeline.swap(PipelineState {
            mappings: config.mappings.clone(),
            consumers,
        });
    }

    fn spawn_listener(
        &self,
        component: &Component,
        config: &tstream_types::ListenerConfig,
        receiver: &Arc<PortReceiver>,
    ) -> ListenerHandle {
        let (input_tracer, output_tracer) = tracers_for(&component.trace);
        EventListener::new(component.id.clone(), config.clone()).spawn(
            receiver,
            self.pipeline.clone(),
            input_tracer,
            output_tracer,
        )
    }

    /// Drive a pull consumer's pollers synchronously and collect their
    /// records, in group order.
    pub async fn pull(&self, consumer_id: &str) -> Result<Vec<Record>> {
        let running = self.running.lock().await;
        let group = running
            .components
            .iter()
            .filter_map(|c| c.as_pull_consumer_group().map(|g| (c, g)))
            .find(|(_, g)| g.pull_consumer == consumer_id)
            .map(|(c, g)| (c.enable, g.system_pollers.clone()))
            .ok_or_else(|| {
                anyhow::anyhow!("no pull consumer \"{}\" in the running configuration", consumer_id)
            })?;
        let (enabled, poller_ids) = group;
        anyhow::ensure!(enabled, "pull consumer \"{}\" is disabled", consumer_id);

        let pollers: Vec<Component> = poller_ids
            .iter()
            .filter_map(|id| {
                running
                    .components
                    .iter()
                    .find(|c| &c.id == id && c.enable)
                    .cloned()
            })
            .collect();
        drop(running);

        let mut records = Vec::with_capacity(pollers.len());
        for poller in pollers {
            match self.scheduler.fire_on_demand(&poller).await {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(poller_id = %poller.id, %error, "on-demand poll failed");
                }
            }
        }
        Ok(records)
    }

    /// Stop every worker and close every socket.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (_, listener) in running.listeners.drain() {
            listener.handle.stop().await;
            self.receivers.release(listener.port).await;
        }
        self.scheduler.stop_all().await;
        self.pipeline.swap(PipelineState::empty());
        running.components.clear();
        info!("agent stopped");
    }
}

fn tracers_for(trace: &TraceSpec) -> (Option<Arc<dyn Tracer>>, Option<Arc<dyn Tracer>>) {
    if !trace.enable {
        return (None, None);
    }
    let input = trace
        .input
        .as_ref()
        .map(|target| Arc::new(FileTracer::new(target)) as Arc<dyn Tracer>);
    let output = trace
        .output
        .as_ref()
        .map(|target| Arc::new(FileTracer::new(target)) as Arc<dyn Tracer>);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::LocalVault;
    use crate::worker::ProcessOptions;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tstream_pipeline::ConsumerContext;

    struct RecordingConsumer {
        seen: Arc<StdMutex<Vec<Record>>>,
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        async fn dispatch(&self, ctx: ConsumerContext) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(ctx.event);
            Ok(())
        }
    }

    fn test_agent(seen: Arc<StdMutex<Vec<Record>>>) -> Arc<Agent> {
        let store = Arc::new(DeclarationStore::open_in_memory().unwrap());
        Arc::new(
            Agent::new(store, Arc::new(LocalVault)).with_consumer_factory(Arc::new(
                move |_, _| {
                    Arc::new(RecordingConsumer { seen: seen.clone() }) as Arc<dyn Consumer>
                },
            )),
        )
    }

    #[tokio::test]
    async fn test_declaration_to_dispatch_end_to_end() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let agent = test_agent(seen.clone());

        let resolved = agent
            .worker()
            .process_declaration(
                json!({
                    "class": "Telemetry",
                    "My_Listener": {"class": "Telemetry_Listener", "port": 42510},
                    "My_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"}
                }),
                ProcessOptions::default(),
            )
            .await
            .unwrap();
        agent.apply(&resolved).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", 42510))
            .await
            .unwrap();
        stream.write_all(b"virtual_name=\"test\"\n").await.unwrap();
        stream.flush().await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "record never reached the consumer"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let records = seen.lock().unwrap();
        assert_eq!(records[0].telemetry_event_category, "LTM");
        assert_eq!(records[0].source_id, "f5telemetry_default::My_Listener");
        drop(records);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_reapply_same_declaration_keeps_listener_running() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let agent = test_agent(seen.clone());
        let declaration = json!({
            "class": "Telemetry",
            "My_Listener": {"class": "Telemetry_Listener", "port": 42511},
            "My_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"}
        });

        let resolved = agent
            .worker()
            .process_declaration(declaration.clone(), ProcessOptions::default())
            .await
            .unwrap();
        agent.apply(&resolved).await.unwrap();

        let resolved = agent
            .worker()
            .process_declaration(declaration, ProcessOptions::default())
            .await
            .unwrap();
        agent.apply(&resolved).await.unwrap();

        // The socket is still there and still feeds the pipeline
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", 42511))
            .await
            .unwrap();
        stream.write_all(b"after reapply\n").await.unwrap();
        stream.flush().await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "record never reached the consumer"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_listener_releases_port() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let agent = test_agent(seen.clone());

        let resolved = agent
            .worker()
            .process_declaration(
                json!({
                    "class": "Telemetry",
                    "My_Listener": {"class": "Telemetry_Listener", "port": 42512}
                }),
                ProcessOptions::default(),
            )
            .await
            .unwrap();
        agent.apply(&resolved).await.unwrap();
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", 42512))
                .await
                .is_ok()
        );

        let resolved = agent
            .worker()
            .process_declaration(json!({"class": "Telemetry"}), ProcessOptions::default())
            .await
            .unwrap();
        agent.apply(&resolved).await.unwrap();

        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", 42512))
                .await
                .is_err()
        );
        agent.shutdown().await;
    }
}
