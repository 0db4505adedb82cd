use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tstream_pipeline::{Pipeline, Tracer};
use tstream_types::ListenerConfig;

use crate::framing::RawFrame;
use crate::parser::{compile_match, process_frame};
use crate::receiver::PortReceiver;

/// Window after a stop request during which already-received frames are
/// still processed before the listener drops them.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// A logical listener: one subscription to a port's frame stream,
/// feeding the pipeline.
pub struct EventListener {
    pub id: String,
    pub config: ListenerConfig,
}

/// Handle to a running listener task
pub struct ListenerHandle {
    id: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request shutdown, allow a short drain, then abort.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(DRAIN_WINDOW + Duration::from_millis(500), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        info!(listener_id = %self.id, "listener stopped");
    }
}

impl EventListener {
    pub fn new(id: impl Into<String>, config: ListenerConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    /// Subscribe to the port receiver and start processing frames.
    pub fn spawn(
        self,
        receiver: &PortReceiver,
        pipeline: Arc<Pipeline>,
        input_tracer: Option<Arc<dyn Tracer>>,
        output_tracer: Option<Arc<dyn Tracer>>,
    ) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let frames = receiver.subscribe();
        let id = self.id.clone();

        let task = tokio::spawn(run_listener(
            self,
            frames,
            pipeline,
            input_tracer,
            output_tracer,
            shutdown_rx,
        ));

        info!(listener_id = %id, "listener started");
        ListenerHandle {
            id,
            shutdown: shutdown_tx,
            task,
        }
    }
}

async fn run_listener(
    listener: EventListener,
    mut frames: broadcast::Receiver<Arc<RawFrame>>,
    pipeline: Arc<Pipeline>,
    input_tracer: Option<Arc<dyn Tracer>>,
    output_tracer: Option<Arc<dyn Tracer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let match_regex: Option<Regex> = compile_match(&listener.id, &listener.config);
    let mut draining = false;
    let drain_deadline = tokio::time::sleep(Duration::from_secs(0));
    tokio::pin!(drain_deadline);

    loop {
        tokio::select! {
            _ = shutdown.changed(), if !draining => {
                draining = true;
                drain_deadline.as_mut().reset(tokio::time::Instant::now() + DRAIN_WINDOW);
            }
            _ = &mut drain_deadline, if draining => {
                debug!(listener_id = %listener.id, "drain window elapsed");
                return;
            }
            received = frames.recv() => {
                match received {
                    Ok(frame) => {
                        handle_frame(
                            &listener,
                            match_regex.as_ref(),
                            &frame,
                            &pipeline,
                            input_tracer.as_deref(),
                            output_tracer.as_deref(),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(listener_id = %listener.id, dropped, "listener lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

async fn handle_frame(
    listener: &EventListener,
    match_regex: Option<&Regex>,
    frame: &RawFrame,
    pipeline: &Pipeline,
    input_tracer: Option<&dyn Tracer>,
    output_tracer: Option<&dyn Tracer>,
) {
    if let Some(tracer) = input_tracer {
        tracer.write(&json!({
            "data": hex_encode(frame.data.as_bytes()),
            "senderKey": frame.sender_key,
            "protocol": frame.protocol.as_str(),
            "timestamp": frame.timestamp.to_rfc3339(),
            "hrtime": frame.hrtime.to_string(),
        }));
    }

    let Some(record) = process_frame(&listener.id, &listener.config, match_regex, &frame.data)
    else {
        return;
    };

    if let Some(tracer) = output_tracer
        && let Ok(payload) = serde_json::to_value(&record)
    {
        tracer.write(&payload);
    }

    pipeline.process(record).await;
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::AsyncWriteExt;
    use tstream_pipeline::{
        Consumer, ConsumerContext, ConsumerEntry, ConsumerFilter, ConsumerRegistry, PipelineState,
    };
    use tstream_types::{ConsumerConfig, Mappings, Record};

    struct RecordingConsumer {
        seen: Arc<std::sync::Mutex<Vec<Record>>>,
    }

    #[async_trait::async_trait]
    impl Consumer for RecordingConsumer {
        async fn dispatch(&self, ctx: ConsumerContext) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(ctx.event);
            Ok(())
        }
    }

    fn pipeline_to(seen: Arc<std::sync::Mutex<Vec<Record>>>, producers: &[&str]) -> Arc<Pipeline> {
        let mut consumers = ConsumerRegistry::new();
        consumers.insert(ConsumerEntry {
            id: "ns::sink".to_string(),
            enable: true,
            config: ConsumerConfig {
                consumer_type: "default".to_string(),
                config: serde_json::Value::Null,
                actions: Vec::new(),
            },
            actions: Vec::new(),
            filter: ConsumerFilter::All,
            handle: Arc::new(RecordingConsumer { seen }),
            tracer: None,
        });
        let mut mappings = Mappings::new();
        for producer in producers {
            mappings.insert(producer.to_string(), vec!["ns::sink".to_string()]);
        }
        let pipeline = Arc::new(Pipeline::new());
        pipeline.swap(PipelineState { mappings, consumers });
        pipeline
    }

    #[tokio::test]
    async fn test_two_listeners_on_one_port_both_receive() {
        let receiver = crate::receiver::PortReceiver::new(0);
        receiver.start().await.unwrap();
        let port = receiver.bound_port();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = pipeline_to(seen.clone(), &["ns::l1", "ns::l2"]);

        let config = ListenerConfig {
            port,
            match_pattern: None,
            tag: BTreeMap::new(),
            actions: Vec::new(),
        };
        let h1 = EventListener::new("ns::l1", config.clone()).spawn(
            &receiver,
            pipeline.clone(),
            None,
            None,
        );
        let h2 = EventListener::new("ns::l2", config).spawn(&receiver, pipeline.clone(), None, None);

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream.write_all(b"virtual_name=\"test\"\n").await.unwrap();
        stream.flush().await.unwrap();

        // Each listener independently produces an LTM record
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "records did not arrive");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let records = seen.lock().unwrap();
        assert_eq!(records.len(), 2);
        for record in records.iter() {
            assert_eq!(record.telemetry_event_category, "LTM");
            assert_eq!(record.data["virtual_name"], "test");
        }
        let mut sources: Vec<&str> = records.iter().map(|r| r.source_id.as_str()).collect();
        sources.sort_unstable();
        assert_eq!(sources, vec!["ns::l1", "ns::l2"]);
        drop(records);

        h1.stop().await;
        h2.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_sender_order_preserved_per_listener() {
        let receiver = crate::receiver::PortReceiver::new(0);
        receiver.start().await.unwrap();
        let port = receiver.bound_port();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = pipeline_to(seen.clone(), &["ns::l1"]);

        let config = ListenerConfig {
            port,
            match_pattern: None,
            tag: BTreeMap::new(),
            actions: Vec::new(),
        };
        let handle =
            EventListener::new("ns::l1", config).spawn(&receiver, pipeline.clone(), None, None);

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        for index in 0..5 {
            stream
                .write_all(format!("seq={}\n", index).as_bytes())
                .await
                .unwrap();
        }
        stream.flush().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 5 {
            assert!(tokio::time::Instant::now() < deadline, "records did not arrive");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let records = seen.lock().unwrap();
        let order: Vec<String> = records
            .iter()
            .map(|r| r.data["seq"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
        drop(records);

        handle.stop().await;
        receiver.stop().await;
    }
}
