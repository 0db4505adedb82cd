use futures::future::join_all;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use tstream_types::{Mappings, Record};

use crate::actions::apply_actions;
use crate::registry::{ConsumerContext, ConsumerRegistry};

/// Routing table plus consumer registry, swapped atomically on
/// reconcile. Data-plane tasks only ever hold a snapshot.
pub struct PipelineState {
    pub mappings: Mappings,
    pub consumers: ConsumerRegistry,
}

impl PipelineState {
    pub fn empty() -> Self {
        Self {
            mappings: Mappings::new(),
            consumers: ConsumerRegistry::new(),
        }
    }
}

/// Fans records out to the consumers targeted by their routing key.
pub struct Pipeline {
    state: RwLock<Arc<PipelineState>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(PipelineState::empty())),
        }
    }

    /// Replace the routing state. In-flight dispatches keep the
    /// snapshot they started with.
    pub fn swap(&self, state: PipelineState) {
        *self.state.write().expect("pipeline state lock poisoned") = Arc::new(state);
    }

    pub fn snapshot(&self) -> Arc<PipelineState> {
        self.state.read().expect("pipeline state lock poisoned").clone()
    }

    /// Dispatch one record to every enabled consumer mapped to its
    /// `source_id`. Completes when all consumers have settled; a failing
    /// consumer is logged and never affects the others.
    pub async fn process(&self, record: Record) {
        let state = self.snapshot();
        let Some(consumer_ids) = state.mappings.get(&record.source_id) else {
            debug!(source_id = %record.source_id, "record has no consumers");
            return;
        };

        let mut tasks = Vec::with_capacity(consumer_ids.len());
        for consumer_id in consumer_ids {
            let Some(entry) = state.consumers.get(consumer_id) else {
                warn!(consumer_id = %consumer_id, "mapped consumer is not registered");
                continue;
            };
            if !entry.enable {
                continue;
            }

            // Consumers may mutate their copy freely
            let mut copy = record.clone();
            if !entry.filter.accepts(&copy) {
                continue;
            }
            apply_actions(&mut copy, &entry.actions);

            let entry = entry.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = ConsumerContext {
                    event: copy,
                    config: entry.config.config.clone(),
                    consumer_id: entry.id.clone(),
                    tracer: entry.tracer.clone(),
                    metadata: None,
                };
                (entry.id.clone(), entry.handle.dispatch(ctx).await)
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok((consumer_id, Ok(()))) => {
                    debug!(consumer_id = %consumer_id, "dispatch complete");
                }
                Ok((consumer_id, Err(error))) => {
                    warn!(consumer_id = %consumer_id, %error, "consumer dispatch failed");
                }
                Err(join_error) => {
                    warn!(%join_error, "consumer task aborted");
                }
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
