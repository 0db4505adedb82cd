use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use tstream_types::{ActionSpec, ConsumerConfig, Record, mask_secrets};

/// Sink for component trace output (a bounded on-disk ring, in
/// production). Implementations must be cheap enough to call inline.
pub trait Tracer: Send + Sync {
    fn write(&self, record: &Value);
}

/// Everything a consumer invocation receives
pub struct ConsumerContext {
    pub event: Record,
    pub config: Value,
    pub consumer_id: String,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub metadata: Option<Value>,
}

/// The uniform invocation contract for downstream adapters. Concrete
/// adapters (Kafka, Splunk, cloud APIs, ...) live outside this crate.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn dispatch(&self, ctx: ConsumerContext) -> anyhow::Result<()>;
}

/// Gate applied before a consumer's own actions
#[derive(Debug, Clone, Default)]
pub enum ConsumerFilter {
    /// Accept every record
    #[default]
    All,
    /// Accept only the named event categories
    Categories(HashSet<String>),
}

impl ConsumerFilter {
    pub fn accepts(&self, record: &Record) -> bool {
        match self {
            ConsumerFilter::All => true,
            ConsumerFilter::Categories(allowed) => {
                allowed.contains(&record.telemetry_event_category)
            }
        }
    }
}

/// One active consumer: config, shaping, and the dispatch handle
pub struct ConsumerEntry {
    pub id: String,
    pub enable: bool,
    pub config: ConsumerConfig,
    pub actions: Vec<ActionSpec>,
    pub filter: ConsumerFilter,
    pub handle: Arc<dyn Consumer>,
    pub tracer: Option<Arc<dyn Tracer>>,
}

/// Active consumer handles keyed by component id
#[derive(Default)]
pub struct ConsumerRegistry {
    entries: BTreeMap<String, Arc<ConsumerEntry>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ConsumerEntry) {
        self.entries.insert(entry.id.clone(), Arc::new(entry));
    }

    /// Re-register an existing entry, keeping its handle alive across a
    /// reconcile.
    pub fn insert_shared(&mut self, entry: Arc<ConsumerEntry>) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<ConsumerEntry>> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ConsumerEntry>> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fallback adapter: logs each record (secrets masked) at debug level.
/// Used when a declaration names a consumer type with no registered
/// implementation, and by tests.
pub struct LoggingConsumer;

#[async_trait]
impl Consumer for LoggingConsumer {
    async fn dispatch(&self, ctx: ConsumerContext) -> anyhow::Result<()> {
        let payload = serde_json::to_value(&ctx.event)?;
        debug!(consumer_id = %ctx.consumer_id, data = %mask_secrets(&payload), "record dispatched");
        if let Some(tracer) = &ctx.tracer {
            tracer.write(&mask_secrets(&payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_filter() {
        let mut categories = HashSet::new();
        categories.insert("LTM".to_string());
        let filter = ConsumerFilter::Categories(categories);

        let ltm = Record::new("LTM", "src", serde_json::json!({}));
        let other = Record::new("event", "src", serde_json::json!({}));
        assert!(filter.accepts(&ltm));
        assert!(!filter.accepts(&other));
        assert!(ConsumerFilter::All.accepts(&other));
    }
}
