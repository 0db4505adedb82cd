use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};
use uuid::Uuid;

use tstream_config::{ResolvedConfig, classes, resolve};
use tstream_types::{DEFAULT_NAMESPACE, Error, Result};

use crate::storage::DeclarationStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Options for one declaration apply
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Return the expanded component view to the caller
    pub expanded: bool,
    /// Persist the raw declaration on success
    pub save: bool,
    /// Opaque caller context, echoed on every event
    pub metadata: Option<Value>,
    /// Restrict worker updates to one namespace
    pub namespace_to_update: Option<String>,
}

impl ProcessOptions {
    pub fn saved() -> Self {
        Self {
            save: true,
            ..Self::default()
        }
    }
}

/// Lifecycle events emitted around declaration processing. Every event
/// carries the per-invocation transaction id and the caller's metadata.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Received {
        transaction_id: Uuid,
        metadata: Option<Value>,
    },
    ValidationSucceed {
        transaction_id: Uuid,
        metadata: Option<Value>,
    },
    ValidationFailed {
        transaction_id: Uuid,
        metadata: Option<Value>,
        error: String,
    },
    Change {
        transaction_id: Uuid,
        metadata: Option<Value>,
        config: Arc<ResolvedConfig>,
    },
}

struct WorkerState {
    raw: Value,
    current: Arc<ResolvedConfig>,
}

/// Receives declarations, validates and expands them, persists the
/// accepted raw form, and publishes `change` events for the reconciler.
/// Applies are strictly serialized; concurrent callers queue.
pub struct ConfigWorker {
    store: Arc<DeclarationStore>,
    state: Mutex<WorkerState>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigWorker {
    pub fn new(store: Arc<DeclarationStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Mutex::new(WorkerState {
                raw: empty_declaration(),
                current: Arc::new(ResolvedConfig::empty()),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the currently applied configuration
    pub async fn current(&self) -> Arc<ResolvedConfig> {
        self.state.lock().await.current.clone()
    }

    /// The stored raw declaration, optionally sliced to one namespace.
    pub async fn get_declaration(&self, namespace: Option<&str>) -> Result<Value> {
        let state = self.state.lock().await;
        let Some(namespace) = namespace else {
            return Ok(state.raw.clone());
        };

        if namespace == DEFAULT_NAMESPACE {
            // The implicit namespace is the root minus nested namespaces
            let mut sliced = Map::new();
            sliced.insert(
                "class".to_string(),
                Value::String(classes::NAMESPACE.to_string()),
            );
            if let Some(root) = state.raw.as_object() {
                for (key, value) in root {
                    let class = value.get("class").and_then(Value::as_str);
                    if matches!(class, Some(c) if classes::NAMESPACED.contains(&c)) {
                        sliced.insert(key.clone(), value.clone());
                    }
                }
            }
            return Ok(Value::Object(sliced));
        }

        match state.raw.get(namespace) {
            Some(value)
                if value.get("class").and_then(Value::as_str) == Some(classes::NAMESPACE) =>
            {
                Ok(value.clone())
            }
            _ => Err(Error::ObjectNotFound(format!(
                "namespace \"{}\" does not exist in the declaration",
                namespace
            ))),
        }
    }

    /// Validate, expand, optionally persist, then publish `change`.
    pub async fn process_declaration(
        &self,
        declaration: Value,
        opts: ProcessOptions,
    ) -> Result<Arc<ResolvedConfig>> {
        // One apply at a time, end to end
        let mut state = self.state.lock().await;
        self.apply_locked(&mut state, declaration, opts)
    }

    /// Validate a namespace fragment, merge it into the full
    /// declaration, then process the merged result scoped to that
    /// namespace.
    pub async fn process_namespace_declaration(
        &self,
        fragment: Value,
        namespace: &str,
        mut opts: ProcessOptions,
    ) -> Result<Arc<ResolvedConfig>> {
        let mut state = self.state.lock().await;

        let mut body = match fragment {
            Value::Object(map) => map,
            other => {
                return Err(Error::Validation(format!(
                    "namespace declaration must be an object, got {}",
                    tstream_types::json_type_name(&other)
                )));
            }
        };
        body.insert(
            "class".to_string(),
            Value::String(classes::NAMESPACE.to_string()),
        );

        let mut merged = state.raw.clone();
        let root = merged
            .as_object_mut()
            .expect("current declaration is always an object");
        if let Some(existing) = root.get(namespace)
            && existing.get("class").and_then(Value::as_str) != Some(classes::NAMESPACE)
        {
            return Err(Error::Validation(format!(
                "cannot override class of \"{}\" with {}",
                namespace,
                classes::NAMESPACE
            )));
        }
        root.insert(namespace.to_string(), Value::Object(body));

        opts.namespace_to_update = Some(namespace.to_string());
        self.apply_locked(&mut state, merged, opts)
    }

    fn apply_locked(
        &self,
        state: &mut WorkerState,
        declaration: Value,
        opts: ProcessOptions,
    ) -> Result<Arc<ResolvedConfig>> {
        let transaction_id = Uuid::new_v4();
        self.emit(ConfigEvent::Received {
            transaction_id,
            metadata: opts.metadata.clone(),
        });

        let mut resolved = match resolve(&declaration, Some(state.current.as_ref())) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(%transaction_id, %error, "declaration rejected");
                self.emit(ConfigEvent::ValidationFailed {
                    transaction_id,
                    metadata: opts.metadata.clone(),
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        self.emit(ConfigEvent::ValidationSucceed {
            transaction_id,
            metadata: opts.metadata.clone(),
        });

        if let Some(namespace) = &opts.namespace_to_update {
            for component in &mut resolved.components {
                component.skip_update = &component.namespace != namespace;
            }
        }

        if opts.save {
            // Secrets are preserved as cipher-text in the stored form
            self.store
                .save_declaration(&declaration)
                .map_err(|e| Error::Validation(format!("failed to persist declaration: {}", e)))?;
        }

        let resolved = Arc::new(resolved);
        state.raw = declaration;
        state.current = resolved.clone();

        info!(
            %transaction_id,
            components = resolved.components.len(),
            "declaration applied"
        );
        self.emit(ConfigEvent::Change {
            transaction_id,
            metadata: opts.metadata,
            config: resolved.clone(),
        });
        Ok(resolved)
    }

    /// Rehydrate from storage at startup. A bad or unreadable stored
    /// declaration falls back to an empty one, without overwriting what
    /// is stored.
    pub async fn load(&self) -> Result<Arc<ResolvedConfig>> {
        let stored = match self.store.load_declaration() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("no stored declaration, starting empty");
                return Ok(self.current().await);
            }
            Err(error) => {
                warn!(%error, "could not read stored declaration, starting empty");
                return Ok(self.current().await);
            }
        };

        match self
            .process_declaration(stored, ProcessOptions::default())
            .await
        {
            Ok(resolved) => Ok(resolved),
            Err(error) => {
                warn!(%error, "stored declaration no longer validates, starting empty");
                Ok(self.current().await)
            }
        }
    }

    /// Drop in-memory state and remove the persisted blob.
    pub async fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.raw = empty_declaration();
        state.current = Arc::new(ResolvedConfig::empty());
        self.store
            .remove_declaration()
            .map_err(|e| Error::Validation(format!("failed to remove stored declaration: {}", e)))
    }

    fn emit(&self, event: ConfigEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn empty_declaration() -> Value {
    json!({"class": "Telemetry"})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> ConfigWorker {
        ConfigWorker::new(Arc::new(DeclarationStore::open_in_memory().unwrap()))
    }

    fn sample_declaration() -> Value {
        json!({
            "class": "Telemetry",
            "My_Listener": {"class": "Telemetry_Listener", "port": 40100},
            "My_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"},
            "Lab": {
                "class": "Telemetry_Namespace",
                "Lab_Listener": {"class": "Telemetry_Listener", "port": 40101}
            }
        })
    }

    #[tokio::test]
    async fn test_process_emits_lifecycle_events() {
        let worker = worker();
        let mut events = worker.subscribe();

        worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();

        let received = events.recv().await.unwrap();
        let succeeded = events.recv().await.unwrap();
        let changed = events.recv().await.unwrap();

        let tx1 = match received {
            ConfigEvent::Received { transaction_id, .. } => transaction_id,
            other => panic!("expected Received, got {:?}", other),
        };
        let tx2 = match succeeded {
            ConfigEvent::ValidationSucceed { transaction_id, .. } => transaction_id,
            other => panic!("expected ValidationSucceed, got {:?}", other),
        };
        assert_eq!(tx1, tx2);
        match changed {
            ConfigEvent::Change { config, .. } => {
                assert_eq!(config.components.len(), 3);
            }
            other => panic!("expected Change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_failure_emits_and_keeps_state() {
        let worker = worker();
        worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();

        let mut events = worker.subscribe();
        let result = worker
            .process_declaration(json!({"class": "Nope"}), ProcessOptions::default())
            .await;
        assert!(result.is_err());

        let _received = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            ConfigEvent::ValidationFailed { error, .. } => {
                assert!(error.contains("Telemetry"));
            }
            other => panic!("expected ValidationFailed, got {:?}", other),
        }

        // State still holds the previous good declaration
        assert_eq!(worker.current().await.components.len(), 3);
    }

    #[tokio::test]
    async fn test_get_declaration_slices_namespaces() {
        let worker = worker();
        worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();

        let whole = worker.get_declaration(None).await.unwrap();
        assert_eq!(whole["class"], "Telemetry");

        let lab = worker.get_declaration(Some("Lab")).await.unwrap();
        assert!(lab.get("Lab_Listener").is_some());

        let default = worker
            .get_declaration(Some(DEFAULT_NAMESPACE))
            .await
            .unwrap();
        assert!(default.get("My_Listener").is_some());
        assert!(default.get("Lab").is_none());

        let missing = worker.get_declaration(Some("Ghost")).await;
        assert!(matches!(missing, Err(Error::ObjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_namespace_declaration_merges_and_scopes() {
        let worker = worker();
        worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();

        let resolved = worker
            .process_namespace_declaration(
                json!({"Lab_Listener_2": {"class": "Telemetry_Listener", "port": 40102}}),
                "Lab",
                ProcessOptions::default(),
            )
            .await
            .unwrap();

        // The new namespace content replaced the old one
        assert!(resolved.component("Lab::Lab_Listener_2").is_some());
        assert!(resolved.component("Lab::Lab_Listener").is_none());

        // Components outside the namespace are marked skip-update
        let outside = resolved.component("f5telemetry_default::My_Listener").unwrap();
        assert!(outside.skip_update);
        let inside = resolved.component("Lab::Lab_Listener_2").unwrap();
        assert!(!inside.skip_update);
    }

    #[tokio::test]
    async fn test_save_persists_and_load_rehydrates() {
        let store = Arc::new(DeclarationStore::open_in_memory().unwrap());
        let worker = ConfigWorker::new(store.clone());
        worker
            .process_declaration(sample_declaration(), ProcessOptions::saved())
            .await
            .unwrap();

        // A fresh worker over the same store picks the declaration up
        let rehydrated = ConfigWorker::new(store);
        let resolved = rehydrated.load().await.unwrap();
        assert_eq!(resolved.components.len(), 3);
    }

    #[tokio::test]
    async fn test_load_fallback_is_empty_and_quiet() {
        let store = Arc::new(DeclarationStore::open_in_memory().unwrap());
        store
            .save_declaration(&json!({"class": "NotTelemetry"}))
            .unwrap();

        let worker = ConfigWorker::new(store.clone());
        let resolved = worker.load().await.unwrap();
        assert!(resolved.components.is_empty());
        assert!(resolved.mappings.is_empty());

        // The stored blob was not overwritten
        assert_eq!(
            store.load_declaration().unwrap(),
            Some(json!({"class": "NotTelemetry"}))
        );
    }

    #[tokio::test]
    async fn test_cleanup_drops_state_and_blob() {
        let store = Arc::new(DeclarationStore::open_in_memory().unwrap());
        let worker = ConfigWorker::new(store.clone());
        worker
            .process_declaration(sample_declaration(), ProcessOptions::saved())
            .await
            .unwrap();

        worker.cleanup().await.unwrap();
        assert!(worker.current().await.components.is_empty());
        assert!(store.load_declaration().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reapplying_same_declaration_is_stable() {
        let worker = worker();
        let first = worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();
        let second = worker
            .process_declaration(sample_declaration(), ProcessOptions::default())
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first.components).unwrap(),
            serde_json::to_string(&second.components).unwrap()
        );
        assert_eq!(first.mappings, second.mappings);
    }
}
