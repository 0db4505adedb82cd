use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ID_SEPARATOR;
use crate::actions::ActionSpec;
use crate::secrets::Secret;
use crate::trace::TraceSpec;

/// Id of a namespace-scoped object: `<namespace>::<name>`
pub fn component_id(namespace: &str, name: &str) -> String {
    format!("{}{}{}", namespace, ID_SEPARATOR, name)
}

/// Id of a system-scoped poller: `<namespace>::<system>::<poller>`
pub fn poller_id(namespace: &str, system: &str, poller: &str) -> String {
    format!(
        "{}{}{}{}{}",
        namespace, ID_SEPARATOR, system, ID_SEPARATOR, poller
    )
}

/// Declaration classes that expand into runnable components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentClass {
    #[serde(rename = "Telemetry_System_Poller")]
    SystemPoller,
    #[serde(rename = "Telemetry_Listener")]
    Listener,
    #[serde(rename = "Telemetry_Consumer")]
    Consumer,
    #[serde(rename = "Telemetry_Pull_Consumer")]
    PullConsumer,
    #[serde(rename = "Telemetry_Pull_Consumer_System_Poller_Group")]
    PullConsumerGroup,
}

impl ComponentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentClass::SystemPoller => "Telemetry_System_Poller",
            ComponentClass::Listener => "Telemetry_Listener",
            ComponentClass::Consumer => "Telemetry_Consumer",
            ComponentClass::PullConsumer => "Telemetry_Pull_Consumer",
            ComponentClass::PullConsumerGroup => "Telemetry_Pull_Consumer_System_Poller_Group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

/// Target device connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub allow_self_signed_cert: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8100,
            protocol: Protocol::Http,
            allow_self_signed_cert: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Secret>,
}

/// One custom endpoint of a `Telemetry_Endpoints` set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

/// Poller-side data shaping options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataOpts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub no_tm_stats: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPollerConfig {
    /// Seconds between cycles; 0 marks a pull-mode poller fired on demand
    pub interval: u64,
    pub connection: Connection,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_list: Option<Vec<Endpoint>>,
    #[serde(default)]
    pub data_opts: DataOpts,
    /// Name of the enclosing system (equals the poller name for
    /// synthesized standalone systems)
    pub system_name: String,
}

impl SystemPollerConfig {
    pub fn is_pull_mode(&self) -> bool {
        self.interval == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    pub port: u16,
    /// Optional regex; frames that do not match are dropped
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tag: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    #[serde(rename = "type")]
    pub consumer_type: String,
    /// Type-specific configuration, secret refs included
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullConsumerConfig {
    #[serde(rename = "type")]
    pub consumer_type: String,
    /// Poller references exactly as declared (names or ids)
    pub system_pollers: Vec<String>,
}

/// Synthesized link between a pull consumer and its pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullConsumerGroupConfig {
    /// Id of the pull consumer this group feeds
    pub pull_consumer: String,
    /// Ordered, de-duplicated fully-qualified poller ids
    pub system_pollers: Vec<String>,
}

/// Class-specific component payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum ComponentKind {
    #[serde(rename = "Telemetry_System_Poller")]
    SystemPoller(SystemPollerConfig),
    #[serde(rename = "Telemetry_Listener")]
    Listener(ListenerConfig),
    #[serde(rename = "Telemetry_Consumer")]
    Consumer(ConsumerConfig),
    #[serde(rename = "Telemetry_Pull_Consumer")]
    PullConsumer(PullConsumerConfig),
    #[serde(rename = "Telemetry_Pull_Consumer_System_Poller_Group")]
    PullConsumerGroup(PullConsumerGroupConfig),
}

/// The internal, id-addressed form of one declaration object after
/// expansion. Identity is `(namespace, name)`; the id string is derived
/// from it and is unique across the whole component set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub enable: bool,
    pub trace: TraceSpec,
    /// Set on components outside the namespace targeted by a scoped
    /// reconfiguration; workers leave them untouched
    #[serde(default)]
    pub skip_update: bool,
    #[serde(flatten)]
    pub kind: ComponentKind,
}

impl Component {
    pub fn class(&self) -> ComponentClass {
        match self.kind {
            ComponentKind::SystemPoller(_) => ComponentClass::SystemPoller,
            ComponentKind::Listener(_) => ComponentClass::Listener,
            ComponentKind::Consumer(_) => ComponentClass::Consumer,
            ComponentKind::PullConsumer(_) => ComponentClass::PullConsumer,
            ComponentKind::PullConsumerGroup(_) => ComponentClass::PullConsumerGroup,
        }
    }

    pub fn as_listener(&self) -> Option<&ListenerConfig> {
        match &self.kind {
            ComponentKind::Listener(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_system_poller(&self) -> Option<&SystemPollerConfig> {
        match &self.kind {
            ComponentKind::SystemPoller(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&ConsumerConfig> {
        match &self.kind {
            ComponentKind::Consumer(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_pull_consumer_group(&self) -> Option<&PullConsumerGroupConfig> {
        match &self.kind {
            ComponentKind::PullConsumerGroup(config) => Some(config),
            _ => None,
        }
    }
}

/// Producer id -> consumer ids routing table
pub type Mappings = BTreeMap<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_helpers() {
        assert_eq!(component_id("ns", "obj"), "ns::obj");
        assert_eq!(poller_id("ns", "sys", "p"), "ns::sys::p");
    }

    #[test]
    fn test_component_round_trips_with_class_tag() {
        let component = Component {
            id: component_id("ns", "listener"),
            namespace: "ns".to_string(),
            name: "listener".to_string(),
            enable: true,
            trace: TraceSpec::disabled(),
            skip_update: false,
            kind: ComponentKind::Listener(ListenerConfig {
                port: 6514,
                match_pattern: None,
                tag: BTreeMap::new(),
                actions: Vec::new(),
            }),
        };

        let value = serde_json::to_value(&component).unwrap();
        assert_eq!(value["class"], "Telemetry_Listener");
        assert_eq!(value["port"], 6514);

        let back: Component = serde_json::from_value(value).unwrap();
        assert_eq!(back, component);
        assert_eq!(back.class(), ComponentClass::Listener);
    }

    #[test]
    fn test_pull_mode_is_interval_zero() {
        let config = SystemPollerConfig {
            interval: 0,
            connection: Connection::default(),
            credentials: Credentials::default(),
            endpoint_list: None,
            data_opts: DataOpts::default(),
            system_name: "sys".to_string(),
        };
        assert!(config.is_pull_mode());
    }
}
