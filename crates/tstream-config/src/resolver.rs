use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tstream_types::{
    Component, ComponentClass, ComponentKind, Connection, ConsumerConfig, Credentials, DataOpts,
    Endpoint, Error, ListenerConfig, Mappings, Protocol, PullConsumerConfig,
    PullConsumerGroupConfig, Result, Secret, SystemPollerConfig, TraceSpec,
    DEFAULT_EVENT_LISTENER_PORT, component_id, poller_id,
};

use crate::declaration::{Controls, Declaration, RawObject, classes};
use crate::validate::{
    check_allowed_keys, opt_bool, opt_port, opt_str, opt_u64, parse_actions, parse_tag_map,
    req_str,
};

const DEFAULT_POLL_INTERVAL: u64 = 300;
const DEFAULT_DEVICE_PORT: u16 = 8100;

const SYSTEM_KEYS: &[&str] = &[
    "class", "enable", "trace", "host", "port", "protocol", "allowSelfSignedCert", "username",
    "passphrase", "systemPoller", "iHealthPoller",
];
const POLLER_KEYS: &[&str] = &[
    "class", "enable", "trace", "interval", "endpointList", "actions", "tags", "noTMStats",
    "host", "port", "protocol", "allowSelfSignedCert", "username", "passphrase",
];
const LISTENER_KEYS: &[&str] = &["class", "enable", "trace", "port", "match", "tag", "actions"];
const PULL_CONSUMER_KEYS: &[&str] = &["class", "enable", "trace", "type", "systemPoller"];
const ENDPOINTS_KEYS: &[&str] = &["class", "enable", "items", "basePath"];
const CONSUMER_GENERIC_KEYS: &[&str] = &["class", "enable", "trace", "type", "actions"];

/// Output of the resolver: the flat component set plus the routing table
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub controls: Controls,
    pub components: Vec<Component>,
    pub mappings: Mappings,
}

impl ResolvedConfig {
    pub fn empty() -> Self {
        Self {
            controls: Controls::default(),
            components: Vec::new(),
            mappings: Mappings::new(),
        }
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }
}

/// Validate a declaration and expand it into components and mappings.
///
/// `previous` is the currently running set; it is consulted only to
/// reject class changes for an already-existing object id.
pub fn resolve(raw: &Value, previous: Option<&ResolvedConfig>) -> Result<ResolvedConfig> {
    let decl = Declaration::parse(raw)?;

    let mut components = Vec::new();
    let mut mappings = Mappings::new();

    for namespace in namespaces_in_order(&decl.objects) {
        let objects: Vec<&RawObject> = decl
            .objects
            .iter()
            .filter(|o| o.namespace == namespace)
            .collect();
        NamespaceExpander::new(&namespace, &objects)?
            .expand(&mut components, &mut mappings)?;
    }

    check_unique_ids(&components)?;
    if let Some(previous) = previous {
        check_class_stability(&components, previous)?;
    }

    // Deterministic output: identical declarations resolve to identical
    // component and mapping bytes.
    components.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(ResolvedConfig {
        controls: decl.controls,
        components,
        mappings,
    })
}

fn namespaces_in_order(objects: &[RawObject]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for object in objects {
        if seen.insert(object.namespace.clone()) {
            ordered.push(object.namespace.clone());
        }
    }
    ordered
}

fn check_unique_ids(components: &[Component]) -> Result<()> {
    let mut seen = HashSet::new();
    for component in components {
        if !seen.insert(component.id.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate component id \"{}\"",
                component.id
            )));
        }
    }
    Ok(())
}

fn check_class_stability(components: &[Component], previous: &ResolvedConfig) -> Result<()> {
    let existing: HashMap<&str, ComponentClass> = previous
        .components
        .iter()
        .map(|c| (c.id.as_str(), c.class()))
        .collect();
    for component in components {
        if let Some(old_class) = existing.get(component.id.as_str())
            && *old_class != component.class()
        {
            return Err(Error::Validation(format!(
                "{}: cannot override class {} with {}",
                component.id,
                old_class.as_str(),
                component.class().as_str()
            )));
        }
    }
    Ok(())
}

/// A `systemPoller` array element: a named reference or an inline body
enum PollerRef {
    Named(String),
    Inline(Map<String, Value>),
}

fn parse_poller_refs(context: &str, value: &Value) -> Result<Vec<PollerRef>> {
    let to_ref = |element: &Value| -> Result<PollerRef> {
        match element {
            Value::String(name) => Ok(PollerRef::Named(name.clone())),
            Value::Object(body) => Ok(PollerRef::Inline(body.clone())),
            other => Err(Error::Validation(format!(
                "{}.systemPoller entries must be strings or objects, got {}",
                context,
                tstream_types::json_type_name(other)
            ))),
        }
    };
    match value {
        Value::Array(items) => items.iter().map(to_ref).collect(),
        single => Ok(vec![to_ref(single)?]),
    }
}

struct EndpointsObject {
    /// Items with `basePath` already joined into each path
    items: Vec<Endpoint>,
}

struct NamespaceExpander<'a> {
    namespace: &'a str,
    systems: Vec<&'a RawObject>,
    pollers: Vec<&'a RawObject>,
    listeners: Vec<&'a RawObject>,
    consumers: Vec<&'a RawObject>,
    pull_consumers: Vec<&'a RawObject>,
    endpoints: BTreeMap<String, EndpointsObject>,

    /// Names of standalone pollers referenced by any pull consumer;
    /// such pollers default to pull mode when no interval is declared
    pull_referenced: HashSet<String>,

    /// Counter behind synthetic `SystemPoller_<n>` names; advances per
    /// inline poller in declaration order, so names are deterministic
    /// from position
    anonymous_counter: usize,
}

impl<'a> NamespaceExpander<'a> {
    fn new(namespace: &'a str, objects: &[&'a RawObject]) -> Result<Self> {
        let mut expander = Self {
            namespace,
            systems: Vec::new(),
            pollers: Vec::new(),
            listeners: Vec::new(),
            consumers: Vec::new(),
            pull_consumers: Vec::new(),
            endpoints: BTreeMap::new(),
            pull_referenced: HashSet::new(),
            anonymous_counter: 0,
        };

        for object in objects {
            match object.class.as_str() {
                classes::SYSTEM => expander.systems.push(object),
                classes::SYSTEM_POLLER => expander.pollers.push(object),
                classes::LISTENER => expander.listeners.push(object),
                classes::CONSUMER => expander.consumers.push(object),
                classes::PULL_CONSUMER => expander.pull_consumers.push(object),
                classes::ENDPOINTS => {
                    let parsed = parse_endpoints_object(&object.name, &object.body)?;
                    expander.endpoints.insert(object.name.clone(), parsed);
                }
                // Accepted for declaration compatibility; no worker is
                // scheduled for iHealth polling.
                classes::IHEALTH_POLLER => {}
                other => {
                    return Err(Error::Validation(format!(
                        "{}: unexpected class \"{}\"",
                        object.name, other
                    )));
                }
            }
        }

        for pull_consumer in &expander.pull_consumers {
            if let Some(value) = pull_consumer.body.get("systemPoller") {
                for poller_ref in parse_poller_refs(&pull_consumer.name, value)? {
                    if let PollerRef::Named(name) = poller_ref {
                        expander.pull_referenced.insert(name);
                    }
                }
            }
        }

        Ok(expander)
    }

    fn expand(mut self, components: &mut Vec<Component>, mappings: &mut Mappings) -> Result<()> {
        // Poller components in creation order; pull groups and mappings
        // both depend on it. Entries: (poller name, index into components).
        let mut poller_index: Vec<(String, usize)> = Vec::new();
        let mut attached: HashSet<String> = HashSet::new();
        let start = components.len();

        let systems = std::mem::take(&mut self.systems);
        for system in &systems {
            self.expand_system(system, components, &mut poller_index, &mut attached)?;
        }

        let pollers = std::mem::take(&mut self.pollers);
        for poller in &pollers {
            if attached.contains(&poller.name) {
                continue;
            }
            // Unattached standalone poller: synthesize a system whose
            // name equals the poller name, host defaulting to localhost.
            let component = self.build_poller_component(
                &poller.name,
                &poller.name,
                &poller.body,
                &parse_connection(&poller.name, &poller.body)?,
                &parse_credentials(&poller.name, &poller.body)?,
                opt_bool(&poller.name, &poller.body, "enable")?.unwrap_or(true),
                None,
            )?;
            poller_index.push((poller.name.clone(), components.len()));
            components.push(component);
        }

        let listeners = std::mem::take(&mut self.listeners);
        for listener in &listeners {
            components.push(self.expand_listener(listener)?);
        }

        let consumers = std::mem::take(&mut self.consumers);
        for consumer in &consumers {
            components.push(self.expand_consumer(consumer)?);
        }

        let pull_consumers = std::mem::take(&mut self.pull_consumers);
        for pull_consumer in &pull_consumers {
            self.expand_pull_consumer(pull_consumer, components, &mut poller_index, mappings)?;
        }

        self.build_push_mappings(&components[start..], mappings);
        Ok(())
    }

    fn expand_system(
        &mut self,
        system: &RawObject,
        components: &mut Vec<Component>,
        poller_index: &mut Vec<(String, usize)>,
        attached: &mut HashSet<String>,
    ) -> Result<()> {
        check_allowed_keys(&system.name, &system.body, SYSTEM_KEYS)?;
        let enable = opt_bool(&system.name, &system.body, "enable")?.unwrap_or(true);
        let connection = parse_connection(&system.name, &system.body)?;
        let credentials = parse_credentials(&system.name, &system.body)?;
        let system_trace = system.body.get("trace");

        let Some(poller_value) = system.body.get("systemPoller") else {
            return Ok(());
        };

        for poller_ref in parse_poller_refs(&system.name, poller_value)? {
            let (poller_name, poller_body) = match &poller_ref {
                PollerRef::Named(name) => {
                    let declared = self
                        .pollers
                        .iter()
                        .find(|p| &p.name == name)
                        .ok_or_else(|| {
                            Error::Validation(format!(
                                "{}: systemPoller references unknown poller \"{}\"",
                                system.name, name
                            ))
                        })?;
                    attached.insert(name.clone());
                    (name.clone(), declared.body.clone())
                }
                PollerRef::Inline(body) => (self.next_anonymous_name(), body.clone()),
            };

            let component = self.build_poller_component(
                &system.name,
                &poller_name,
                &poller_body,
                &connection,
                &credentials,
                enable,
                system_trace,
            )?;
            poller_index.push((poller_name, components.len()));
            components.push(component);
        }
        Ok(())
    }

    fn next_anonymous_name(&mut self) -> String {
        self.anonymous_counter += 1;
        format!("SystemPoller_{}", self.anonymous_counter)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_poller_component(
        &self,
        system_name: &str,
        poller_name: &str,
        body: &Map<String, Value>,
        connection: &Connection,
        credentials: &Credentials,
        system_enable: bool,
        system_trace: Option<&Value>,
    ) -> Result<Component> {
        check_allowed_keys(poller_name, body, POLLER_KEYS)?;

        let id = poller_id(self.namespace, system_name, poller_name);
        let own_enable = opt_bool(poller_name, body, "enable")?.unwrap_or(true);

        let interval = match opt_u64(poller_name, body, "interval")? {
            Some(interval) => interval,
            // Pull-referenced pollers are pull-mode unless told otherwise
            None if self.pull_referenced.contains(poller_name) => 0,
            None => DEFAULT_POLL_INTERVAL,
        };

        let endpoint_list = match body.get("endpointList") {
            Some(value) => Some(self.resolve_endpoint_list(poller_name, value)?),
            None => None,
        };

        let data_opts = DataOpts {
            actions: parse_actions(poller_name, body)?,
            tags: parse_tag_map(poller_name, body, "tags")?,
            no_tm_stats: opt_bool(poller_name, body, "noTMStats")?.unwrap_or(false),
        };

        let trace_value = body.get("trace").or(system_trace);
        let trace = TraceSpec::resolve(trace_value, ComponentClass::SystemPoller.as_str(), &id)?;

        Ok(Component {
            id,
            namespace: self.namespace.to_string(),
            name: poller_name.to_string(),
            enable: system_enable && own_enable,
            trace,
            skip_update: false,
            kind: ComponentKind::SystemPoller(SystemPollerConfig {
                interval,
                connection: connection.clone(),
                credentials: credentials.clone(),
                endpoint_list,
                data_opts,
                system_name: system_name.to_string(),
            }),
        })
    }

    fn resolve_endpoint_list(&self, context: &str, value: &Value) -> Result<Vec<Endpoint>> {
        let mut resolved = Vec::new();
        let elements: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };

        for element in elements {
            match element {
                Value::String(reference) => {
                    self.resolve_endpoints_reference(context, reference, &mut resolved)?;
                }
                Value::Object(body) if body.contains_key("items") => {
                    let inline = parse_endpoints_object(context, body)?;
                    resolved.extend(inline.items);
                }
                Value::Object(body) => {
                    // Inline single endpoint
                    let name = req_str(context, body, "name")?;
                    let path = req_str(context, body, "path")?;
                    let enable = opt_bool(context, body, "enable")?.unwrap_or(true);
                    resolved.push(Endpoint {
                        name,
                        path: normalize_endpoint_path("", &path),
                        enable,
                    });
                }
                other => {
                    return Err(Error::Validation(format!(
                        "{}.endpointList entries must be strings or objects, got {}",
                        context,
                        tstream_types::json_type_name(other)
                    )));
                }
            }
        }

        resolved.retain(|endpoint| endpoint.enable);
        Ok(resolved)
    }

    fn resolve_endpoints_reference(
        &self,
        context: &str,
        reference: &str,
        out: &mut Vec<Endpoint>,
    ) -> Result<()> {
        let (endpoints_name, item_name) = match reference.split_once('/') {
            Some((name, item)) => (name, Some(item)),
            None => (reference, None),
        };
        let endpoints = self.endpoints.get(endpoints_name).ok_or_else(|| {
            Error::Validation(format!(
                "{}: endpointList references unknown Telemetry_Endpoints \"{}\"",
                context, endpoints_name
            ))
        })?;

        match item_name {
            None => out.extend(endpoints.items.iter().cloned()),
            Some(item) => {
                let found = endpoints.items.iter().find(|e| e.name == item).ok_or_else(|| {
                    Error::Validation(format!(
                        "{}: endpoint \"{}\" not found in \"{}\"",
                        context, item, endpoints_name
                    ))
                })?;
                out.push(found.clone());
            }
        }
        Ok(())
    }

    fn expand_listener(&self, listener: &RawObject) -> Result<Component> {
        check_allowed_keys(&listener.name, &listener.body, LISTENER_KEYS)?;
        let id = component_id(self.namespace, &listener.name);

        let match_pattern = opt_str(&listener.name, &listener.body, "match")?;
        if let Some(pattern) = &match_pattern {
            Regex::new(pattern).map_err(|e| {
                Error::Validation(format!("{}.match is not a valid regex: {}", listener.name, e))
            })?;
        }

        Ok(Component {
            id: id.clone(),
            namespace: self.namespace.to_string(),
            name: listener.name.clone(),
            enable: opt_bool(&listener.name, &listener.body, "enable")?.unwrap_or(true),
            trace: TraceSpec::resolve(
                listener.body.get("trace"),
                ComponentClass::Listener.as_str(),
                &id,
            )?,
            skip_update: false,
            kind: ComponentKind::Listener(ListenerConfig {
                port: opt_port(&listener.name, &listener.body, "port")?
                    .unwrap_or(DEFAULT_EVENT_LISTENER_PORT),
                match_pattern,
                tag: parse_tag_map(&listener.name, &listener.body, "tag")?,
                actions: parse_actions(&listener.name, &listener.body)?,
            }),
        })
    }

    fn expand_consumer(&self, consumer: &RawObject) -> Result<Component> {
        let id = component_id(self.namespace, &consumer.name);
        let consumer_type = req_str(&consumer.name, &consumer.body, "type")?;

        let mut config = Map::new();
        for (key, value) in &consumer.body {
            if !CONSUMER_GENERIC_KEYS.contains(&key.as_str()) {
                config.insert(key.clone(), value.clone());
            }
        }

        Ok(Component {
            id: id.clone(),
            namespace: self.namespace.to_string(),
            name: consumer.name.clone(),
            enable: opt_bool(&consumer.name, &consumer.body, "enable")?.unwrap_or(true),
            trace: TraceSpec::resolve(
                consumer.body.get("trace"),
                ComponentClass::Consumer.as_str(),
                &id,
            )?,
            skip_update: false,
            kind: ComponentKind::Consumer(ConsumerConfig {
                consumer_type,
                config: Value::Object(config),
                actions: parse_actions(&consumer.name, &consumer.body)?,
            }),
        })
    }

    fn expand_pull_consumer(
        &mut self,
        pull_consumer: &RawObject,
        components: &mut Vec<Component>,
        poller_index: &mut Vec<(String, usize)>,
        mappings: &mut Mappings,
    ) -> Result<()> {
        check_allowed_keys(&pull_consumer.name, &pull_consumer.body, PULL_CONSUMER_KEYS)?;
        let consumer_id = component_id(self.namespace, &pull_consumer.name);
        let consumer_type = req_str(&pull_consumer.name, &pull_consumer.body, "type")?;
        let enable = opt_bool(&pull_consumer.name, &pull_consumer.body, "enable")?.unwrap_or(true);

        let poller_value = pull_consumer.body.get("systemPoller").ok_or_else(|| {
            Error::Validation(format!("{}.systemPoller is required", pull_consumer.name))
        })?;

        let mut raw_references = Vec::new();
        let mut group_pollers = Vec::new();
        for poller_ref in parse_poller_refs(&pull_consumer.name, poller_value)? {
            match poller_ref {
                PollerRef::Named(name) => {
                    let matched: Vec<&(String, usize)> = poller_index
                        .iter()
                        .filter(|(poller_name, _)| poller_name == &name)
                        .collect();
                    if matched.is_empty() {
                        return Err(Error::Validation(format!(
                            "{}: systemPoller references unknown poller \"{}\"",
                            pull_consumer.name, name
                        )));
                    }
                    for (_, index) in matched {
                        group_pollers.push(components[*index].id.clone());
                    }
                    raw_references.push(name);
                }
                PollerRef::Inline(body) => {
                    let name = self.next_anonymous_name();
                    self.pull_referenced.insert(name.clone());
                    let component = self.build_poller_component(
                        &name,
                        &name,
                        &body,
                        &parse_connection(&pull_consumer.name, &body)?,
                        &parse_credentials(&pull_consumer.name, &body)?,
                        true,
                        None,
                    )?;
                    group_pollers.push(component.id.clone());
                    poller_index.push((name.clone(), components.len()));
                    components.push(component);
                    raw_references.push(name);
                }
            }
        }

        // Ordered de-duplication, first occurrence wins
        let mut seen = HashSet::new();
        group_pollers.retain(|id| seen.insert(id.clone()));

        for poller_component_id in &group_pollers {
            let component = components
                .iter()
                .find(|c| &c.id == poller_component_id)
                .expect("group references expanded poller");
            let config = component
                .as_system_poller()
                .expect("group references poller component");
            if !config.is_pull_mode() {
                return Err(Error::Validation(format!(
                    "{}: poller \"{}\" must have interval 0 to serve a pull consumer",
                    pull_consumer.name, poller_component_id
                )));
            }
        }

        components.push(Component {
            id: consumer_id.clone(),
            namespace: self.namespace.to_string(),
            name: pull_consumer.name.clone(),
            enable,
            trace: TraceSpec::resolve(
                pull_consumer.body.get("trace"),
                ComponentClass::PullConsumer.as_str(),
                &consumer_id,
            )?,
            skip_update: false,
            kind: ComponentKind::PullConsumer(PullConsumerConfig {
                consumer_type,
                system_pollers: raw_references,
            }),
        });

        let group_name = format!(
            "Telemetry_Pull_Consumer_System_Poller_Group_{}",
            pull_consumer.name
        );
        let group_id = component_id(self.namespace, &group_name);
        components.push(Component {
            id: group_id.clone(),
            namespace: self.namespace.to_string(),
            name: group_name,
            enable,
            trace: TraceSpec::disabled(),
            skip_update: false,
            kind: ComponentKind::PullConsumerGroup(PullConsumerGroupConfig {
                pull_consumer: consumer_id.clone(),
                system_pollers: group_pollers,
            }),
        });

        if enable {
            mappings.insert(group_id, vec![consumer_id]);
        }
        Ok(())
    }

    /// Push routing: every enabled listener and every enabled
    /// interval-driven poller in a namespace feeds every enabled push
    /// consumer in that namespace.
    fn build_push_mappings(&self, namespace_components: &[Component], mappings: &mut Mappings) {
        let mut consumer_ids: Vec<String> = namespace_components
            .iter()
            .filter(|c| c.enable && c.class() == ComponentClass::Consumer)
            .map(|c| c.id.clone())
            .collect();
        consumer_ids.sort();
        if consumer_ids.is_empty() {
            return;
        }

        for component in namespace_components {
            if !component.enable {
                continue;
            }
            let is_producer = match &component.kind {
                ComponentKind::Listener(_) => true,
                ComponentKind::SystemPoller(config) => !config.is_pull_mode(),
                _ => false,
            };
            if is_producer {
                mappings.insert(component.id.clone(), consumer_ids.clone());
            }
        }
    }
}

fn parse_connection(context: &str, body: &Map<String, Value>) -> Result<Connection> {
    let protocol = match opt_str(context, body, "protocol")?.as_deref() {
        None | Some("http") => Protocol::Http,
        Some("https") => Protocol::Https,
        Some(other) => {
            return Err(Error::Validation(format!(
                "{}.protocol must be \"http\" or \"https\", got \"{}\"",
                context, other
            )));
        }
    };
    Ok(Connection {
        host: opt_str(context, body, "host")?.unwrap_or_else(|| "localhost".to_string()),
        port: opt_port(context, body, "port")?.unwrap_or(DEFAULT_DEVICE_PORT),
        protocol,
        allow_self_signed_cert: opt_bool(context, body, "allowSelfSignedCert")?.unwrap_or(false),
    })
}

fn parse_credentials(context: &str, body: &Map<String, Value>) -> Result<Credentials> {
    let passphrase = match body.get("passphrase") {
        None => None,
        Some(value) => Some(serde_json::from_value::<Secret>(value.clone()).map_err(|_| {
            Error::Validation(format!(
                "{}.passphrase must be a string or a cipherText object",
                context
            ))
        })?),
    };
    Ok(Credentials {
        username: opt_str(context, body, "username")?,
        passphrase,
    })
}

fn parse_endpoints_object(name: &str, body: &Map<String, Value>) -> Result<EndpointsObject> {
    check_allowed_keys(name, body, ENDPOINTS_KEYS)?;
    let base_path = opt_str(name, body, "basePath")?.unwrap_or_default();

    let raw_items = match body.get("items") {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(Error::Validation(format!(
                "{}.items must be an object, got {}",
                name,
                tstream_types::json_type_name(other)
            )));
        }
        None => {
            return Err(Error::Validation(format!("{}.items is required", name)));
        }
    };

    let mut items = Vec::new();
    for (item_name, item_value) in raw_items {
        let item_body = item_value.as_object().ok_or_else(|| {
            Error::Validation(format!("{}.items.{} must be an object", name, item_name))
        })?;
        let path = req_str(&format!("{}.items.{}", name, item_name), item_body, "path")?;
        items.push(Endpoint {
            name: opt_str(name, item_body, "name")?.unwrap_or_else(|| item_name.clone()),
            path: normalize_endpoint_path(&base_path, &path),
            enable: opt_bool(name, item_body, "enable")?.unwrap_or(true),
        });
    }
    Ok(EndpointsObject { items })
}

fn normalize_endpoint_path(base_path: &str, path: &str) -> String {
    let mut joined = String::new();
    if !base_path.is_empty() {
        joined.push('/');
        joined.push_str(base_path.trim_matches('/'));
    }
    joined.push('/');
    joined.push_str(path.trim_start_matches('/'));
    joined
}
