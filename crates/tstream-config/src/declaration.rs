use serde_json::{Map, Value};
use tstream_types::{DEFAULT_NAMESPACE, Error, Result, json_type_name};

/// Class names recognized in a declaration
pub mod classes {
    pub const TELEMETRY: &str = "Telemetry";
    pub const CONTROLS: &str = "Controls";
    pub const NAMESPACE: &str = "Telemetry_Namespace";
    pub const SYSTEM: &str = "Telemetry_System";
    pub const SYSTEM_POLLER: &str = "Telemetry_System_Poller";
    pub const LISTENER: &str = "Telemetry_Listener";
    pub const CONSUMER: &str = "Telemetry_Consumer";
    pub const PULL_CONSUMER: &str = "Telemetry_Pull_Consumer";
    pub const ENDPOINTS: &str = "Telemetry_Endpoints";
    pub const IHEALTH_POLLER: &str = "Telemetry_iHealth_Poller";

    /// Classes allowed as named objects inside a namespace (and, plus
    /// Controls and Namespace itself, at the root)
    pub const NAMESPACED: &[&str] = &[
        SYSTEM,
        SYSTEM_POLLER,
        LISTENER,
        CONSUMER,
        PULL_CONSUMER,
        ENDPOINTS,
        IHEALTH_POLLER,
    ];
}

/// Root keys that are not named objects
const ROOT_CONTROL_KEYS: &[&str] = &["class", "schemaVersion", "$schema"];

/// Global controls parsed from the root `Controls` object
#[derive(Debug, Clone, PartialEq)]
pub struct Controls {
    pub log_level: String,
    pub debug: bool,
    pub memory_threshold_percent: u64,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug: false,
            memory_threshold_percent: 90,
        }
    }
}

impl Controls {
    fn parse(body: &Map<String, Value>) -> Result<Self> {
        let mut controls = Self::default();
        for (key, value) in body {
            match key.as_str() {
                "class" => {}
                "logLevel" => {
                    controls.log_level = value
                        .as_str()
                        .ok_or_else(|| {
                            Error::Validation("Controls.logLevel must be a string".to_string())
                        })?
                        .to_string();
                }
                "debug" => {
                    controls.debug = value.as_bool().ok_or_else(|| {
                        Error::Validation("Controls.debug must be a boolean".to_string())
                    })?;
                }
                "memoryThresholdPercent" => {
                    controls.memory_threshold_percent = value.as_u64().ok_or_else(|| {
                        Error::Validation(
                            "Controls.memoryThresholdPercent must be a number".to_string(),
                        )
                    })?;
                }
                other => {
                    return Err(Error::Validation(format!(
                        "Controls: additionalProperties not allowed (\"{}\")",
                        other
                    )));
                }
            }
        }
        Ok(controls)
    }
}

/// One named declaration object, scoped to its namespace
#[derive(Debug, Clone)]
pub struct RawObject {
    pub namespace: String,
    pub name: String,
    pub class: String,
    pub body: Map<String, Value>,
}

/// The user declaration after the structural walk: controls plus the
/// flat list of named objects with namespaces applied.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub controls: Controls,
    pub objects: Vec<RawObject>,
}

impl Declaration {
    /// Walk the raw tree. Rejects non-`Telemetry` roots, unknown
    /// top-level keys, unknown classes, and nested namespaces.
    pub fn parse(raw: &Value) -> Result<Self> {
        let root = raw.as_object().ok_or_else(|| {
            Error::Validation(format!(
                "declaration must be an object, got {}",
                json_type_name(raw)
            ))
        })?;

        match root.get("class").and_then(Value::as_str) {
            Some(classes::TELEMETRY) => {}
            Some(other) => {
                return Err(Error::Validation(format!(
                    "declaration class must be \"Telemetry\", got \"{}\"",
                    other
                )));
            }
            None => {
                return Err(Error::Validation(
                    "declaration is missing the \"class\" property".to_string(),
                ));
            }
        }

        let mut controls = Controls::default();
        let mut objects = Vec::new();

        for (key, value) in root {
            if ROOT_CONTROL_KEYS.contains(&key.as_str()) {
                continue;
            }
            let body = value.as_object().ok_or_else(|| {
                Error::Validation(format!(
                    "additionalProperties not allowed (\"{}\" is {})",
                    key,
                    json_type_name(value)
                ))
            })?;
            let class = object_class(key, body)?;

            match class {
                classes::CONTROLS => {
                    controls = Controls::parse(body)?;
                }
                classes::NAMESPACE => {
                    collect_namespace(key, body, &mut objects)?;
                }
                _ => {
                    objects.push(named_object(DEFAULT_NAMESPACE, key, class, body)?);
                }
            }
        }

        Ok(Self { controls, objects })
    }
}

fn object_class<'a>(name: &str, body: &'a Map<String, Value>) -> Result<&'a str> {
    body.get("class")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::Validation(format!(
                "additionalProperties not allowed (\"{}\" has no class)",
                name
            ))
        })
}

fn named_object(
    namespace: &str,
    name: &str,
    class: &str,
    body: &Map<String, Value>,
) -> Result<RawObject> {
    if !classes::NAMESPACED.contains(&class) {
        return Err(Error::Validation(format!(
            "{}: unknown class \"{}\"",
            name, class
        )));
    }
    Ok(RawObject {
        namespace: namespace.to_string(),
        name: name.to_string(),
        class: class.to_string(),
        body: body.clone(),
    })
}

fn collect_namespace(
    namespace: &str,
    body: &Map<String, Value>,
    objects: &mut Vec<RawObject>,
) -> Result<()> {
    if namespace == DEFAULT_NAMESPACE {
        return Err(Error::Validation(format!(
            "namespace name \"{}\" is reserved",
            namespace
        )));
    }
    for (key, value) in body {
        if key == "class" {
            continue;
        }
        let inner = value.as_object().ok_or_else(|| {
            Error::Validation(format!(
                "{}: additionalProperties not allowed (\"{}\" is {})",
                namespace,
                key,
                json_type_name(value)
            ))
        })?;
        let class = object_class(key, inner)?;
        if class == classes::NAMESPACE || class == classes::CONTROLS {
            return Err(Error::Validation(format!(
                "{}: class \"{}\" is not allowed inside a namespace",
                namespace, class
            )));
        }
        objects.push(named_object(namespace, key, class, inner)?);
    }
    Ok(())
}
