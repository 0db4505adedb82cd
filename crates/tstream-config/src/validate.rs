use serde_json::{Map, Value};
use tstream_types::{ActionSpec, Error, Result, json_type_name};

/// Reject keys outside the allowed set, naming the first offender.
pub fn check_allowed_keys(
    context: &str,
    body: &Map<String, Value>,
    allowed: &[&str],
) -> Result<()> {
    for key in body.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(Error::Validation(format!(
                "{}: additionalProperties not allowed (\"{}\")",
                context, key
            )));
        }
    }
    Ok(())
}

pub fn opt_str(context: &str, body: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::Validation(format!(
            "{}.{} must be a string, got {}",
            context,
            key,
            json_type_name(other)
        ))),
    }
}

pub fn req_str(context: &str, body: &Map<String, Value>, key: &str) -> Result<String> {
    opt_str(context, body, key)?.ok_or_else(|| {
        Error::Validation(format!("{}.{} is required", context, key))
    })
}

pub fn opt_u64(context: &str, body: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match body.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            Error::Validation(format!(
                "{}.{} must be a non-negative number, got {}",
                context,
                key,
                json_type_name(value)
            ))
        }),
    }
}

pub fn opt_bool(context: &str, body: &Map<String, Value>, key: &str) -> Result<Option<bool>> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(Error::Validation(format!(
            "{}.{} must be a boolean, got {}",
            context,
            key,
            json_type_name(other)
        ))),
    }
}

pub fn opt_port(context: &str, body: &Map<String, Value>, key: &str) -> Result<Option<u16>> {
    match opt_u64(context, body, key)? {
        None => Ok(None),
        Some(port) => u16::try_from(port).map(Some).map_err(|_| {
            Error::Validation(format!("{}.{}: {} is not a valid port", context, key, port))
        }),
    }
}

/// Parse and validate an `actions` array; every entry must resolve to a
/// well-formed action kind.
pub fn parse_actions(context: &str, body: &Map<String, Value>) -> Result<Vec<ActionSpec>> {
    let raw = match body.get("actions") {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(Error::Validation(format!(
                "{}.actions must be an array, got {}",
                context,
                json_type_name(other)
            )));
        }
    };

    let mut actions = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        let spec: ActionSpec = serde_json::from_value(item.clone()).map_err(|e| {
            Error::Validation(format!("{}.actions[{}]: {}", context, index, e))
        })?;
        spec.kind()
            .map_err(|e| Error::Validation(format!("{}.actions[{}]: {}", context, index, e)))?;
        actions.push(spec);
    }
    Ok(actions)
}

/// Parse a string-valued tag map (`tag` on listeners, `dataOpts.tags`
/// on pollers); non-string values are stringified.
pub fn parse_tag_map(
    context: &str,
    body: &Map<String, Value>,
    key: &str,
) -> Result<std::collections::BTreeMap<String, String>> {
    let mut tags = std::collections::BTreeMap::new();
    let raw = match body.get(key) {
        None => return Ok(tags),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(Error::Validation(format!(
                "{}.{} must be an object, got {}",
                context,
                key,
                json_type_name(other)
            )));
        }
    };
    for (name, value) in raw {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        tags.insert(name.clone(), text);
    }
    Ok(tags)
}
