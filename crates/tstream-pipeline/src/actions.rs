use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::warn;

use tstream_types::{ActionKind, ActionSpec, Record};

/// Apply a user-ordered action list to a record, left to right.
///
/// Actions never fail the caller: a malformed action logs a warning and
/// the record continues from its pre-action state.
pub fn apply_actions(record: &mut Record, actions: &[ActionSpec]) {
    for action in actions {
        if !action.enable {
            continue;
        }
        let kind = match action.kind() {
            Ok(kind) => kind,
            Err(error) => {
                warn!(source_id = %record.source_id, %error, "skipping malformed action");
                continue;
            }
        };

        let before = record.clone();
        if let Err(error) = apply_one(record, &kind) {
            warn!(source_id = %record.source_id, %error, "action failed, keeping record unchanged");
            *record = before;
        }
    }
}

fn apply_one(record: &mut Record, kind: &ActionKind) -> anyhow::Result<()> {
    match kind {
        ActionKind::SetTag { tags, locations } => {
            apply_set_tag(record, tags, locations.as_ref());
            Ok(())
        }
        ActionKind::IncludeData { locations } => {
            apply_include(&mut record.data, locations);
            Ok(())
        }
        ActionKind::ExcludeData { locations } => {
            apply_exclude(&mut record.data, locations);
            Ok(())
        }
        ActionKind::JmesPath { expression } => apply_jmespath(record, expression),
    }
}

// --- setTag ---

fn apply_set_tag(record: &mut Record, tags: &BTreeMap<String, Value>, locations: Option<&Value>) {
    let context = TenantContext::infer(&record.data);

    match locations {
        None => {
            for (name, value) in tags {
                if let Some(text) = context.resolve(value) {
                    record.tags.insert(name.clone(), text);
                }
            }
        }
        Some(locations) => {
            set_tag_at_locations(&mut record.data, locations, tags, &context);
        }
    }
}

/// With locations, tags land inside each matched sub-object of the data
/// tree rather than on the record itself.
fn set_tag_at_locations(
    data: &mut Value,
    locations: &Value,
    tags: &BTreeMap<String, Value>,
    context: &TenantContext,
) {
    let Some(location_map) = locations.as_object() else {
        return;
    };
    let Some(data_map) = data.as_object_mut() else {
        return;
    };

    for (key, inner_locations) in location_map {
        let Some(target) = data_map.get_mut(key) else {
            continue;
        };
        match inner_locations {
            Value::Object(_) => {
                set_tag_at_locations(target, inner_locations, tags, context);
            }
            _ => {
                if let Some(target_map) = target.as_object_mut() {
                    for (name, value) in tags {
                        if let Some(text) = context.resolve(value) {
                            target_map.insert(name.clone(), Value::String(text));
                        }
                    }
                }
            }
        }
    }
}

/// Tenant / application inferred from the first fully-qualified object
/// path (`/tenant/application/...`) found in the data tree.
struct TenantContext {
    tenant: Option<String>,
    application: Option<String>,
}

fn qualified_path_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^/([^/]+)(?:/([^/]+))?").unwrap())
}

impl TenantContext {
    fn infer(data: &Value) -> Self {
        let mut context = Self {
            tenant: None,
            application: None,
        };
        context.scan(data, 0);
        context
    }

    fn scan(&mut self, data: &Value, depth: usize) {
        if self.tenant.is_some() || depth > 8 {
            return;
        }
        if let Some(map) = data.as_object() {
            for (key, inner) in map {
                if let Some(captures) = qualified_path_regex().captures(key) {
                    self.tenant = captures.get(1).map(|m| m.as_str().to_string());
                    self.application = captures.get(2).map(|m| m.as_str().to_string());
                    return;
                }
                self.scan(inner, depth + 1);
                if self.tenant.is_some() {
                    return;
                }
            }
        }
    }

    /// Substitute backtick placeholders; a tag whose placeholder has no
    /// value is dropped.
    fn resolve(&self, value: &Value) -> Option<String> {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match text.as_str() {
            "`T`" => self.tenant.clone(),
            "`A`" => self.application.clone(),
            _ => Some(text),
        }
    }
}

// --- includeData / excludeData ---

/// Keep only the sub-trees named by the location tree. A leaf `true`
/// keeps the whole sub-tree; nested objects recurse.
fn apply_include(data: &mut Value, locations: &Value) {
    let Some(location_map) = locations.as_object() else {
        return;
    };
    let Some(data_map) = data.as_object_mut() else {
        return;
    };

    data_map.retain(|key, _| location_map.contains_key(key));
    for (key, inner_locations) in location_map {
        if let Some(target) = data_map.get_mut(key)
            && inner_locations.is_object()
        {
            apply_include(target, inner_locations);
        }
    }
}

/// Remove the sub-trees named by the location tree.
fn apply_exclude(data: &mut Value, locations: &Value) {
    let Some(location_map) = locations.as_object() else {
        return;
    };
    let Some(data_map) = data.as_object_mut() else {
        return;
    };

    for (key, inner_locations) in location_map {
        match inner_locations {
            Value::Object(_) => {
                if let Some(target) = data_map.get_mut(key) {
                    apply_exclude(target, inner_locations);
                }
            }
            _ => {
                data_map.remove(key);
            }
        }
    }
}

// --- JMESPath ---

fn apply_jmespath(record: &mut Record, expression: &str) -> anyhow::Result<()> {
    let compiled = jmespath::compile(expression)
        .map_err(|e| anyhow::anyhow!("bad JMESPath expression \"{}\": {}", expression, e))?;
    let result = compiled
        .search(record.data.clone())
        .map_err(|e| anyhow::anyhow!("JMESPath search failed: {}", e))?;

    if !result.is_null() {
        record.data = serde_json::to_value(result.as_ref())?;
    }
    Ok(())
}
