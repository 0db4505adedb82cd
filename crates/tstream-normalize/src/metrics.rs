use serde_json::{Map, Number, Value};

use crate::convert::MISSING_DATA;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PercentOpts {
    /// Report `100 - percent` instead
    pub invert: bool,
    /// Sum numeric leaves of nested objects before dividing
    pub sum_nested: bool,
}

/// `round(partial / total * 100)` from two keys of an object. A zero
/// total yields `0`.
pub fn percent_from_keys(
    data: &Value,
    partial_key: &str,
    total_key: &str,
    opts: &PercentOpts,
) -> Result<Value> {
    let partial = numeric_at(data, partial_key, opts.sum_nested)?;
    let total = numeric_at(data, total_key, opts.sum_nested)?;

    let mut percent = if total == 0.0 {
        0.0
    } else {
        (partial / total * 100.0).round()
    };
    if opts.invert {
        percent = 100.0 - percent;
    }
    Ok(Value::Number(Number::from(percent as i64)))
}

fn numeric_at(data: &Value, key: &str, sum_nested: bool) -> Result<f64> {
    let value = data.get(key).ok_or_else(|| {
        Error::InvalidInput(format!("percent_from_keys: missing key \"{}\"", key))
    })?;
    match value {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Object(_) if sum_nested => Ok(sum_numeric_leaves(value)),
        other => Err(Error::InvalidInput(format!(
            "percent_from_keys: \"{}\" is not numeric ({})",
            key, other
        ))),
    }
}

fn sum_numeric_leaves(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Object(map) => map.values().map(sum_numeric_leaves).sum(),
        Value::Array(items) => items.iter().map(sum_numeric_leaves).sum(),
        _ => 0.0,
    }
}

/// Split duplicate-key arrays produced by the device's JSON encoder into
/// separate entries. An inner key containing `Packets` or `Bits` names
/// the split entry; otherwise entries are numbered.
pub fn throughput_pre_process(data: &Value) -> Value {
    let Some(map) = data.as_object() else {
        return data.clone();
    };

    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::Array(duplicates) => {
                for (index, entry) in duplicates.iter().enumerate() {
                    let suffix = entry.as_object().and_then(|inner| {
                        inner.keys().find_map(|k| {
                            if k.contains("Packets") {
                                Some(" Packets")
                            } else if k.contains("Bits") {
                                Some(" Bits")
                            } else {
                                None
                            }
                        })
                    });
                    let name = match suffix {
                        Some(suffix) => format!("{}{}", key, suffix),
                        None if index == 0 => key.clone(),
                        None => format!("{}{}", key, index),
                    };
                    out.insert(name, entry.clone());
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    Value::Object(out)
}

/// Restrict throughput entries to the `average`/`current`/`max` value
/// keys (lowercased, coerced to float) and camelCase the outer keys,
/// numbering collisions.
pub fn throughput_post_process(data: &Value) -> Value {
    let Some(map) = data.as_object() else {
        return data.clone();
    };

    let mut out = Map::new();
    for (key, value) in map {
        let mut entry = Map::new();
        if let Some(inner) = value.as_object() {
            for (inner_key, inner_value) in inner {
                let lowered = inner_key.to_lowercase();
                if matches!(lowered.as_str(), "average" | "current" | "max") {
                    entry.insert(lowered, Value::from(coerce_float(inner_value)));
                }
            }
        }

        let mut name = camel_case(key);
        if out.contains_key(&name) {
            let mut counter = 1;
            while out.contains_key(&format!("{}{}", name, counter)) {
                counter += 1;
            }
            name = format!("{}{}", name, counter);
        }
        out.insert(name, Value::Object(entry));
    }
    Value::Object(out)
}

fn coerce_float(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn camel_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (index, word) in text.split_whitespace().enumerate() {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            if index == 0 {
                out.extend(first.to_lowercase());
            } else {
                out.extend(first.to_uppercase());
            }
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Pull per-CPU entries out of a host-info tree. Anything missing on
/// the way yields the `"missing data"` sentinel.
pub fn restructure_host_cpu_info(data: &Value, path: &[&str]) -> Value {
    let mut current = data;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::String(MISSING_DATA.to_string()),
        }
    }
    current.clone()
}
