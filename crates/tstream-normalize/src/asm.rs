use chrono::{DateTime, Utc};
use serde_json::Value;

/// Summarize ASM policy modification state across all policies.
pub fn asm_state(policies: &Value) -> &'static str {
    let any_modified = policies
        .as_array()
        .map(|items| {
            items
                .iter()
                .any(|policy| policy.get("isModified").and_then(Value::as_bool) == Some(true))
        })
        .unwrap_or(false);
    if any_modified {
        "Pending Policy Changes"
    } else {
        "Policies Consistent"
    }
}

/// Latest parseable `versionDatetime` across all policies as ISO-8601
/// with millisecond precision. Empty or unparseable input yields an
/// empty string.
pub fn asm_last_change(policies: &Value) -> String {
    let latest: Option<DateTime<Utc>> = policies
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|policy| policy.get("versionDatetime").and_then(Value::as_str))
        .filter_map(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .max();

    match latest {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => String::new(),
    }
}
