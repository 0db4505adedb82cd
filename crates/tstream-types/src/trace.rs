use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::TRACE_DIR;

pub const DEFAULT_TRACE_MAX_RECORDS: usize = 10;
pub const DEFAULT_TRACE_ENCODING: TraceEncoding = TraceEncoding::Utf8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceType {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEncoding {
    Utf8,
}

/// One trace destination (a bounded ring of records on disk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTarget {
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    pub path: String,
    pub max_records: usize,
    pub encoding: TraceEncoding,
}

/// Resolved trace settings for one component. Input and output targets
/// may coexist when the declaration uses the array form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpec {
    pub enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<TraceTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TraceTarget>,
}

impl TraceSpec {
    pub fn disabled() -> Self {
        Self {
            enable: false,
            input: None,
            output: None,
        }
    }

    /// Default output trace path: `/var/tmp/telemetry/<Class>.<id>`.
    /// Input traces live next to it with an `INPUT.` prefix.
    pub fn default_path(class_name: &str, component_id: &str, trace_type: TraceType) -> String {
        match trace_type {
            TraceType::Output => format!("{}/{}.{}", TRACE_DIR, class_name, component_id),
            TraceType::Input => format!("{}/INPUT.{}.{}", TRACE_DIR, class_name, component_id),
        }
    }

    /// Resolve the declaration-level `trace` value.
    ///
    /// Accepted forms: absent/false (disabled), `true` (default output
    /// path), a string (custom output path), or an array of
    /// `{type, path?}` objects where input and output may coexist.
    pub fn resolve(raw: Option<&Value>, class_name: &str, component_id: &str) -> Result<Self> {
        let raw = match raw {
            None | Some(Value::Bool(false)) => return Ok(Self::disabled()),
            Some(value) => value,
        };

        let target = |trace_type: TraceType, path: Option<String>| TraceTarget {
            trace_type,
            path: path
                .unwrap_or_else(|| Self::default_path(class_name, component_id, trace_type)),
            max_records: DEFAULT_TRACE_MAX_RECORDS,
            encoding: DEFAULT_TRACE_ENCODING,
        };

        match raw {
            Value::Bool(true) => Ok(Self {
                enable: true,
                input: None,
                output: Some(target(TraceType::Output, None)),
            }),
            Value::String(path) => Ok(Self {
                enable: true,
                input: None,
                output: Some(target(TraceType::Output, Some(path.clone()))),
            }),
            Value::Array(entries) => {
                let mut spec = Self {
                    enable: true,
                    input: None,
                    output: None,
                };
                for entry in entries {
                    let obj = entry.as_object().ok_or_else(|| {
                        Error::Validation(format!(
                            "{}: trace array entries must be objects",
                            component_id
                        ))
                    })?;
                    let trace_type = match obj.get("type").and_then(Value::as_str) {
                        Some("input") => TraceType::Input,
                        Some("output") | None => TraceType::Output,
                        Some(other) => {
                            return Err(Error::Validation(format!(
                                "{}: unknown trace type \"{}\"",
                                component_id, other
                            )));
                        }
                    };
                    let path = obj.get("path").and_then(Value::as_str).map(str::to_string);
                    let resolved = target(trace_type, path);
                    match trace_type {
                        TraceType::Input => spec.input = Some(resolved),
                        TraceType::Output => spec.output = Some(resolved),
                    }
                }
                Ok(spec)
            }
            other => Err(Error::Validation(format!(
                "{}: trace must be a boolean, string, or array, got {}",
                component_id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_and_false_disable_trace() {
        let spec = TraceSpec::resolve(None, "Telemetry_Listener", "ns::l").unwrap();
        assert!(!spec.enable);
        let spec = TraceSpec::resolve(Some(&json!(false)), "Telemetry_Listener", "ns::l").unwrap();
        assert!(!spec.enable);
        assert!(spec.input.is_none() && spec.output.is_none());
    }

    #[test]
    fn test_true_yields_default_output_path() {
        let spec =
            TraceSpec::resolve(Some(&json!(true)), "Telemetry_Listener", "ns::l").unwrap();
        let output = spec.output.unwrap();
        assert_eq!(output.path, "/var/tmp/telemetry/Telemetry_Listener.ns::l");
        assert_eq!(output.max_records, DEFAULT_TRACE_MAX_RECORDS);
        assert!(spec.input.is_none());
    }

    #[test]
    fn test_array_allows_input_and_output() {
        let raw = json!([
            {"type": "input"},
            {"type": "output", "path": "/tmp/custom"}
        ]);
        let spec = TraceSpec::resolve(Some(&raw), "Telemetry_Listener", "ns::l").unwrap();
        assert_eq!(
            spec.input.unwrap().path,
            "/var/tmp/telemetry/INPUT.Telemetry_Listener.ns::l"
        );
        assert_eq!(spec.output.unwrap().path, "/tmp/custom");
    }
}
