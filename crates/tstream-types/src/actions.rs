use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

/// One entry of a user-ordered action list.
///
/// Exactly one of the marker fields (`setTag`, `includeData`,
/// `excludeData`, `JMESPath`) is present; `kind()` enforces that and
/// returns the typed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActionSpec {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_tag: Option<BTreeMap<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_data: Option<Value>,

    #[serde(rename = "JMESPath", skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<Value>,

    /// JMESPath expression; only valid together with `JMESPath`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Path tree restricting where `setTag`/`includeData`/`excludeData`
    /// apply. Leaves are `true`; inner nodes are nested objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Value>,
}

/// Typed view of an action entry
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    SetTag {
        tags: BTreeMap<String, Value>,
        locations: Option<Value>,
    },
    IncludeData {
        locations: Value,
    },
    ExcludeData {
        locations: Value,
    },
    JmesPath {
        expression: String,
    },
}

impl ActionSpec {
    pub fn set_tag(tags: BTreeMap<String, Value>) -> Self {
        Self {
            enable: true,
            set_tag: Some(tags),
            include_data: None,
            exclude_data: None,
            jmes_path: None,
            expression: None,
            locations: None,
        }
    }

    pub fn kind(&self) -> Result<ActionKind> {
        let markers = [
            self.set_tag.is_some(),
            self.include_data.is_some(),
            self.exclude_data.is_some(),
            self.jmes_path.is_some(),
        ];
        if markers.iter().filter(|m| **m).count() != 1 {
            return Err(Error::Validation(
                "an action must declare exactly one of setTag, includeData, excludeData, JMESPath"
                    .to_string(),
            ));
        }

        if let Some(tags) = &self.set_tag {
            return Ok(ActionKind::SetTag {
                tags: tags.clone(),
                locations: self.locations.clone(),
            });
        }
        if self.include_data.is_some() {
            let locations = self.locations.clone().ok_or_else(|| {
                Error::Validation("includeData requires locations".to_string())
            })?;
            return Ok(ActionKind::IncludeData { locations });
        }
        if self.exclude_data.is_some() {
            let locations = self.locations.clone().ok_or_else(|| {
                Error::Validation("excludeData requires locations".to_string())
            })?;
            return Ok(ActionKind::ExcludeData { locations });
        }

        let expression = self.expression.clone().ok_or_else(|| {
            Error::Validation("JMESPath action requires an expression".to_string())
        })?;
        Ok(ActionKind::JmesPath { expression })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enable_defaults_to_true() {
        let spec: ActionSpec =
            serde_json::from_value(json!({"setTag": {"tenant": "`T`"}})).unwrap();
        assert!(spec.enable);
        assert!(matches!(spec.kind().unwrap(), ActionKind::SetTag { .. }));
    }

    #[test]
    fn test_two_markers_rejected() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "setTag": {"a": 1},
            "includeData": {},
            "locations": {"system": true}
        }))
        .unwrap();
        assert!(spec.kind().is_err());
    }

    #[test]
    fn test_include_data_requires_locations() {
        let spec: ActionSpec = serde_json::from_value(json!({"includeData": {}})).unwrap();
        assert!(spec.kind().is_err());

        let spec: ActionSpec = serde_json::from_value(
            json!({"includeData": {}, "locations": {"system": true}}),
        )
        .unwrap();
        assert!(matches!(spec.kind().unwrap(), ActionKind::IncludeData { .. }));
    }

    #[test]
    fn test_jmespath_action_carries_expression() {
        let spec: ActionSpec = serde_json::from_value(
            json!({"JMESPath": {}, "expression": "system.hostname"}),
        )
        .unwrap();
        match spec.kind().unwrap() {
            ActionKind::JmesPath { expression } => assert_eq!(expression, "system.hostname"),
            other => panic!("expected JmesPath, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: std::result::Result<ActionSpec, _> =
            serde_json::from_value(json!({"setTag": {}, "bogus": 1}));
        assert!(result.is_err());
    }
}
