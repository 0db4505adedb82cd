use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Well-known event categories inferred from raw frames or set by pollers.
///
/// Categories are open-ended (consumers may see arbitrary strings), so this
/// enum only names the ones the agent itself assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Local traffic management events (`virtual_name="..."` frames)
    Ltm,
    /// Application security module events
    Asm,
    /// Access policy events
    Apm,
    /// Application visibility events
    Avr,
    /// Periodic system metrics snapshot
    SystemInfo,
    /// Raw syslog-shaped text
    Syslog,
    /// Anything that matched no heuristic
    Event,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Ltm => "LTM",
            EventCategory::Asm => "ASM",
            EventCategory::Apm => "APM",
            EventCategory::Avr => "AVR",
            EventCategory::SystemInfo => "systemInfo",
            EventCategory::Syslog => "syslog",
            EventCategory::Event => "event",
        }
    }
}

/// The canonical datum flowing through the pipeline.
///
/// `telemetry_event_category` is always set; the empty string is reserved
/// for unclassified records and never produced by the agent itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub telemetry_event_category: String,

    pub data: Value,

    /// Raw bytes of the originating frame, kept for input tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_raw_data: Option<String>,

    /// Component id of the producer (listener or poller); routing key
    pub source_id: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Record {
    pub fn new(category: impl Into<String>, source_id: impl Into<String>, data: Value) -> Self {
        Self {
            telemetry_event_category: category.into(),
            data,
            original_raw_data: None,
            source_id: source_id.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.original_raw_data = Some(raw.into());
        self
    }

    /// Merge a tag map into the record, later values winning
    pub fn merge_tags(&mut self, tags: &BTreeMap<String, String>) {
        for (k, v) in tags {
            self.tags.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_serializes_with_camel_case_keys() {
        let record = Record::new(
            EventCategory::Ltm.as_str(),
            "f5telemetry_default::My_Listener",
            json!({"virtual_name": "/Common/app"}),
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["telemetryEventCategory"], "LTM");
        assert_eq!(value["sourceId"], "f5telemetry_default::My_Listener");
        assert!(value.get("originalRawData").is_none());
    }

    #[test]
    fn test_merge_tags_overwrites_existing() {
        let mut record = Record::new("event", "src", json!({}));
        record.tags.insert("env".to_string(), "dev".to_string());

        let mut incoming = BTreeMap::new();
        incoming.insert("env".to_string(), "prod".to_string());
        incoming.insert("site".to_string(), "east".to_string());
        record.merge_tags(&incoming);

        assert_eq!(record.tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(record.tags.get("site").map(String::as_str), Some("east"));
    }
}
