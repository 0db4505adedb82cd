use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::warn;

use tstream_pipeline::apply_actions;
use tstream_types::{EventCategory, ListenerConfig, Record};

fn kv_quoted_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"([\w.-]+)="([^"]*)""#).unwrap())
}

fn kv_bare_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"([\w.-]+)=([^",\s]+)"#).unwrap())
}

fn syslog_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^<\d+>").unwrap())
}

/// Infer the event category from the raw frame text.
///
/// The heuristics mirror what the device modules actually emit; order
/// matters, most specific first.
pub fn classify_event(raw: &str) -> EventCategory {
    if raw.contains("attack_type=\"") || raw.contains("policy_apply_date=\"") {
        EventCategory::Asm
    } else if raw.contains("Access_Profile") {
        EventCategory::Apm
    } else if raw.contains("EOCTimestamp=\"") {
        EventCategory::Avr
    } else if raw.contains("virtual_name=\"") {
        EventCategory::Ltm
    } else if syslog_regex().is_match(raw) {
        EventCategory::Syslog
    } else {
        EventCategory::Event
    }
}

/// Parse `key="value"` / `key=value` pairs into a flat object; text
/// without any pair is wrapped as `{data: <raw>}`.
pub fn parse_fields(raw: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for captures in kv_quoted_regex().captures_iter(raw) {
        fields.insert(
            captures[1].to_string(),
            Value::String(captures[2].to_string()),
        );
    }
    for captures in kv_bare_regex().captures_iter(raw) {
        let key = captures[1].to_string();
        fields
            .entry(key)
            .or_insert_with(|| Value::String(captures[2].to_string()));
    }

    if fields.is_empty() {
        fields.insert("data".to_string(), Value::String(raw.to_string()));
    }
    fields
}

/// Run one frame through a listener: match filter, category inference,
/// field parsing, tag merge, actions. `None` means the frame was
/// filtered out.
pub fn process_frame(
    listener_id: &str,
    config: &ListenerConfig,
    match_regex: Option<&Regex>,
    raw: &str,
) -> Option<Record> {
    if let Some(regex) = match_regex
        && !regex.is_match(raw)
    {
        return None;
    }

    let category = classify_event(raw);
    let fields = parse_fields(raw);

    let mut record = Record::new(category.as_str(), listener_id, Value::Object(fields))
        .with_raw(raw.to_string());
    record.merge_tags(&config.tag);
    apply_actions(&mut record, &config.actions);
    Some(record)
}

/// Compile a listener's match pattern; the resolver already validated
/// it, so a failure here only happens on hand-built configs.
pub fn compile_match(listener_id: &str, config: &ListenerConfig) -> Option<Regex> {
    let pattern = config.match_pattern.as_deref()?;
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(error) => {
            warn!(listener_id, %error, "ignoring unusable match pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn listener_config() -> ListenerConfig {
        ListenerConfig {
            port: 6514,
            match_pattern: None,
            tag: BTreeMap::new(),
            actions: Vec::new(),
        }
    }

    #[test]
    fn test_virtual_name_frame_is_ltm() {
        assert_eq!(classify_event("virtual_name=\"/Common/vs\""), EventCategory::Ltm);
        assert_eq!(classify_event("hello world"), EventCategory::Event);
        assert_eq!(
            classify_event("<134>Jul 6 22:37:15 bigip1 info"),
            EventCategory::Syslog
        );
        assert_eq!(
            classify_event("attack_type=\"SQL Injection\""),
            EventCategory::Asm
        );
    }

    #[test]
    fn test_parse_quoted_and_bare_pairs() {
        let fields = parse_fields("virtual_name=\"test\",count=3");
        assert_eq!(fields.get("virtual_name"), Some(&json!("test")));
        assert_eq!(fields.get("count"), Some(&json!("3")));
    }

    #[test]
    fn test_unstructured_text_wrapped_as_data() {
        let fields = parse_fields("plain syslog text");
        assert_eq!(fields.get("data"), Some(&json!("plain syslog text")));
    }

    #[test]
    fn test_process_frame_scenario() {
        let config = listener_config();
        let record =
            process_frame("ns::listener1", &config, None, "virtual_name=\"test\"").unwrap();
        assert_eq!(record.telemetry_event_category, "LTM");
        assert_eq!(record.data["virtual_name"], "test");
        assert_eq!(record.source_id, "ns::listener1");
    }

    #[test]
    fn test_match_filter_drops_non_matching() {
        let mut config = listener_config();
        config.match_pattern = Some("important".to_string());
        let regex = compile_match("ns::l", &config);

        assert!(process_frame("ns::l", &config, regex.as_ref(), "noise").is_none());
        assert!(process_frame("ns::l", &config, regex.as_ref(), "important event").is_some());
    }

    #[test]
    fn test_tags_merged_into_record() {
        let mut config = listener_config();
        config.tag.insert("facility".to_string(), "lab".to_string());
        let record = process_frame("ns::l", &config, None, "anything").unwrap();
        assert_eq!(record.tags.get("facility").map(String::as_str), Some("lab"));
    }

    #[test]
    fn test_listener_actions_applied() {
        let mut config = listener_config();
        config.actions = vec![
            serde_json::from_value(json!({"setTag": {"env": "dev"}})).unwrap(),
        ];
        let record = process_frame("ns::l", &config, None, "x=1").unwrap();
        assert_eq!(record.tags.get("env").map(String::as_str), Some("dev"));
    }
}
