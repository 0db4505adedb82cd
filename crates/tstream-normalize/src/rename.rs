use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// How a matched key is rewritten
#[derive(Debug, Clone)]
pub enum RenameAction {
    /// Replace the whole key with a constant
    Constant(String),
    /// Globally replace the matched text with a character (or string)
    ReplaceCharacter(String),
    /// Replace the key with a capture group of the given regex
    Capture { pattern: String, group: usize },
}

/// One rename rule: `match_key` selects keys (substring by default,
/// whole-key when exact), `action` rewrites them. A rule-level
/// `exact_match` overrides the set-wide flag.
#[derive(Debug, Clone)]
pub struct RenameRule {
    pub match_key: String,
    pub action: RenameAction,
    pub exact_match: Option<bool>,
}

impl RenameRule {
    pub fn constant(match_key: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            match_key: match_key.into(),
            action: RenameAction::Constant(replacement.into()),
            exact_match: None,
        }
    }

    pub fn replace_character(match_key: impl Into<String>, with: impl Into<String>) -> Self {
        Self {
            match_key: match_key.into(),
            action: RenameAction::ReplaceCharacter(with.into()),
            exact_match: None,
        }
    }

    pub fn capture(match_key: impl Into<String>, pattern: impl Into<String>, group: usize) -> Self {
        Self {
            match_key: match_key.into(),
            action: RenameAction::Capture {
                pattern: pattern.into(),
                group,
            },
            exact_match: None,
        }
    }

    fn matches(&self, key: &str, exact_default: bool) -> bool {
        if self.exact_match.unwrap_or(exact_default) {
            key == self.match_key
        } else {
            key.contains(&self.match_key)
        }
    }

    fn apply(&self, key: &str) -> Result<String> {
        match &self.action {
            RenameAction::Constant(replacement) => Ok(replacement.clone()),
            RenameAction::ReplaceCharacter(with) => Ok(key.replace(&self.match_key, with)),
            RenameAction::Capture { pattern, group } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    Error::InvalidOptions(format!("bad rename pattern \"{}\": {}", pattern, e))
                })?;
                match regex.captures(key).and_then(|c| c.get(*group)) {
                    Some(capture) => Ok(capture.as_str().to_string()),
                    None => Ok(key.to_string()),
                }
            }
        }
    }
}

/// Rename object keys recursively. Rule sets are applied in order; the
/// first matching rule within a set wins for a given key.
pub fn rename_keys(data: &Value, rule_sets: &[Vec<RenameRule>], exact_default: bool) -> Result<Value> {
    let mut current = data.clone();
    for rules in rule_sets {
        current = rename_with_rules(&current, rules, exact_default)?;
    }
    Ok(current)
}

fn rename_with_rules(data: &Value, rules: &[RenameRule], exact_default: bool) -> Result<Value> {
    match data {
        Value::Object(map) => {
            let mut renamed = Map::with_capacity(map.len());
            for (key, inner) in map {
                let new_key = match rules.iter().find(|rule| rule.matches(key, exact_default)) {
                    Some(rule) => rule.apply(key)?,
                    None => key.clone(),
                };
                renamed.insert(new_key, rename_with_rules(inner, rules, exact_default)?);
            }
            Ok(Value::Object(renamed))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| rename_with_rules(item, rules, exact_default))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other.clone()),
    }
}

/// Rename keys matching `regex` by substituting `replacement` for the
/// matched portion, recursing through objects. Runs of periods produced
/// by the substitution are coalesced.
pub fn rename_keys_by_regex(data: &Value, regex: &Regex, replacement: &str) -> Value {
    match data {
        Value::Object(map) => {
            let mut renamed = Map::with_capacity(map.len());
            for (key, inner) in map {
                let new_key = if regex.is_match(key) {
                    reduce_periods(&regex.replace_all(key, replacement))
                } else {
                    key.clone()
                };
                renamed.insert(new_key, rename_keys_by_regex(inner, regex, replacement));
            }
            Value::Object(renamed)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| rename_keys_by_regex(item, regex, replacement))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn reduce_periods(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_period = false;
    for ch in key.chars() {
        if ch == '.' {
            if !last_was_period {
                out.push(ch);
            }
            last_was_period = true;
        } else {
            out.push(ch);
            last_was_period = false;
        }
    }
    out.trim_matches('.').to_string()
}

/// Key filter: include (substring match) or exclude (exact match),
/// mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

/// Drop object keys per the filter, recursing through nested objects.
/// Arrays are untouched.
pub fn filter_keys(data: &Value, filter: &KeyFilter) -> Result<Value> {
    match (&filter.include, &filter.exclude) {
        (Some(_), Some(_)) => Err(Error::InvalidOptions(
            "filter_keys: include and exclude are mutually exclusive".to_string(),
        )),
        (None, None) => Ok(data.clone()),
        _ => Ok(filter_value(data, filter)),
    }
}

fn filter_value(data: &Value, filter: &KeyFilter) -> Value {
    match data {
        Value::Object(map) => {
            let mut kept = Map::new();
            for (key, inner) in map {
                let keep = if let Some(include) = &filter.include {
                    include.iter().any(|item| key.contains(item.as_str()))
                } else if let Some(exclude) = &filter.exclude {
                    !exclude.iter().any(|item| key == item)
                } else {
                    true
                };
                if keep {
                    kept.insert(key.clone(), filter_value(inner, filter));
                }
            }
            Value::Object(kept)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constant_rename_replaces_whole_key() {
        let data = json!({"macAddress": "x", "other": 1});
        let rules = vec![vec![RenameRule::constant("macAddress", "mac")]];
        let out = rename_keys(&data, &rules, false).unwrap();
        assert_eq!(out, json!({"mac": "x", "other": 1}));
    }

    #[test]
    fn test_replace_character_is_global_within_key() {
        let data = json!({"a/b/c": 1});
        let rules = vec![vec![RenameRule::replace_character("/", ".")]];
        let out = rename_keys(&data, &rules, false).unwrap();
        assert_eq!(out, json!({"a.b.c": 1}));
    }

    #[test]
    fn test_capture_group_rename() {
        let data = json!({"name/Common/vs1": 1});
        let rules = vec![vec![RenameRule::capture("name/", "name\\/(.*)", 1)]];
        let out = rename_keys(&data, &rules, false).unwrap();
        assert_eq!(out, json!({"Common/vs1": 1}));
    }

    #[test]
    fn test_first_match_wins_within_a_set() {
        let data = json!({"abc": 1});
        let rules = vec![vec![
            RenameRule::constant("ab", "first"),
            RenameRule::constant("abc", "second"),
        ]];
        let out = rename_keys(&data, &rules, false).unwrap();
        assert_eq!(out, json!({"first": 1}));
    }

    #[test]
    fn test_rule_sets_apply_in_order_and_reversal_changes_result() {
        let data = json!({"key": 1});
        let forward = vec![
            vec![RenameRule::constant("key", "alpha")],
            vec![RenameRule::constant("alpha", "beta")],
        ];
        let reversed: Vec<Vec<RenameRule>> = forward.iter().rev().cloned().collect();

        let out_forward = rename_keys(&data, &forward, true).unwrap();
        let out_reversed = rename_keys(&data, &reversed, true).unwrap();
        assert_eq!(out_forward, json!({"beta": 1}));
        assert_eq!(out_reversed, json!({"alpha": 1}));
    }

    #[test]
    fn test_rule_level_exact_match_overrides_global() {
        let data = json!({"prefix_key": 1});
        let mut rule = RenameRule::constant("prefix", "hit");
        rule.exact_match = Some(true);
        let out = rename_keys(&data, &[vec![rule]], false).unwrap();
        // Exact match on "prefix" does not hit "prefix_key"
        assert_eq!(out, json!({"prefix_key": 1}));
    }

    #[test]
    fn test_rename_by_regex_coalesces_periods() {
        let data = json!({"sys..cpu...usage": 1});
        let regex = Regex::new("\\.{2,}").unwrap();
        let out = rename_keys_by_regex(&data, &regex, ".");
        assert_eq!(out, json!({"sys.cpu.usage": 1}));
    }

    #[test]
    fn test_filter_include_substring() {
        let data = json!({"cpuUsage": 1, "memUsage": 2, "uptime": 3});
        let filter = KeyFilter {
            include: Some(vec!["Usage".to_string()]),
            exclude: None,
        };
        let out = filter_keys(&data, &filter).unwrap();
        assert_eq!(out, json!({"cpuUsage": 1, "memUsage": 2}));
    }

    #[test]
    fn test_filter_exclude_exact() {
        let data = json!({"cpuUsage": 1, "cpu": 2});
        let filter = KeyFilter {
            include: None,
            exclude: Some(vec!["cpu".to_string()]),
        };
        let out = filter_keys(&data, &filter).unwrap();
        assert_eq!(out, json!({"cpuUsage": 1}));
    }

    #[test]
    fn test_filter_both_rejected_and_arrays_untouched() {
        let both = KeyFilter {
            include: Some(vec![]),
            exclude: Some(vec![]),
        };
        assert!(filter_keys(&json!({}), &both).is_err());

        let data = json!({"items": [{"cpu": 1}]});
        let filter = KeyFilter {
            include: None,
            exclude: Some(vec!["cpu".to_string()]),
        };
        // The array element keeps its keys
        let out = filter_keys(&data, &filter).unwrap();
        assert_eq!(out, json!({"items": [{"cpu": 1}]}));
    }
}
