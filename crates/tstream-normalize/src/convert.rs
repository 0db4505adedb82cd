use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

/// Sentinel returned when a lookup lands on nothing
pub const MISSING_DATA: &str = "missing data";

#[derive(Debug, Clone, Default)]
pub struct ArrayToMapOpts {
    /// Prefix prepended to every generated key
    pub key_name_prefix: Option<String>,
    /// Return the input unchanged when an entry lacks the key
    pub skip_when_key_missing: bool,
}

/// Convert an array of objects into a map keyed by the value(s) under
/// `keys`. Multiple key names are joined with `_`.
pub fn array_to_map(data: &Value, keys: &[&str], opts: &ArrayToMapOpts) -> Result<Value> {
    let items = data.as_array().ok_or_else(|| {
        Error::InvalidInput(format!("array_to_map requires an array, got {}", data))
    })?;

    let mut map = Map::new();
    for item in items {
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            match item.get(key) {
                Some(Value::String(s)) => parts.push(s.clone()),
                Some(other) if !other.is_null() => parts.push(other.to_string()),
                _ => {
                    if opts.skip_when_key_missing {
                        return Ok(data.clone());
                    }
                    return Err(Error::InvalidInput(format!(
                        "array_to_map: entry is missing key \"{}\"",
                        key
                    )));
                }
            }
        }
        let mut name = parts.join("_");
        if let Some(prefix) = &opts.key_name_prefix {
            name = format!("{}{}", prefix, name);
        }
        map.insert(name, item.clone());
    }
    Ok(Value::Object(map))
}

/// Uppercase a MAC address and left-pad each octet to two hex digits.
/// Strings without a `:` pass through untouched.
pub fn normalize_mac(mac: &str) -> String {
    if !mac.contains(':') {
        return mac.to_string();
    }
    mac.split(':')
        .map(|octet| {
            if octet.len() == 1 {
                format!("0{}", octet.to_uppercase())
            } else {
                octet.to_uppercase()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse CSV text: first line is headers, remaining lines are rows,
/// empty lines are skipped. Cells beyond the header count are dropped.
pub fn csv_to_json(text: &str) -> Value {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let headers: Vec<&str> = match lines.next() {
        Some(header_line) => header_line.split(',').map(str::trim).collect(),
        None => return json!([]),
    };

    let mut rows = Vec::new();
    for line in lines {
        let mut row = Map::new();
        for (header, cell) in headers.iter().zip(line.split(',')) {
            row.insert(header.to_string(), Value::String(cell.trim().to_string()));
        }
        rows.push(Value::Object(row));
    }
    Value::Array(rows)
}

/// Walk `path` through nested objects; anything missing on the way
/// yields the `"missing data"` sentinel.
pub fn get_value(data: &Value, path: &[&str]) -> Value {
    let mut current = data;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::String(MISSING_DATA.to_string()),
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_padded_and_uppercased() {
        assert_eq!(normalize_mac("a:b:cc:d:ee:f"), "0A:0B:CC:0D:EE:0F");
    }

    #[test]
    fn test_mac_without_colons_passes_through() {
        assert_eq!(normalize_mac("no-colons"), "no-colons");
    }

    #[test]
    fn test_array_to_map_by_single_key() {
        let data = json!([{"n": "a", "v": 1}, {"n": "b", "v": 2}]);
        let mapped = array_to_map(&data, &["n"], &ArrayToMapOpts::default()).unwrap();
        assert_eq!(
            mapped,
            json!({"a": {"n": "a", "v": 1}, "b": {"n": "b", "v": 2}})
        );
    }

    #[test]
    fn test_array_to_map_joins_multiple_keys_and_prefixes() {
        let data = json!([{"part": "Common", "name": "vs1"}]);
        let opts = ArrayToMapOpts {
            key_name_prefix: Some("vs_".to_string()),
            skip_when_key_missing: false,
        };
        let mapped = array_to_map(&data, &["part", "name"], &opts).unwrap();
        assert!(mapped.get("vs_Common_vs1").is_some());
    }

    #[test]
    fn test_array_to_map_rejects_non_array() {
        assert!(array_to_map(&json!({"a": 1}), &["a"], &ArrayToMapOpts::default()).is_err());
    }

    #[test]
    fn test_array_to_map_skip_when_key_missing() {
        let data = json!([{"other": 1}]);
        let opts = ArrayToMapOpts {
            key_name_prefix: None,
            skip_when_key_missing: true,
        };
        assert_eq!(array_to_map(&data, &["n"], &opts).unwrap(), data);
        assert!(array_to_map(&data, &["n"], &ArrayToMapOpts::default()).is_err());
    }

    #[test]
    fn test_csv_to_json_skips_empty_lines() {
        let parsed = csv_to_json("name,value\n\na,1\nb,2\n");
        assert_eq!(
            parsed,
            json!([{"name": "a", "value": "1"}, {"name": "b", "value": "2"}])
        );
    }

    #[test]
    fn test_csv_round_trips_with_stable_header_order() {
        let headers = ["name", "value"];
        let original = "name,value\na,1\nb,2";
        let parsed = csv_to_json(original);

        // Emit back with the chosen header order and reparse
        let mut emitted = headers.join(",");
        for row in parsed.as_array().unwrap() {
            let cells: Vec<&str> = headers
                .iter()
                .map(|h| row.get(*h).and_then(Value::as_str).unwrap())
                .collect();
            emitted.push('\n');
            emitted.push_str(&cells.join(","));
        }
        assert_eq!(emitted, original);
        assert_eq!(csv_to_json(&emitted), parsed);
    }

    #[test]
    fn test_get_value_missing_sentinel() {
        let data = json!({"a": {"b": 1}});
        assert_eq!(get_value(&data, &["a", "b"]), json!(1));
        assert_eq!(get_value(&data, &["a", "x"]), json!(MISSING_DATA));
    }
}
