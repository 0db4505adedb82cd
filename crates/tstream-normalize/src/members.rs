use serde_json::{Map, Value};

/// Join pool/WideIP member stats with item-side metadata.
///
/// `stats` maps selfLink-shaped keys (ending in
/// `/members/<vs>:<server>/stats`) to stat objects; `items` is the
/// config-side array whose entries carry `name` plus metadata. The
/// output maps the decoded member name to its stats merged with the
/// matching item's metadata.
pub fn restructure_member_stats(stats: &Value, items: &Value) -> Value {
    let Some(stat_map) = stats.as_object() else {
        return stats.clone();
    };
    let item_list = items.as_array();

    let mut members = Map::new();
    for (link, stat) in stat_map {
        let Some(member_name) = member_name_from_link(link) else {
            continue;
        };

        let mut merged = match stat {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("stats".to_string(), other.clone());
                map
            }
        };

        if let Some(item) = item_list.and_then(|list| {
            list.iter().find(|item| {
                item.get("name").and_then(Value::as_str) == Some(member_name.as_str())
            })
        }) && let Some(item_map) = item.as_object()
        {
            for (key, value) in item_map {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        members.insert(member_name, Value::Object(merged));
    }
    Value::Object(members)
}

/// Decode `.../members/~Common~m:80/stats` into `/Common/m:80`
fn member_name_from_link(link: &str) -> Option<String> {
    let (_, tail) = link.split_once("/members/")?;
    let encoded = tail.strip_suffix("/stats").unwrap_or(tail);
    let decoded = encoded.replace('~', "/");
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_stats_joined_with_items() {
        let stats = json!({
            "https://localhost/mgmt/tm/ltm/pool/~Common~web/members/~Common~server1:80/stats": {
                "serverside.curConns": 7
            }
        });
        let items = json!([
            {"name": "/Common/server1:80", "address": "192.0.2.1", "monitor": "http"}
        ]);

        let out = restructure_member_stats(&stats, &items);
        let member = &out["/Common/server1:80"];
        assert_eq!(member["serverside.curConns"], 7);
        assert_eq!(member["address"], "192.0.2.1");
        assert_eq!(member["monitor"], "http");
    }

    #[test]
    fn test_stats_win_over_item_metadata_on_collision() {
        let stats = json!({
            "/pool/~Common~p/members/~Common~m:443/stats": {"monitor": "from-stats"}
        });
        let items = json!([{"name": "/Common/m:443", "monitor": "from-item"}]);

        let out = restructure_member_stats(&stats, &items);
        assert_eq!(out["/Common/m:443"]["monitor"], "from-stats");
    }

    #[test]
    fn test_links_without_member_fragment_are_skipped() {
        let stats = json!({"/pool/~Common~p/stats": {"x": 1}});
        let out = restructure_member_stats(&stats, &json!([]));
        assert_eq!(out, json!({}));
    }
}
