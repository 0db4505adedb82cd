use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use tstream_normalize::{ArrayToMapOpts, array_to_map};
use tstream_pipeline::apply_actions;
use tstream_types::{EventCategory, Record, SecretVault, SystemPollerConfig};

use crate::client::HttpClientPool;

/// Management paths queried when a poller has no custom endpoint list.
/// The name of each entry keys its slice of the merged result.
const WELL_KNOWN_PATHS: &[(&str, &str)] = &[
    ("system", "/mgmt/tm/sys/global-settings"),
    ("version", "/mgmt/tm/sys/version"),
    ("memory", "/mgmt/tm/sys/memory"),
    ("virtualServers", "/mgmt/tm/ltm/virtual"),
    ("pools", "/mgmt/tm/ltm/pool"),
];

/// Extra stats path, skipped when `dataOpts.noTMStats` is set
const TMSTATS_PATH: (&str, &str) = ("tmstats", "/mgmt/tm/sys/tmstats");

/// One poll cycle: fetch, normalize, shape, apply actions.
pub async fn run_cycle(
    poller_id: &str,
    config: &SystemPollerConfig,
    client: &reqwest::Client,
    vault: &dyn SecretVault,
) -> Result<Record> {
    let base_url = HttpClientPool::base_url(&config.connection);
    let passphrase = match &config.credentials.passphrase {
        Some(secret) => Some(
            vault
                .decrypt(secret)
                .context("failed to decrypt poller passphrase")?,
        ),
        None => None,
    };

    let mut merged = Map::new();
    for (name, path) in endpoint_paths(config) {
        let url = format!("{}{}", base_url, path);
        let mut request = client.get(&url);
        if let Some(username) = &config.credentials.username {
            request = request.basic_auth(username, passphrase.as_deref());
        }

        match request.send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => {
                    let body: Value = response
                        .json()
                        .await
                        .with_context(|| format!("malformed JSON from {}", url))?;
                    merged.insert(name, normalize_endpoint_response(&body));
                }
                Err(error) => {
                    warn!(poller_id, %url, %error, "endpoint returned an error status");
                }
            },
            Err(error) => {
                warn!(poller_id, %url, %error, "endpoint request failed");
            }
        }
    }

    debug!(poller_id, endpoints = merged.len(), "poll cycle fetched");
    Ok(build_system_info_record(poller_id, config, Value::Object(merged)))
}

fn endpoint_paths(config: &SystemPollerConfig) -> Vec<(String, String)> {
    match &config.endpoint_list {
        Some(endpoints) => endpoints
            .iter()
            .map(|endpoint| (endpoint.name.clone(), endpoint.path.clone()))
            .collect(),
        None => {
            let mut paths: Vec<(String, String)> = WELL_KNOWN_PATHS
                .iter()
                .map(|(name, path)| (name.to_string(), path.to_string()))
                .collect();
            if !config.data_opts.no_tm_stats {
                paths.push((TMSTATS_PATH.0.to_string(), TMSTATS_PATH.1.to_string()));
            }
            paths
        }
    }
}

/// Collection responses carry an `items` array; key it by fully
/// qualified name. Anything else passes through untouched.
pub fn normalize_endpoint_response(body: &Value) -> Value {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return body.clone();
    };

    let key = if items.iter().all(|item| item.get("fullPath").is_some()) {
        "fullPath"
    } else {
        "name"
    };
    match array_to_map(
        &Value::Array(items.clone()),
        &[key],
        &ArrayToMapOpts {
            key_name_prefix: None,
            skip_when_key_missing: true,
        },
    ) {
        Ok(mapped) => mapped,
        Err(_) => body.clone(),
    }
}

/// Attach device context and produce the `systemInfo` record.
pub fn build_system_info_record(
    poller_id: &str,
    config: &SystemPollerConfig,
    mut data: Value,
) -> Record {
    let hostname = data
        .get("system")
        .and_then(|system| system.get("hostname"))
        .and_then(Value::as_str)
        .unwrap_or(&config.connection.host)
        .to_string();

    if let Some(map) = data.as_object_mut() {
        let system = map
            .entry("system".to_string())
            .or_insert_with(|| json!({}));
        if let Some(system_map) = system.as_object_mut() {
            system_map.insert("hostname".to_string(), Value::String(hostname));
            system_map.insert(
                "pollTimestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            system_map.insert(
                "systemName".to_string(),
                Value::String(config.system_name.clone()),
            );
        }
    }

    let mut record = Record::new(EventCategory::SystemInfo.as_str(), poller_id, data);
    record.merge_tags(&config.data_opts.tags);
    apply_actions(&mut record, &config.data_opts.actions);
    record
}
