//! Shared fixtures for integration tests: canned declarations, record
//! builders, and temp directories for trace output.

use serde_json::{Value, json};
use tstream_types::Record;

/// Smallest valid declaration: no objects at all
pub fn empty_declaration() -> Value {
    json!({"class": "Telemetry"})
}

/// One listener plus one push consumer on the default namespace
pub fn listener_declaration(port: u16) -> Value {
    json!({
        "class": "Telemetry",
        "Test_Listener": {"class": "Telemetry_Listener", "port": port},
        "Test_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"}
    })
}

/// A system with an interval poller and a push consumer
pub fn poller_declaration(interval: u64) -> Value {
    json!({
        "class": "Telemetry",
        "Test_System": {
            "class": "Telemetry_System",
            "host": "localhost",
            "systemPoller": [{"interval": interval}]
        },
        "Test_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"}
    })
}

/// The pull-consumer topology from the resolver's reference scenario:
/// three pollers shared across three systems, one poller unattached.
pub fn pull_consumer_declaration() -> Value {
    json!({
        "class": "Telemetry",
        "Pull_Poller_1": {"class": "Telemetry_System_Poller", "interval": 0},
        "Pull_Poller_2": {"class": "Telemetry_System_Poller", "interval": 0},
        "Pull_Poller_3": {"class": "Telemetry_System_Poller", "interval": 0},
        "My_System": {"class": "Telemetry_System", "systemPoller": ["Pull_Poller_1"]},
        "My_System_2": {"class": "Telemetry_System", "systemPoller": ["Pull_Poller_2"]},
        "My_System_3": {
            "class": "Telemetry_System",
            "systemPoller": ["Pull_Poller_1", "Pull_Poller_2"]
        },
        "My_Pull_Consumer": {
            "class": "Telemetry_Pull_Consumer",
            "type": "Prometheus",
            "systemPoller": ["Pull_Poller_1", "Pull_Poller_2", "Pull_Poller_3"]
        }
    })
}

/// An event record as a listener would emit it
pub fn ltm_record(source_id: &str) -> Record {
    Record::new(
        "LTM",
        source_id,
        json!({"virtual_name": "/Common/app/vs1", "event_timestamp": "2024-01-01 00:00:00"}),
    )
    .with_raw("virtual_name=\"/Common/app/vs1\"")
}

/// Temp directory whose path doubles as a trace output root
pub struct TraceDir {
    dir: tempfile::TempDir,
}

impl TraceDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().expect("temp dir"),
        }
    }

    pub fn path(&self, file: &str) -> String {
        self.dir.path().join(file).to_string_lossy().into_owned()
    }
}

impl Default for TraceDir {
    fn default() -> Self {
        Self::new()
    }
}
