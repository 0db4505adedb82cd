mod util;

pub mod actions;
pub mod component;
pub mod error;
pub mod record;
pub mod secrets;
pub mod trace;

pub use actions::{ActionKind, ActionSpec};
pub use component::{
    Component, ComponentClass, ComponentKind, Connection, ConsumerConfig, Credentials, DataOpts,
    Endpoint, ListenerConfig, Mappings, Protocol, PullConsumerConfig, PullConsumerGroupConfig,
    SystemPollerConfig, component_id, poller_id,
};
pub use error::{Error, Result};
pub use record::{EventCategory, Record};
pub use secrets::{SECRET_MASK, Secret, SecretVault, mask_secrets};
pub use trace::{TraceEncoding, TraceSpec, TraceTarget, TraceType};
pub use util::*;

/// Namespace applied to objects declared outside any `Telemetry_Namespace`.
pub const DEFAULT_NAMESPACE: &str = "f5telemetry_default";

/// Separator between namespace / system / poller segments of a component id.
pub const ID_SEPARATOR: &str = "::";

/// Well-known default port for event listeners.
pub const DEFAULT_EVENT_LISTENER_PORT: u16 = 6514;

/// Root directory for trace output files.
pub const TRACE_DIR: &str = "/var/tmp/telemetry";
