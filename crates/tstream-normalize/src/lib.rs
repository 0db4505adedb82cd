// Normalizer library: pure `(data, opts) -> data` transforms applied
// after raw retrieval, composable in any order.

mod asm;
mod convert;
mod error;
mod members;
mod metrics;
mod rename;

pub use asm::{asm_last_change, asm_state};
pub use convert::{ArrayToMapOpts, MISSING_DATA, array_to_map, csv_to_json, get_value, normalize_mac};
pub use error::{Error, Result};
pub use members::restructure_member_stats;
pub use metrics::{
    PercentOpts, percent_from_keys, restructure_host_cpu_info, throughput_post_process,
    throughput_pre_process,
};
pub use rename::{
    KeyFilter, RenameAction, RenameRule, filter_keys, rename_keys, rename_keys_by_regex,
};
