//! Named counters sampled from nodes and engines.

use std::collections::BTreeMap;

/// Counter name to value, ordered for stable reporting.
pub type NamedStats = BTreeMap<String, f64>;

/// Merges `other` into `into`, prefixing each key with `prefix.`.
pub fn merge_prefixed(into: &mut NamedStats, prefix: &str, other: NamedStats) {
    for (key, value) in other {
        into.insert(format!("{prefix}.{key}"), value);
    }
}

/// Logs every counter at info level, one line each.
pub fn log_stats(name: &str, stats: &NamedStats) {
    for (key, value) in stats {
        log::info!("{name}: {key} = {value}");
    }
}
