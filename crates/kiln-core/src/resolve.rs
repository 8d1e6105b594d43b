//! Configuration resolution.
//!
//! Merges *platform defaults → tenant config → worker config* into one
//! [`EffectiveConfig`] every time a worker is loaded. The resolver is pure;
//! identical inputs always produce an identical output.
//!
//! Merge rules per field:
//!
//! | Field | Rule |
//! |---|---|
//! | `env` | three-way shallow merge, later keys overwrite |
//! | `compatibility_date` | first defined of worker → tenant → defaults → fallback |
//! | `compatibility_flags` | defaults ++ tenant ++ worker, deduplicated, first-seen order |
//! | `limits` | per-sub-field shallow merge; absent everywhere stays absent |
//! | `tails` | defaults ++ tenant ++ worker, duplicates preserved |
//! | `global_outbound` | first defined of worker → tenant → defaults |

use std::collections::BTreeMap;

use crate::types::{ConfigBundle, EffectiveConfig, Limits};

/// Compatibility date used when no level defines one.
pub const FALLBACK_COMPATIBILITY_DATE: &str = "2026-01-24";

/// Resolve the effective config for a worker load.
///
/// `worker` is absent for tenant-level resolution (e.g. ephemeral runs
/// without ad-hoc overrides).
pub fn resolve(
    defaults: &ConfigBundle,
    tenant: &ConfigBundle,
    worker: Option<&ConfigBundle>,
) -> EffectiveConfig {
    let mut env: BTreeMap<String, String> = defaults.env.clone();
    env.extend(tenant.env.clone());
    if let Some(worker) = worker {
        env.extend(worker.env.clone());
    }

    let compatibility_date = worker
        .and_then(|w| w.compatibility_date.clone())
        .or_else(|| tenant.compatibility_date.clone())
        .or_else(|| defaults.compatibility_date.clone())
        .unwrap_or_else(|| FALLBACK_COMPATIBILITY_DATE.to_string());

    let mut compatibility_flags: Vec<String> = Vec::new();
    let flag_sources = [
        Some(&defaults.compatibility_flags),
        Some(&tenant.compatibility_flags),
        worker.map(|w| &w.compatibility_flags),
    ];
    for source in flag_sources.into_iter().flatten() {
        for flag in source {
            if !compatibility_flags.contains(flag) {
                compatibility_flags.push(flag.clone());
            }
        }
    }

    let limits = merge_limits(
        defaults.limits.as_ref(),
        tenant.limits.as_ref(),
        worker.and_then(|w| w.limits.as_ref()),
    );

    let mut tails: Vec<String> = Vec::new();
    tails.extend(defaults.tails.iter().cloned());
    tails.extend(tenant.tails.iter().cloned());
    if let Some(worker) = worker {
        tails.extend(worker.tails.iter().cloned());
    }

    let global_outbound = worker
        .and_then(|w| w.global_outbound.clone())
        .or_else(|| tenant.global_outbound.clone())
        .or_else(|| defaults.global_outbound.clone());

    EffectiveConfig {
        env,
        compatibility_date,
        compatibility_flags,
        limits,
        tails,
        global_outbound,
    }
}

/// Per-sub-field merge; `None` everywhere yields `None`.
fn merge_limits(
    defaults: Option<&Limits>,
    tenant: Option<&Limits>,
    worker: Option<&Limits>,
) -> Option<Limits> {
    if defaults.is_none() && tenant.is_none() && worker.is_none() {
        return None;
    }
    let pick_u64 = |f: fn(&Limits) -> Option<u64>| {
        worker
            .and_then(f)
            .or_else(|| tenant.and_then(f))
            .or_else(|| defaults.and_then(f))
    };
    Some(Limits {
        cpu_ms: pick_u64(|l| l.cpu_ms),
        subrequests: pick_u64(|l| l.subrequests),
    })
}
