use std::sync::Arc;
use tracing::info;

use crate::config::{OverloadThresholds, ResourceLimits};
use crate::monitoring::{LiveCounters, MetricsSource, TotalUsage};

/// Admission control for create requests.
///
/// Two gates, both of which default to "accept": the static `limits`
/// (capacity already promised to machines on this node) and the live
/// `overload` thresholds. A configured ceiling is violated once the current
/// value reaches it (`current >= ceiling`). Unset ceilings, missing counters
/// and a silent collector never reject.
pub struct ResourceManager {
    limits: ResourceLimits,
    overload: OverloadThresholds,
    metrics: Arc<dyn MetricsSource>,
}

impl ResourceManager {
    pub fn new(
        limits: ResourceLimits,
        overload: OverloadThresholds,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            limits,
            overload,
            metrics,
        }
    }

    /// Whether this node should take another machine right now.
    pub async fn may_accept(&self) -> bool {
        let usage = self.metrics.total_limits().await;
        if !within_limits(&self.limits, usage.as_ref()) {
            return false;
        }

        let counters = self.metrics.total_metrics().await;
        within_overload(&self.overload, counters.as_ref())
    }
}

pub fn within_limits(limits: &ResourceLimits, usage: Option<&TotalUsage>) -> bool {
    let Some(usage) = usage else {
        return true;
    };

    let checks = [
        ("limits.memory", usage.memory, limits.memory),
        ("limits.storage", usage.storage, limits.storage),
    ];
    checks
        .into_iter()
        .all(|(name, current, ceiling)| !reached(name, current, ceiling))
}

pub fn within_overload(overload: &OverloadThresholds, counters: Option<&LiveCounters>) -> bool {
    let Some(counters) = counters else {
        return true;
    };

    for (name, ceiling) in overload.counters() {
        if reached(&format!("overload.{name}"), counters.counter(name), ceiling) {
            return false;
        }
    }

    for (name, ceiling) in overload.rctl.entries() {
        let current = counters.rctl.get(name).copied();
        if reached(&format!("overload.rctl.{name}"), current, ceiling) {
            return false;
        }
    }

    true
}

fn reached(name: &str, current: Option<f64>, ceiling: Option<u64>) -> bool {
    let (Some(current), Some(ceiling)) = (current, ceiling) else {
        return false;
    };

    let hit = current >= ceiling as f64;
    info!("{name}: {current} >= {ceiling} = {hit}");
    hit
}
