/*
* Resource Metrics
* ----------------
*
* The numbers themselves come from probes that live next to the VM scripts and
* print JSON on stdout:
*
*   get-total-limits.py   {"memory": <bytes>, "storage": <bytes>}
*                         what the machines on this node have been given
*   get-total-metrics.py  {"memory-usage", "rx", "tx", "storage-usage",
*                          "rctl": {"pcpu": .., "readbps": .., ...}}
*                         live counters summed over every machine
*   get-metrics.py        the same counters, per machine
*
* An empty stdout means "nothing to report" (no machines yet, probe not
* installed, ...). The admission gates read that as "no constraint", so a
* probe that cannot be run or parsed is logged and folded into the same case.
*/

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::core::executor::run_captured;
use crate::errors::ExecutionError;

pub const TOTAL_LIMITS_PROBE: &str = "get-total-limits.py";
pub const TOTAL_METRICS_PROBE: &str = "get-total-metrics.py";
pub const VM_METRICS_PROBE: &str = "get-metrics.py";

/// Resources already promised to machines on this node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TotalUsage {
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub storage: Option<f64>,
}

/// Live counters summed across running machines.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LiveCounters {
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub rx: Option<f64>,
    #[serde(default)]
    pub tx: Option<f64>,
    #[serde(default)]
    pub storage_usage: Option<f64>,
    #[serde(default)]
    pub rctl: BTreeMap<String, f64>,
}

impl LiveCounters {
    pub fn counter(&self, name: &str) -> Option<f64> {
        match name {
            "memory-usage" => self.memory_usage,
            "rx" => self.rx,
            "tx" => self.tx,
            "storage-usage" => self.storage_usage,
            _ => None,
        }
    }
}

/// Raw per-machine probe run, forwarded verbatim in a metrics report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub status: i32,
    pub stdout: Value,
    pub stderr: String,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// `None` when the collector has nothing to say.
    async fn total_limits(&self) -> Option<TotalUsage>;

    /// `None` when the collector has nothing to say.
    async fn total_metrics(&self) -> Option<LiveCounters>;

    async fn vm_metrics(&self) -> Result<ProbeReport, ExecutionError>;
}

#[derive(Debug, Clone)]
pub struct ScriptMetrics {
    scripts: PathBuf,
}

impl ScriptMetrics {
    pub fn new(scripts: impl Into<PathBuf>) -> Self {
        Self {
            scripts: scripts.into(),
        }
    }

    async fn probe_json<T: serde::de::DeserializeOwned>(&self, probe: &str) -> Option<T> {
        let program = self.scripts.join(probe);
        let result = match run_captured(&program, &[]).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{probe} unavailable, skipping check: {e}");
                return None;
            }
        };

        parse_probe(probe, &result.stdout)
    }
}

fn parse_probe<T: serde::de::DeserializeOwned>(probe: &str, stdout: &str) -> Option<T> {
    if stdout.trim().is_empty() {
        debug!("{probe} reported nothing");
        return None;
    }

    match serde_json::from_str(stdout) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("{probe} printed something that is not valid JSON, skipping check: {e}");
            None
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptMetrics {
    async fn total_limits(&self) -> Option<TotalUsage> {
        self.probe_json(TOTAL_LIMITS_PROBE).await
    }

    async fn total_metrics(&self) -> Option<LiveCounters> {
        self.probe_json(TOTAL_METRICS_PROBE).await
    }

    async fn vm_metrics(&self) -> Result<ProbeReport, ExecutionError> {
        let program = self.scripts.join(VM_METRICS_PROBE);
        let result = run_captured(&program, &[]).await?;

        let stdout = if result.stdout.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&result.stdout).unwrap_or_else(|e| {
                warn!("{VM_METRICS_PROBE} output is not JSON, reporting it as text: {e}");
                Value::String(result.stdout.clone())
            })
        };

        Ok(ProbeReport {
            status: result.status,
            stdout,
            stderr: result.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_output_means_no_data() {
        assert_eq!(parse_probe::<TotalUsage>("p", ""), None);
        assert_eq!(parse_probe::<TotalUsage>("p", "  \n"), None);
    }

    #[test]
    fn test_garbage_output_means_no_data() {
        assert_eq!(parse_probe::<LiveCounters>("p", "Traceback (most recent"), None);
    }

    #[test]
    fn test_live_counters_shape() {
        let raw = r#"{
            "memory-usage": 150, "rx": 10, "tx": 20, "storage-usage": 4096,
            "rctl": { "pcpu": 12.5, "readbps": 100 }
        }"#;
        let counters: LiveCounters = parse_probe("p", raw).unwrap();
        assert_eq!(counters.counter("memory-usage"), Some(150.0));
        assert_eq!(counters.counter("tx"), Some(20.0));
        assert_eq!(counters.rctl.get("pcpu"), Some(&12.5));
        assert_eq!(counters.counter("nope"), None);
    }

    #[test]
    fn test_empty_object_has_no_counters() {
        let counters: LiveCounters = parse_probe("p", "{}").unwrap();
        assert_eq!(counters, LiveCounters::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_vm_metrics_probe() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let probe = dir.path().join(VM_METRICS_PROBE);
        std::fs::write(&probe, "#!/bin/sh\necho '{\"vm1\": {\"rx\": 1}}'\n").unwrap();
        std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let report = ScriptMetrics::new(dir.path()).vm_metrics().await.unwrap();
        assert_eq!(report.status, 0);
        assert_eq!(report.stdout["vm1"]["rx"], 1);

        std::fs::write(&probe, "#!/bin/sh\nexit 2\n").unwrap();
        let report = ScriptMetrics::new(dir.path()).vm_metrics().await.unwrap();
        assert_eq!(report.status, 2);
        assert_eq!(report.stdout, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_missing_probe_is_treated_as_no_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let metrics = ScriptMetrics::new(dir.path());
        assert_eq!(metrics.total_limits().await, None);
        assert_eq!(metrics.total_metrics().await, None);
    }
}
