// Shared fakes for the integration suites: an executor that records what it
// was asked to do and a metrics source with fixed readings.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

use vm_cluster::core::executor::{CreateOutcome, VmExecutor};
use vm_cluster::core::messages::{CommandResult, CreateRequest};
use vm_cluster::errors::ExecutionError;
use vm_cluster::monitoring::{LiveCounters, MetricsSource, ProbeReport, TotalUsage};
use vm_cluster::{MemoryBroker, Settings, WorkerLoop};

pub struct FakeExecutor {
    pub create_status: i32,
    pub found: CommandResult,
    pub created: Mutex<Vec<CreateRequest>>,
    pub destroyed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::finding("", 0)
    }

    /// `find.sh` prints `stdout` and exits with `status`.
    pub fn finding(stdout: &str, status: i32) -> Self {
        Self {
            create_status: 0,
            found: CommandResult {
                status,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn creations(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl VmExecutor for FakeExecutor {
    async fn create(
        &self,
        request: &CreateRequest,
        _timeout_secs: u64,
    ) -> Result<CreateOutcome, ExecutionError> {
        self.created.lock().unwrap().push(request.clone());
        Ok(CreateOutcome {
            status: self.create_status,
            output: format!("deployed {}\n", request.profile),
        })
    }

    async fn find(&self, _tags: &[String], _timeout_secs: u64) -> Result<CommandResult, ExecutionError> {
        Ok(self.found.clone())
    }

    async fn destroy(&self, vm: &str, _timeout_secs: u64) -> Result<CommandResult, ExecutionError> {
        self.destroyed.lock().unwrap().push(vm.to_string());
        Ok(CommandResult {
            status: 0,
            stdout: format!("{vm} destroyed\n"),
            stderr: String::new(),
        })
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    pub usage: Option<TotalUsage>,
    pub counters: Option<LiveCounters>,
    pub report: Option<ProbeReport>,
}

impl FakeMetrics {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn memory_usage(current: f64) -> Self {
        Self {
            counters: Some(LiveCounters {
                memory_usage: Some(current),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn total_limits(&self) -> Option<TotalUsage> {
        self.usage.clone()
    }

    async fn total_metrics(&self) -> Option<LiveCounters> {
        self.counters.clone()
    }

    async fn vm_metrics(&self) -> Result<ProbeReport, ExecutionError> {
        Ok(self.report.clone().unwrap_or(ProbeReport {
            status: 0,
            stdout: serde_json::json!({}),
            stderr: String::new(),
        }))
    }
}

/// Settings for a node called `node_id`, listening on `local`, with `extra`
/// spliced into the top-level object.
pub fn node_settings(dir: &Path, node_id: &str, local: &str, extra: &str) -> Arc<Settings> {
    let raw = format!(
        r#"{{
            "node-id": "{node_id}",
            "hosts": ["node-a", "node-b", "node-c"],
            "local": "{local}",
            "reporter": "node-r",
            "ttr": 60,
            "scripts": "/opt/vm",
            {extra}
        }}"#
    );
    Arc::new(Settings::from_json5(&raw, dir).expect("valid settings"))
}

pub fn worker(
    settings: &Arc<Settings>,
    broker: &MemoryBroker,
    executor: &Arc<FakeExecutor>,
    metrics: FakeMetrics,
) -> WorkerLoop {
    WorkerLoop::new(
        settings.clone(),
        Arc::new(broker.clone()),
        executor.clone(),
        Arc::new(metrics),
    )
}
