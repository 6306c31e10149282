/*
* Worker Loop
* -----------
*
* One invocation, one job. A worker watches a single tube, reserves the next
* job, walks it through the states below and exits:
*
*   Reserved ──► Create ──► Admitted ──► Report
*      │           ▲  └───► Refused  ──► Report      (relayed or not)
*      │           │
*      ├──► Forwarded ──────► Abandoned               (hop budget spent)
*      ├──► Destroy ───────────────────► Report
*      └──► Store                                     (status tube, no report)
*
* Whatever happens to the action, the job is acknowledged exactly once and
* before the report goes out, so a reserved job is never handed out again
* unless this process dies first (then the broker's ttr brings it back).
* A forwarded request re-enters the Create state with the hop budget it
* carried; refusing it again spends one more unit.
*/

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::core::executor::VmExecutor;
use crate::core::forward::{relay_budget, unwrap_envelope, ForwardingCoordinator};
use crate::core::host::Host;
use crate::core::messages::{
    CommandResult, CreateRequest, DestroyRequest, ForwardEnvelope, StatusMessage, Tube,
    NOT_FOUND_KEY,
};
use crate::core::resource_manager::ResourceManager;
use crate::errors::handlers::report_warning;
use crate::errors::{ClusterResult, ExecutionError};
use crate::logs::{LogStore, RetentionPolicy};
use crate::monitoring::MetricsSource;
use crate::queue::{Broker, Consumer, JobId};
use crate::reporter::StatusReporter;

/// Exit status recorded when an external command could not be started.
pub const EX_NOT_RUN: i32 = 127;

/// Seconds the creation command may run: just under the job's ttr.
pub fn create_timeout(ttr: u64) -> u64 {
    ttr.saturating_sub(2)
}

/// Seconds each find / destroy command may run: half the ttr, minus slack.
pub fn destroy_timeout(ttr: u64) -> u64 {
    (ttr / 2).saturating_sub(2)
}

/// How a cycle ended, for the caller's logs and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Created { status: i32 },
    Forwarded { to: Option<Host> },
    Destroyed { machines: usize },
    Abandoned,
    Logged(PathBuf),
}

enum State {
    Reserved(Tube, Vec<u8>),
    Create {
        request: CreateRequest,
        hops: Option<i64>,
    },
    Admitted(CreateRequest),
    Refused {
        request: CreateRequest,
        budget: i64,
    },
    Forwarded(ForwardEnvelope),
    Destroy(DestroyRequest),
    Store(Vec<u8>),
    Report(StatusMessage, CycleOutcome),
    Done(CycleOutcome),
}

/// The reserved job and whether it has been acknowledged yet.
struct Reservation {
    consumer: Box<dyn Consumer>,
    job: JobId,
    acknowledged: bool,
}

impl Reservation {
    async fn acknowledge(&mut self) {
        if self.acknowledged {
            return;
        }
        self.acknowledged = true;

        match self.consumer.delete(self.job).await {
            Ok(()) => debug!(job = self.job, "Job deleted"),
            Err(e) => error!(job = self.job, "Could not delete job: {e}"),
        }
    }
}

pub struct WorkerLoop {
    settings: Arc<Settings>,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn VmExecutor>,
    admission: ResourceManager,
    forwarder: ForwardingCoordinator,
    reporter: StatusReporter,
    store: LogStore,
}

impl WorkerLoop {
    pub fn new(
        settings: Arc<Settings>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn VmExecutor>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let admission = ResourceManager::new(
            settings.limits.clone(),
            settings.overload.clone(),
            metrics,
        );
        let forwarder =
            ForwardingCoordinator::new(broker.clone(), settings.forward.next.clone(), settings.ttr);
        let reporter = StatusReporter::new(broker.clone(), settings.reporter.clone(), settings.ttr);
        let store = LogStore::new(settings.log_dir.clone());

        Self {
            settings,
            broker,
            executor,
            admission,
            forwarder,
            reporter,
            store,
        }
    }

    /// Reserve one job from `tube` and see it through. Status jobs are read
    /// from the reporter endpoint, everything else from `local`.
    pub async fn run_once(&self, tube: Tube) -> ClusterResult<CycleOutcome> {
        let host = match tube {
            Tube::Status => &self.settings.reporter,
            _ => &self.settings.local,
        };

        info!("Watching (tube:{tube}) on {host}");
        let mut consumer = self.broker.watch(host, tube).await?;
        let job = consumer.reserve().await?;
        info!("Reserved (job:{})", job.id);

        let mut reservation = Reservation {
            consumer,
            job: job.id,
            acknowledged: false,
        };
        let mut state = State::Reserved(tube, job.body);

        loop {
            state = match state {
                State::Reserved(tube, body) => match decode(tube, body) {
                    Ok(next) => next,
                    Err(e) => {
                        // A body we cannot read will never get better.
                        reservation.acknowledge().await;
                        return Err(e);
                    }
                },

                State::Forwarded(envelope) => match unwrap_envelope(envelope) {
                    Some((request, max)) => State::Create {
                        request,
                        hops: Some(max),
                    },
                    None => {
                        reservation.acknowledge().await;
                        State::Done(CycleOutcome::Abandoned)
                    }
                },

                State::Create { request, hops } => {
                    if self.admission.may_accept().await {
                        State::Admitted(request)
                    } else {
                        report_warning("Limits has been reached!");
                        State::Refused {
                            request,
                            budget: relay_budget(hops, self.settings.forward.max),
                        }
                    }
                }

                State::Admitted(request) => {
                    let (status, output) = self.create(&request).await;
                    reservation.acknowledge().await;
                    State::Report(
                        StatusMessage::Create {
                            node_id: self.settings.node_id.clone(),
                            status,
                            output,
                            tags: request.tags,
                        },
                        CycleOutcome::Created { status },
                    )
                }

                State::Refused { request, budget } => {
                    let outcome = self.forwarder.relay(request, budget).await;
                    reservation.acknowledge().await;
                    State::Report(
                        StatusMessage::Forward {
                            node_id: self.settings.node_id.clone(),
                            status: outcome.status,
                            forwarded: outcome.forwarded.clone(),
                        },
                        CycleOutcome::Forwarded {
                            to: outcome.forwarded,
                        },
                    )
                }

                State::Destroy(request) => {
                    let destroyed = self.destroy(&request).await;
                    reservation.acknowledge().await;
                    let machines = destroyed.keys().filter(|k| *k != NOT_FOUND_KEY).count();
                    State::Report(
                        StatusMessage::Destroy {
                            node_id: self.settings.node_id.clone(),
                            destroyed,
                        },
                        CycleOutcome::Destroyed { machines },
                    )
                }

                State::Store(body) => {
                    let path = self.store(&body).await?;
                    reservation.acknowledge().await;
                    State::Done(CycleOutcome::Logged(path))
                }

                State::Report(message, outcome) => {
                    self.reporter.report_or_log(&message).await;
                    State::Done(outcome)
                }

                State::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn create(&self, request: &CreateRequest) -> (i32, String) {
        let timeout = create_timeout(self.settings.ttr);
        match self.executor.create(request, timeout).await {
            Ok(outcome) => {
                info!(status = outcome.status, "Creation finished");
                (outcome.status, outcome.output)
            }
            Err(e) => {
                error!("{e}");
                (EX_NOT_RUN, e.to_string())
            }
        }
    }

    async fn destroy(&self, request: &DestroyRequest) -> BTreeMap<String, CommandResult> {
        let timeout = destroy_timeout(self.settings.ttr);
        let mut destroyed = BTreeMap::new();

        let found = self
            .executor
            .find(&request.tags, timeout)
            .await
            .unwrap_or_else(not_run);

        let machines: Vec<&str> = found
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if found.status != 0 || machines.is_empty() {
            report_warning("No virtual machines to destroy found.");
            destroyed.insert(NOT_FOUND_KEY.to_string(), found);
            return destroyed;
        }

        for vm in machines {
            report_warning(&format!("Destroying virtual machine (vm:{vm})"));
            let result = self
                .executor
                .destroy(vm, timeout)
                .await
                .unwrap_or_else(not_run);
            destroyed.insert(vm.to_string(), result);
        }
        destroyed
    }

    /// Retire old logs first, then keep the new report. If it cannot be
    /// written the job is left reserved so the broker hands it out again.
    async fn store(&self, body: &[u8]) -> ClusterResult<PathBuf> {
        let policy = RetentionPolicy::from_settings(&self.settings);
        if let Err(e) = self.store.retire(&policy).await {
            report_warning(&format!("Could not retire logs: {e}"));
        }
        Ok(self.store.append(body).await?)
    }
}

fn decode(tube: Tube, body: Vec<u8>) -> ClusterResult<State> {
    let state = match tube {
        Tube::Create => State::Create {
            request: serde_json::from_slice(&body)?,
            hops: None,
        },
        Tube::Forward => State::Forwarded(serde_json::from_slice(&body)?),
        Tube::Destroy => State::Destroy(serde_json::from_slice(&body)?),
        Tube::Status => State::Store(body),
    };
    Ok(state)
}

fn not_run(error: ExecutionError) -> CommandResult {
    error!("{error}");
    CommandResult {
        status: EX_NOT_RUN,
        stdout: String::new(),
        stderr: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::CreateOutcome;
    use crate::monitoring::{LiveCounters, ProbeReport, TotalUsage};
    use crate::queue::{self, MemoryBroker};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingExecutor {
        created: Mutex<Vec<(CreateRequest, u64)>>,
    }

    #[async_trait]
    impl VmExecutor for RecordingExecutor {
        async fn create(
            &self,
            request: &CreateRequest,
            timeout_secs: u64,
        ) -> Result<CreateOutcome, ExecutionError> {
            self.created
                .lock()
                .unwrap()
                .push((request.clone(), timeout_secs));
            Ok(CreateOutcome {
                status: 1,
                output: "disk full\n".into(),
            })
        }

        async fn find(&self, _: &[String], _: u64) -> Result<CommandResult, ExecutionError> {
            Err(ExecutionError::Spawn {
                program: "find.sh".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }

        async fn destroy(&self, _: &str, _: u64) -> Result<CommandResult, ExecutionError> {
            unreachable!("nothing is ever found")
        }
    }

    struct Idle;

    #[async_trait]
    impl MetricsSource for Idle {
        async fn total_limits(&self) -> Option<TotalUsage> {
            None
        }

        async fn total_metrics(&self) -> Option<LiveCounters> {
            None
        }

        async fn vm_metrics(&self) -> Result<ProbeReport, ExecutionError> {
            unreachable!()
        }
    }

    struct Fixture {
        _dir: TempDir,
        broker: MemoryBroker,
        settings: Arc<Settings>,
        executor: Arc<RecordingExecutor>,
        worker: WorkerLoop,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let raw = r#"{
            "node-id": "n1",
            "hosts": ["127.0.0.1"],
            "local": "node-a",
            "reporter": "node-r",
            "ttr": 100,
            "scripts": "/nonexistent",
            "logs": { "count": 10 }
        }"#;
        let settings = Arc::new(Settings::from_json5(raw, dir.path()).unwrap());
        let broker = MemoryBroker::new();
        let executor = Arc::new(RecordingExecutor::default());
        let worker = WorkerLoop::new(
            settings.clone(),
            Arc::new(broker.clone()),
            executor.clone(),
            Arc::new(Idle),
        );
        Fixture {
            _dir: dir,
            broker,
            settings,
            executor,
            worker,
        }
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(create_timeout(3600), 3598);
        assert_eq!(destroy_timeout(3600), 1798);
        assert_eq!(destroy_timeout(3), 0);
    }

    #[tokio::test]
    async fn test_admitted_create_runs_and_reports_failure_status() {
        let f = fixture();
        let request = CreateRequest {
            profile: "CS3".into(),
            options: Some(vec!["-x".into()]),
            tags: vec!["web".into()],
        };
        let id = queue::submit(&f.broker, &f.settings.local, Tube::Create, &request, 100)
            .await
            .unwrap();

        let outcome = f.worker.run_once(Tube::Create).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Created { status: 1 });
        assert_eq!(*f.executor.created.lock().unwrap(), vec![(request, 98)]);
        assert_eq!(f.broker.deleted(), vec![id]);

        let reports: Vec<StatusMessage> = f.broker.pending_as(&f.settings.reporter, Tube::Status);
        assert_eq!(
            reports,
            vec![StatusMessage::Create {
                node_id: "n1".into(),
                status: 1,
                output: "disk full\n".into(),
                tags: vec!["web".into()],
            }]
        );
    }

    #[tokio::test]
    async fn test_find_that_cannot_run_reports_sentinel() {
        let f = fixture();
        let request = DestroyRequest {
            tags: vec!["x".into()],
        };
        queue::submit(&f.broker, &f.settings.local, Tube::Destroy, &request, 100)
            .await
            .unwrap();

        let outcome = f.worker.run_once(Tube::Destroy).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Destroyed { machines: 0 });

        let reports: Vec<StatusMessage> = f.broker.pending_as(&f.settings.reporter, Tube::Status);
        let StatusMessage::Destroy { destroyed, .. } = &reports[0] else {
            panic!("expected a destroy report, got {reports:?}");
        };
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[NOT_FOUND_KEY].status, EX_NOT_RUN);
    }

    #[tokio::test]
    async fn test_malformed_body_is_acknowledged_and_rejected() {
        let f = fixture();
        let id = f
            .broker
            .put(&f.settings.local, Tube::Create, b"{\"profile\":", 100)
            .await
            .unwrap();

        let err = f.worker.run_once(Tube::Create).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EX_DATAERR);
        assert_eq!(f.broker.deleted(), vec![id]);
        assert!(f.broker.pending(&f.settings.reporter, Tube::Status).is_empty());
    }

    #[tokio::test]
    async fn test_status_job_is_stored_verbatim() {
        let f = fixture();
        let body = br#"{"context":"metrics","node-id":"n9","status":0,"stdout":{},"stderr":""}"#;
        let id = f
            .broker
            .put(&f.settings.reporter, Tube::Status, body, 100)
            .await
            .unwrap();

        let CycleOutcome::Logged(path) = f.worker.run_once(Tube::Status).await.unwrap() else {
            panic!("status jobs are logged");
        };
        assert_eq!(std::fs::read(path).unwrap(), body);
        assert_eq!(f.broker.deleted(), vec![id]);
    }

    #[tokio::test]
    async fn test_empty_tube_is_an_error() {
        let f = fixture();
        assert!(f.worker.run_once(Tube::Forward).await.is_err());
    }
}
