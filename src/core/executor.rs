use async_trait::async_trait;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::messages::{CommandResult, CreateRequest};
use crate::errors::ExecutionError;

pub const TIMEOUT_WRAPPER: &str = "timeout.sh";
pub const DEPLOY_COMMAND: &str = "safe-deploy.sh";
pub const FIND_COMMAND: &str = "find.sh";
pub const DESTROY_COMMAND: &str = "destroy.sh";

/// Exit code and interleaved stdout/stderr of a creation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub status: i32,
    pub output: String,
}

/// The machine lifecycle commands a worker drives. A non-zero exit is an
/// outcome, not an error; `Err` means the command could not be run at all.
#[async_trait]
pub trait VmExecutor: Send + Sync {
    async fn create(
        &self,
        request: &CreateRequest,
        timeout_secs: u64,
    ) -> Result<CreateOutcome, ExecutionError>;

    /// Machines matching every tag, one per stdout line.
    async fn find(&self, tags: &[String], timeout_secs: u64)
        -> Result<CommandResult, ExecutionError>;

    async fn destroy(&self, vm: &str, timeout_secs: u64) -> Result<CommandResult, ExecutionError>;
}

/// Runs the shell scripts shipped in the `scripts` directory, each one
/// wrapped in `timeout.sh <secs>`.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    scripts: PathBuf,
}

impl ScriptExecutor {
    pub fn new(scripts: impl Into<PathBuf>) -> Self {
        Self {
            scripts: scripts.into(),
        }
    }

    fn wrapped(&self, timeout_secs: u64, command: &str) -> (PathBuf, Vec<String>) {
        let program = self.scripts.join(TIMEOUT_WRAPPER);
        let args = vec![
            timeout_secs.to_string(),
            self.scripts.join(command).display().to_string(),
        ];
        (program, args)
    }
}

/// `profile "tags=a b" [options...]`
pub fn deploy_args(request: &CreateRequest) -> Vec<String> {
    let mut args = vec![
        request.profile.clone(),
        format!("tags={}", request.tags.join(" ")),
    ];
    if let Some(options) = &request.options {
        args.extend(options.iter().cloned());
    }
    args
}

#[async_trait]
impl VmExecutor for ScriptExecutor {
    async fn create(
        &self,
        request: &CreateRequest,
        timeout_secs: u64,
    ) -> Result<CreateOutcome, ExecutionError> {
        let (program, mut args) = self.wrapped(timeout_secs, DEPLOY_COMMAND);
        args.extend(deploy_args(request));

        info!(profile = %request.profile, "Creating a new virtual machine");
        run_combined(&program, &args).await
    }

    async fn find(
        &self,
        tags: &[String],
        timeout_secs: u64,
    ) -> Result<CommandResult, ExecutionError> {
        let (program, mut args) = self.wrapped(timeout_secs, FIND_COMMAND);
        args.extend(tags.iter().cloned());

        info!("Finding virtual machines");
        run_captured(&program, &args).await
    }

    async fn destroy(&self, vm: &str, timeout_secs: u64) -> Result<CommandResult, ExecutionError> {
        let (program, mut args) = self.wrapped(timeout_secs, DESTROY_COMMAND);
        args.push(vm.to_string());

        run_captured(&program, &args).await
    }
}

/// Run `program` to completion with stdout and stderr captured separately.
pub async fn run_captured(program: &Path, args: &[String]) -> Result<CommandResult, ExecutionError> {
    debug!(program = %program.display(), ?args, "Running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ExecutionError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    Ok(CommandResult {
        status: exit_code(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `program` with stderr folded into stdout, in write order.
pub async fn run_combined(program: &Path, args: &[String]) -> Result<CreateOutcome, ExecutionError> {
    debug!(program = %program.display(), ?args, "Running command");

    let spawn_err = |source| ExecutionError::Spawn {
        program: program.to_path_buf(),
        source,
    };
    let output_err = |source| ExecutionError::Output {
        program: program.to_path_buf(),
        source,
    };

    let (mut reader, writer) = io::pipe().map_err(spawn_err)?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(writer.try_clone().map_err(spawn_err)?)
        .stderr(writer);
    let mut child = command.spawn().map_err(spawn_err)?;
    // The command still owns the write ends; drop it so the read sees EOF.
    drop(command);

    let collected = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map(|_| buf)
    })
    .await
    .map_err(|e| output_err(io::Error::other(e)))?
    .map_err(output_err)?;

    let status = child.wait().await.map_err(output_err)?;

    Ok(CreateOutcome {
        status: exit_code(status),
        output: String::from_utf8_lossy(&collected).into_owned(),
    })
}

/// Killed-by-signal is reported as the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
