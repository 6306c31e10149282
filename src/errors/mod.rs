pub mod handlers;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::UnitParseError;
use crate::core::host::{Host, HostParseError};

// See sysexits(3).
pub const EX_OK: i32 = 0;
pub const EX_USAGE: i32 = 64;
pub const EX_DATAERR: i32 = 65;
pub const EX_UNAVAILABLE: i32 = 69;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_IOERR: i32 = 74;
pub const EX_CONFIG: i32 = 78;

/// Everything a single CLI invocation can fail with.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Selection(#[from] SelectionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Log store error: {0}")]
    Logs(#[from] LogStoreError),

    #[error("Malformed job body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

impl ClusterError {
    /// sysexits-compatible process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClusterError::Config(_) => EX_CONFIG,
            ClusterError::Usage(_) => EX_USAGE,
            ClusterError::Selection(_) => EX_SOFTWARE,
            ClusterError::Queue(QueueError::Connect { .. }) => EX_UNAVAILABLE,
            ClusterError::Queue(_) => EX_SOFTWARE,
            ClusterError::Execution(_) => EX_SOFTWARE,
            ClusterError::Logs(_) => EX_IOERR,
            ClusterError::Decode(_) => EX_DATAERR,
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Load(#[from] config::ConfigError),

    #[error("No hosts have been defined!")]
    NoHosts,

    #[error("{0}")]
    Host(#[from] HostParseError),

    #[error("{0}")]
    Unit(#[from] UnitParseError),

    #[error("Cannot locate the executable directory: {0}")]
    BaseDir(io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Invalid algorithm '{0}'")]
    InvalidAlgorithm(String),

    #[error("'{0}' algorithm requires an argument!")]
    ArgumentRequired(&'static str),

    #[error("Match not found{}", .0.as_ref().map(|h| format!(" for host '{h}'")).unwrap_or_default())]
    HostNotFound(Option<String>),

    #[error("{0}")]
    BadArgument(#[from] HostParseError),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("cannot connect to {host}: {source}")]
    Connect {
        host: Host,
        #[source]
        source: io::Error,
    },

    #[error("I/O failure talking to the broker: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected reply to '{command}': {reply}")]
    Protocol { command: String, reply: String },

    #[error("broker refused '{command}': {reply}")]
    Rejected { command: String, reply: String },

    #[error("no job ready in tube '{0}'")]
    Empty(String),

    #[error("failed to encode job body: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to collect output of {}: {source}", program.display())]
    Output {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode log dump: {0}")]
    Encode(#[from] serde_json::Error),
}
