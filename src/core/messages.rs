// Wire bodies for the four queue categories. Everything here is plain JSON so
// nodes running older builds (or ad-hoc scripts) can keep talking to us.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::host::Host;

/// Queue categories ("tubes") understood by the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tube {
    Create,
    Destroy,
    Forward,
    Status,
}

impl Tube {
    pub fn as_str(self) -> &'static str {
        match self {
            Tube::Create => "create",
            Tube::Destroy => "destroy",
            Tube::Forward => "forward",
            Tube::Status => "status",
        }
    }
}

impl fmt::Display for Tube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ask a node to build a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub profile: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    pub tags: Vec<String>,
}

/// Ask a node to tear down every machine carrying the given tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub tags: Vec<String>,
}

/// A create request relayed to another node; `max` is the remaining hop budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    pub max: i64,
    pub message: CreateRequest,
}

/// Exit code and captured streams of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub const NOT_FOUND_KEY: &str = "<not-found>";

/// Result message sent to the reporter node, one per finished unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "context")]
pub enum StatusMessage {
    #[serde(rename = "create")]
    Create {
        #[serde(rename = "node-id")]
        node_id: String,
        status: i32,
        output: String,
        tags: Vec<String>,
    },

    #[serde(rename = "create.forward")]
    Forward {
        #[serde(rename = "node-id")]
        node_id: String,
        status: String,
        forwarded: Option<Host>,
    },

    #[serde(rename = "destroy")]
    Destroy {
        #[serde(rename = "node-id")]
        node_id: String,
        destroyed: BTreeMap<String, CommandResult>,
    },

    #[serde(rename = "metrics")]
    Metrics {
        #[serde(rename = "node-id")]
        node_id: String,
        status: i32,
        stdout: serde_json::Value,
        stderr: String,
    },
}

impl StatusMessage {
    pub fn context(&self) -> &'static str {
        match self {
            StatusMessage::Create { .. } => "create",
            StatusMessage::Forward { .. } => "create.forward",
            StatusMessage::Destroy { .. } => "destroy",
            StatusMessage::Metrics { .. } => "metrics",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            StatusMessage::Create { node_id, .. }
            | StatusMessage::Forward { node_id, .. }
            | StatusMessage::Destroy { node_id, .. }
            | StatusMessage::Metrics { node_id, .. } => node_id,
        }
    }
}
