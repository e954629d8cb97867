use crate::{scheduler::SchedulerError, topology::TopologyError, transport::TransportError};
use itertools::Itertools;
use std::{fmt, io};
use thiserror::Error;

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Command `{command}` exited with {status} on {host}: {stderr}")]
    RemoteExecution {
        host: String,
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Output of {host} differs from {reference} in group {group}")]
    Inconsistency {
        group: String,
        reference: String,
        host: String,
    },
    #[error("Got different topologies for nodes {reference} and {host}")]
    TopologyMismatch { reference: String, host: String },
    #[error("Invalid operation: {0}")]
    Precondition(String),
    #[error("{} member(s) of {group} failed: {}", failures.len(), MemberList(failures))]
    Group {
        group: String,
        failures: Vec<(String, RunnerError)>,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("Local I/O failed")]
    LocalIo(#[from] io::Error),
    #[error("Failed to serialize a report")]
    Serialization(#[from] serde_yaml::Error),
}

impl RunnerError {
    /// true for failures that a retry loop may wait out
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Group { failures, .. } => failures.iter().all(|(_, error)| error.is_transient()),
            _ => false,
        }
    }

    /// hosts that failed, one entry for a single-host failure
    pub fn failed_hosts(&self) -> Vec<&str> {
        match self {
            Self::Group { failures, .. } => failures.iter().map(|(host, _)| host.as_str()).collect(),
            Self::RemoteExecution { host, .. } => vec![host.as_str()],
            _ => Vec::new(),
        }
    }
}

struct MemberList<'a>(&'a [(String, RunnerError)]);

impl fmt::Display for MemberList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .map(|(host, error)| format!("[{host}] {error}"))
                .join(", ")
        )
    }
}
