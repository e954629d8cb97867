//! Command lines and output formats of the OAR batch scheduler.

use crate::{
    error::{Result, RunnerError},
    shell,
};
use chrono::{DateTime, TimeZone};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;
use tracing_unwrap::ResultExt;

static JOB_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"OAR_JOB_ID=(\d+)").unwrap_or_log());

/// lists the jobs of the calling user
pub const USER_JOBS_COMMAND: &str = "oarstat -J -u";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No OAR_JOB_ID in the submission output: {0:?}")]
    MissingJobId(String),
    #[error("Scheduler status is not valid JSON")]
    InvalidStatus(#[from] serde_json::Error),
    #[error("Job {0} is missing from the scheduler status")]
    UnknownJob(JobId),
    #[error("No running or waiting job found")]
    NoJobs,
    #[error("Job {job} ended ({state}) before getting any node")]
    Finished { job: JobId, state: String },
    #[error("Invalid walltime {0:?}")]
    InvalidWalltime(String),
}

/// Identifier handed out by the scheduler on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    /// file listing the nodes of the job, readable on the frontend
    pub fn node_file(&self) -> String {
        format!("/var/lib/oar/{}", self.0)
    }

    pub fn status_command(&self) -> String {
        format!("oarstat -fJ -j {}", self.0)
    }

    pub fn cancel_command(&self) -> String {
        format!("oardel {}", self.0)
    }

    /// reinstall the nodes of the job with `image`
    pub fn reimage_command(&self, image: &str) -> String {
        format!("kadeploy3 -k -f {} -e {}", self.node_file(), shell::escape(image))
    }
}

/// How the nodes of a job are reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// the reference environment, logged in as the submitting user
    Direct,
    /// nodes are reinstalled with the given image and used as root
    Reimaged(String),
}

impl Access {
    pub fn is_reimaged(&self) -> bool {
        matches!(self, Self::Reimaged(_))
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Reimaged(image) => Some(image),
            Self::Direct => None,
        }
    }

    fn job_type(&self) -> &'static str {
        match self {
            Self::Direct => "allow_classic_ssh",
            Self::Reimaged(_) => "deploy",
        }
    }
}

/// Maximum duration of a job, at least one second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walltime {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Walltime {
    pub fn new(hours: u32, minutes: u32, seconds: u32) -> Result<Self, SchedulerError> {
        if hours == 0 && minutes == 0 && seconds == 0 {
            return Err(SchedulerError::InvalidWalltime("00:00:00".to_owned()));
        }

        let total = u64::from(hours) * 3600 + u64::from(minutes) * 60 + u64::from(seconds);

        Ok(Self::from(Duration::from_secs(total)))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(
            u64::from(self.hours) * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds),
        )
    }
}

impl From<Duration> for Walltime {
    fn from(duration: Duration) -> Self {
        let total = duration.as_secs().max(1);

        Self {
            hours: u32::try_from(total / 3600).unwrap_or(u32::MAX),
            minutes: (total % 3600 / 60) as u32,
            seconds: (total % 60) as u32,
        }
    }
}

impl FromStr for Walltime {
    type Err = SchedulerError;

    /// accepts `H`, `H:MM` and `H:MM:SS`
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidWalltime(value.to_owned());
        let parts: Vec<u32> = value
            .split(':')
            .map(|part| part.trim().parse().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;

        match parts.as_slice() {
            [hours] => Self::new(*hours, 0, 0),
            [hours, minutes] if *minutes < 60 => Self::new(*hours, *minutes, 0),
            [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => {
                Self::new(*hours, *minutes, *seconds)
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

/// resource filter selecting any node of `clusters`
pub fn cluster_constraint(clusters: &[&str]) -> String {
    format!(
        "{{cluster in ({})}}",
        clusters.iter().map(|cluster| format!("'{cluster}'")).join(", ")
    )
}

/// resource filter selecting exactly `hosts`, short names are completed with the site
pub fn host_constraint(hosts: &[&str], site: &str, domain: &str) -> String {
    format!(
        "{{network_address in ({})}}",
        hosts
            .iter()
            .map(|host| format!("'{}'", qualify(host, site, domain)))
            .join(", ")
    )
}

fn qualify(host: &str, site: &str, domain: &str) -> String {
    if host.contains(domain) {
        host.to_owned()
    } else {
        format!("{host}.{site}.{domain}")
    }
}

/// When the job starts, or what it runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Start {
    /// advance reservation starting at submission time
    #[default]
    Immediate,
    /// queued until the scheduler finds room
    Queued,
    /// batch job running this script
    Script(String),
}

/// Everything `oarsub` needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub constraint: String,
    pub nodes: usize,
    pub walltime: Walltime,
    pub access: Access,
    pub queue: Option<String>,
    pub start: Start,
}

impl Request {
    pub fn new(constraint: impl Into<String>, nodes: usize, walltime: Walltime) -> Self {
        Self {
            name: "orchestra".to_owned(),
            constraint: constraint.into(),
            nodes,
            walltime,
            access: Access::Direct,
            queue: None,
            start: Start::default(),
        }
    }

    /// any `nodes` nodes of `clusters`
    pub fn clusters(clusters: &[&str], nodes: usize, walltime: Walltime) -> Self {
        Self::new(cluster_constraint(clusters), nodes, walltime)
    }

    /// exactly `hosts`
    pub fn hosts(hosts: &[&str], site: &str, domain: &str, walltime: Walltime) -> Self {
        Self::new(host_constraint(hosts, site, domain), hosts.len(), walltime)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn reimaged(mut self, image: impl Into<String>) -> Self {
        self.access = Access::Reimaged(image.into());
        self
    }

    pub fn in_queue(mut self, queue: Option<String>) -> Self {
        self.queue = queue;
        self
    }

    pub fn starting(mut self, start: Start) -> Self {
        self.start = start;
        self
    }

    /// `oarsub` invocation, `now` dates immediate reservations
    pub fn command<Tz>(&self, now: &DateTime<Tz>) -> Result<String>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        if self.nodes == 0 {
            return Err(RunnerError::Precondition(
                "a job needs at least one node".to_owned(),
            ));
        }

        let queue = match &self.queue {
            Some(queue) => format!("-q {} ", shell::escape(queue)),
            None => String::new(),
        };
        let mut command = format!(
            "oarsub -n {} {queue}-t {} -l \"{}/nodes={},walltime={}\"",
            shell::escape(&self.name),
            self.access.job_type(),
            self.constraint,
            self.nodes,
            self.walltime
        );

        match &self.start {
            Start::Immediate => {
                command.push_str(&format!(" -r \"{}\"", now.format("%Y-%m-%d %H:%M:%S")))
            }
            Start::Queued => {}
            Start::Script(script) => {
                command.push(' ');
                command.push_str(&shell::escape(script));
            }
        }

        Ok(command)
    }
}

/// Job id announced in the output of `oarsub`
pub fn parse_job_id(output: &str) -> Result<JobId, SchedulerError> {
    JOB_ID
        .captures(output)
        .and_then(|captures| captures[1].parse().ok())
        .map(JobId)
        .ok_or_else(|| SchedulerError::MissingJobId(output.trim().to_owned()))
}

/// Scheduler state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Running,
    Waiting,
    Other(String),
}

impl JobState {
    /// whether the job holds or will hold nodes
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    /// whether the job is over and will never hold nodes again
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Other(state) if state == "Terminated" || state == "Error")
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Other("Unknown".to_owned())
    }
}

impl From<String> for JobState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "Running" => Self::Running,
            "Waiting" => Self::Waiting,
            _ => Self::Other(state),
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Running => "Running".to_owned(),
            JobState::Waiting => "Waiting".to_owned(),
            JobState::Other(state) => state,
        }
    }
}

/// One job as reported by `oarstat -J`. Fields this crate does not use are kept
/// in `other` so the record can be archived as reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobStatus {
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub assigned_network_address: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl JobStatus {
    pub fn is_reimage_job(&self) -> bool {
        self.types.iter().any(|kind| kind == "deploy")
    }
}

/// Status of `job` out of the output of `oarstat -fJ -j <job>`
pub fn parse_status(output: &str, job: JobId) -> Result<JobStatus, SchedulerError> {
    let mut jobs: BTreeMap<String, JobStatus> = serde_json::from_str(output)?;

    jobs.remove(&job.to_string())
        .ok_or(SchedulerError::UnknownJob(job))
}

/// Jobs out of the output of `oarstat -J -u`
pub fn parse_jobs(output: &str) -> Result<BTreeMap<JobId, JobStatus>, SchedulerError> {
    if output.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let jobs: BTreeMap<String, JobStatus> = serde_json::from_str(output)?;

    Ok(jobs
        .into_iter()
        .filter_map(|(id, status)| match id.parse() {
            Ok(id) => Some((JobId(id), status)),
            Err(_) => {
                warn!("Ignoring job with a non-numeric id {id:?}");
                None
            }
        })
        .collect())
}
