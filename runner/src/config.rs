use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to read config")]
    ReadError(#[from] Error),
    #[error("Config is not valid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks")]
    FailedPreflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // how to reach the scheduler frontend of the site
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    // shared by host resolution and the node liveness probe
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct FrontendConfig {
    pub site: String,
    pub user: String,
    // gateway to cross from outside the testbed, defaults to `access.<domain>`
    pub gateway: Option<String>,
    pub domain: String,
    // defaults to the home directory of `user`
    pub working_dir: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_ssh")]
    pub program: String,
    #[serde(default = "default_scp")]
    pub copy_program: String,
    // seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    // seconds, no limit when absent
    #[serde(default)]
    pub command_timeout: Option<u64>,
    // passed through as `-o <option>`
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReleasePolicy {
    /// only `Reservation::release` cancels the job
    #[default]
    Explicit,
    /// dropping an unreleased reservation cancels the job
    OnDrop,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default)]
    pub release: ReleasePolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    // seconds before the second attempt
    #[serde(default = "default_initial_delay")]
    pub initial: f64,
    // seconds, upper bound of the doubling
    #[serde(default = "default_max_delay")]
    pub max: f64,
    // fraction of the current delay added at random
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    // content shorter than this many characters is written inline
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct NodesConfig {
    #[serde(default = "default_nodes_dir")]
    pub working_dir: String,
    // login used on reimaged nodes
    #[serde(default = "default_deploy_user")]
    pub deploy_user: String,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let config: Self = serde_yaml::from_reader(File::open(path)?)?;
        info!(path = ?path, site = %config.frontend.site, "Loaded runner config");

        Ok(config)
    }

    /// Load and reject configs that fail `preflight_checks`
    pub fn load_checked(path: &Path) -> Result<Self, ConfigErrors> {
        let config = Self::load(path)?;

        if config.preflight_checks() {
            Err(ConfigErrors::FailedPreflight)
        } else {
            Ok(config)
        }
    }

    /// Report every problem at once, returns true if any of them is fatal
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.frontend.site.is_empty() {
            error!("frontend.site must name the site hosting the scheduler");
            contains_error = true;
        }

        if self.frontend.user.is_empty() {
            error!("frontend.user must be the login used on the frontend");
            contains_error = true;
        }

        if self.frontend.domain.is_empty() {
            error!("frontend.domain cannot be empty, it decides whether the gateway is crossed");
            contains_error = true;
        }

        if self.backoff.initial <= 0.0 || !self.backoff.initial.is_finite() {
            error!(
                "backoff.initial ({}) must be a positive number of seconds",
                self.backoff.initial
            );
            contains_error = true;
        }

        if self.backoff.max < self.backoff.initial {
            error!(
                "backoff.max ({}) cannot be below backoff.initial ({})",
                self.backoff.max, self.backoff.initial
            );
            contains_error = true;
        }

        if !(0.0..1.0).contains(&self.backoff.jitter) {
            error!(
                "backoff.jitter ({}) must be a fraction in [0, 1)",
                self.backoff.jitter
            );
            contains_error = true;
        }

        if self.transfer.inline_threshold == 0 {
            error!("transfer.inline_threshold cannot be 0, every write would need an upload");
            contains_error = true;
        }

        if self.ssh.connect_timeout == 0 {
            warn!("ssh.connect_timeout is 0, ssh will fall back to the system TCP timeout");
        }

        if self.nodes.working_dir.is_empty() || !self.nodes.working_dir.starts_with('/') {
            error!(
                "nodes.working_dir ({}) must be an absolute path",
                self.nodes.working_dir
            );
            contains_error = true;
        }

        contains_error
    }
}

impl FrontendConfig {
    pub fn gateway(&self) -> String {
        self.gateway
            .clone()
            .unwrap_or_else(|| format!("access.{}", self.domain))
    }

    pub fn working_dir(&self) -> String {
        self.working_dir
            .clone()
            .unwrap_or_else(|| format!("/home/{}", self.user))
    }
}

impl SshConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_secs)
    }
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            user: String::new(),
            gateway: None,
            domain: default_domain(),
            working_dir: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_ssh(),
            copy_program: default_scp(),
            connect_timeout: default_connect_timeout(),
            command_timeout: None,
            options: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            queue: None,
            default_image: default_image(),
            release: ReleasePolicy::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_initial_delay(),
            max: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            inline_threshold: default_inline_threshold(),
        }
    }
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            working_dir: default_nodes_dir(),
            deploy_user: default_deploy_user(),
        }
    }
}

fn default_domain() -> String {
    "grid5000.fr".to_owned()
}

fn default_ssh() -> String {
    "ssh".to_owned()
}

fn default_scp() -> String {
    "scp".to_owned()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_job_name() -> String {
    "orchestra".to_owned()
}

fn default_image() -> String {
    "debian9-x64-min".to_owned()
}

fn default_initial_delay() -> f64 {
    5.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_inline_threshold() -> usize {
    80
}

fn default_nodes_dir() -> String {
    "/tmp".to_owned()
}

fn default_deploy_user() -> String {
    "root".to_owned()
}
