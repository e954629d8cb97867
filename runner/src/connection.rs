use crate::{
    config::FrontendConfig,
    error::{Result, RunnerError},
    shell,
    transport::{Endpoint, RunOutput, Transport},
};
use std::{fmt, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Shared handle on a connection, relays are borrowed through it by every connection
/// tunnelling through them
pub type ConnectionHandle = Arc<Connection>;

/// Per-command knobs, see `ConnectionGroup::run` for the group defaults
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    // relative to the working directory of a group
    pub directory: Option<String>,
    // keep stdout/stderr instead of sending them to /dev/null
    pub show_output: bool,
    // a non-zero exit status is returned as output rather than as an error
    pub warn_only: bool,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_output(mut self) -> Self {
        self.show_output = true;
        self
    }

    pub fn warn_only(mut self) -> Self {
        self.warn_only = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A login on one remote host, optionally reached through another connection
pub struct Connection {
    host: String,
    user: String,
    relay: Option<ConnectionHandle>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint().to_string())
            .finish()
    }
}

impl Connection {
    pub fn new(host: impl Into<String>, user: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            relay: None,
            transport,
        }
    }

    /// tunnel every interaction through `relay`
    pub fn through(mut self, relay: ConnectionHandle) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Connection to the scheduler frontend of a site. From outside the testbed the
    /// configured gateway is crossed first.
    pub fn frontend(config: &FrontendConfig, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let connection = Self::new(config.site.clone(), config.user.clone(), transport.clone());

        if inside_domain(&config.domain) {
            debug!(site = %config.site, "Already inside {}, no gateway needed", config.domain);

            Arc::new(connection)
        } else {
            let gateway = Arc::new(Self::new(config.gateway(), config.user.clone(), transport));

            Arc::new(connection.through(gateway))
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn relay(&self) -> Option<&ConnectionHandle> {
        self.relay.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn endpoint(&self) -> Endpoint {
        let jumps = match &self.relay {
            Some(relay) => {
                let outer = relay.endpoint();
                let mut jumps = outer.jumps.clone();
                jumps.push(outer.destination());
                jumps
            }
            None => Vec::new(),
        };

        Endpoint {
            host: self.host.clone(),
            user: self.user.clone(),
            jumps,
        }
    }

    /// Run `command`, after changing into `options.directory` when one is given
    pub fn run(&self, command: &str, options: &RunOptions) -> Result<RunOutput> {
        let command = match &options.directory {
            Some(directory) => format!("cd {} && {command}", shell::escape(directory)),
            None => command.to_owned(),
        };

        let output = self
            .transport
            .execute(&self.endpoint(), &command, options.timeout)?;

        if output.success() {
            Ok(output)
        } else if options.warn_only {
            warn!(host = %self.host, status = output.status, "`{command}` failed, continuing");

            Ok(output)
        } else {
            Err(RunnerError::RemoteExecution {
                host: self.host.clone(),
                command,
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    pub fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        info!(host = %self.host, "put: {} → {remote}", local.display());

        Ok(self.transport.upload(&self.endpoint(), local, remote)?)
    }

    pub fn download(&self, remote: &str, local: &Path) -> Result<()> {
        info!(host = %self.host, "get: {remote} → {}", local.display());

        Ok(self.transport.download(&self.endpoint(), remote, local)?)
    }
}

/// whether the local machine already sits inside `domain`
fn inside_domain(domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().contains(domain),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve the local hostname, assuming a gateway is needed");

            false
        }
    }
}
