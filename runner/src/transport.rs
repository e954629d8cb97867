use crate::config::SshConfig;
use itertools::Itertools;
use std::{
    fmt::{self, Debug},
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// exit status used by ssh itself when the connection could not be set up
const SSH_FAILURE_STATUS: i32 = 255;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while talking to {host}")]
    Io {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{host} did not answer within {timeout:?}")]
    Timeout { host: String, timeout: Duration },
    #[error("{host} is unreachable: {message}")]
    Unreachable { host: String, message: String },
    #[error("Copy of {path:?} with {host} failed: {message}")]
    Copy {
        host: String,
        path: PathBuf,
        message: String,
    },
}

/// Address of a remote shell, including the relays to cross to reach it.
/// `jumps` is ordered from the outermost gateway inwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub user: String,
    pub jumps: Vec<String>,
}

impl Endpoint {
    /// `user@host` as understood by ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.jumps.is_empty() {
            write!(f, "{}", self.destination())
        } else {
            write!(f, "{} (via {})", self.destination(), self.jumps.join(" → "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// container for everything a remote command left behind
pub struct RunOutput {
    pub host: String,
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Moves commands and files between this process and remote shells.
/// No retries happen at this layer.
pub trait Transport: Send + Sync + Debug {
    fn execute(
        &self,
        endpoint: &Endpoint,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError>;

    fn upload(&self, endpoint: &Endpoint, local: &Path, remote: &str)
        -> Result<(), TransportError>;

    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Path,
    ) -> Result<(), TransportError>;
}

/// Transport backed by the OpenSSH client binaries, relays are crossed with `-J`
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    copy_program: String,
    connect_timeout: Duration,
    // applies when the caller gives no timeout of its own
    command_timeout: Option<Duration>,
    options: Vec<String>,
}

impl SshTransport {
    pub fn load(config: &SshConfig) -> Self {
        Self {
            program: config.program.clone(),
            copy_program: config.copy_program.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            command_timeout: config.command_timeout(),
            options: config.options.clone(),
        }
    }

    fn common_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];

        for option in self.options.iter() {
            args.push("-o".to_owned());
            args.push(option.clone());
        }

        if !endpoint.jumps.is_empty() {
            args.push("-J".to_owned());
            args.push(endpoint.jumps.iter().join(","));
        }

        args
    }

    /// argument vector for running `command` on `endpoint`
    pub fn command_args(&self, endpoint: &Endpoint, command: &str) -> Vec<String> {
        let mut args = self.common_args(endpoint);
        args.push(endpoint.destination());
        args.push("--".to_owned());
        args.push(command.to_owned());

        args
    }

    /// argument vector for copying `from` to `to`, either may be a `user@host:path`
    pub fn copy_args(&self, endpoint: &Endpoint, from: &str, to: &str) -> Vec<String> {
        let mut args = vec!["-q".to_owned()];
        args.extend(self.common_args(endpoint));
        args.push(from.to_owned());
        args.push(to.to_owned());

        args
    }

    fn copy(&self, endpoint: &Endpoint, from: &str, to: &str, path: &Path) -> Result<(), TransportError> {
        let args = self.copy_args(endpoint, from, to);
        trace!(program = %self.copy_program, args = ?args, "Starting copy");

        let output = Command::new(&self.copy_program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TransportError::Spawn {
                program: self.copy_program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Copy {
                host: endpoint.host.clone(),
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

/// drain a child pipe on its own thread, a full pipe would otherwise block the child
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(handle: thread::JoinHandle<io::Result<String>>, host: &str) -> Result<String, TransportError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "reader thread panicked")))
        .map_err(|source| TransportError::Io {
            host: host.to_owned(),
            source,
        })
}

fn wait(child: &mut Child, timeout: Option<Duration>, host: &str) -> Result<Option<i32>, TransportError> {
    let io_error = |source| TransportError::Io {
        host: host.to_owned(),
        source,
    };

    match timeout {
        Some(timeout) => match child.wait_timeout(timeout).map_err(io_error)? {
            Some(status) => Ok(status.code()),
            None => {
                // child hasn't exited yet
                if let Err(error) = child.kill() {
                    warn!(error = ?error, host = %host, "Failed to kill timed out ssh process");
                }
                let _ = child.wait();

                Err(TransportError::Timeout {
                    host: host.to_owned(),
                    timeout,
                })
            }
        },
        None => Ok(child.wait().map_err(io_error)?.code()),
    }
}

impl Transport for SshTransport {
    #[tracing::instrument(level = "debug", skip(self, endpoint), fields(host = %endpoint.host))]
    fn execute(
        &self,
        endpoint: &Endpoint,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError> {
        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(self.command_args(endpoint, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let code = wait(&mut child, timeout.or(self.command_timeout), &endpoint.host)?;
        let stdout = collect(stdout, &endpoint.host)?;
        let stderr = collect(stderr, &endpoint.host)?;

        debug!("Finished in {} ms | status: {code:?}", start.elapsed().as_millis());

        match code {
            // a remote command exiting with 255 itself is indistinguishable from this
            Some(SSH_FAILURE_STATUS) => Err(TransportError::Unreachable {
                host: endpoint.host.clone(),
                message: stderr.trim().to_owned(),
            }),
            Some(status) => Ok(RunOutput {
                host: endpoint.host.clone(),
                runtime: start.elapsed(),
                stdout,
                stderr,
                status,
            }),
            None => Err(TransportError::Unreachable {
                host: endpoint.host.clone(),
                message: "ssh was terminated by a signal".to_owned(),
            }),
        }
    }

    fn upload(&self, endpoint: &Endpoint, local: &Path, remote: &str) -> Result<(), TransportError> {
        let to = format!("{}:{remote}", endpoint.destination());
        self.copy(endpoint, &local.to_string_lossy(), &to, local)
    }

    fn download(&self, endpoint: &Endpoint, remote: &str, local: &Path) -> Result<(), TransportError> {
        let from = format!("{}:{remote}", endpoint.destination());
        self.copy(endpoint, &from, &local.to_string_lossy(), local)
    }
}
