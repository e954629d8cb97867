use crate::{
    backoff::{Attempt, Backoff},
    config::{ReleasePolicy, RunnerConfig},
    connection::{Connection, ConnectionHandle, RunOptions},
    error::{Result, RunnerError},
    group::ConnectionGroup,
    scheduler::{self, Access, JobId, JobStatus, Request, SchedulerError},
    shell,
};
use chrono::Local;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Where a reservation stands, see `Reservation::state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// submitted, the scheduler has not assigned nodes yet
    Resolving,
    /// nodes are known
    Resolved,
    /// nodes are being reinstalled
    Reimaging,
    /// connections to the nodes are open
    Connected,
    /// the job has been cancelled, terminal
    Released,
}

/// Connections to the nodes of a job. The director is the first host in
/// lexicographic order, the orchestra holds all the others.
#[derive(Debug)]
pub struct Nodes {
    pub all: ConnectionGroup,
    pub director: ConnectionGroup,
    pub orchestra: ConnectionGroup,
}

/// One job of the batch scheduler and the nodes it was given
#[derive(Debug)]
pub struct Reservation {
    job: JobId,
    access: Access,
    // single member group on the scheduler frontend
    frontend: ConnectionGroup,
    config: Arc<RunnerConfig>,
    backoff: Backoff,
    state: Mutex<ReservationState>,
    hostnames: OnceCell<Vec<String>>,
    nodes: OnceCell<Nodes>,
    released: AtomicBool,
}

impl Reservation {
    /// Submit `request` on the frontend and track the job it creates
    pub fn submit(
        request: &Request,
        frontend: ConnectionGroup,
        config: Arc<RunnerConfig>,
        backoff: Backoff,
    ) -> Result<Self> {
        let command = request.command(&Local::now())?;
        let output = frontend.run_uniform(&command, &RunOptions::new().with_output())?;
        let job = scheduler::parse_job_id(&output.stdout)?;

        info!(
            job = %job,
            "Submitted a job for {} node(s) matching {}",
            request.nodes,
            request.constraint
        );

        Self::attach(job, request.access.clone(), frontend, config, backoff)
    }

    /// Track a job that already exists
    pub fn attach(
        job: JobId,
        access: Access,
        frontend: ConnectionGroup,
        config: Arc<RunnerConfig>,
        backoff: Backoff,
    ) -> Result<Self> {
        if frontend.len() != 1 {
            return Err(RunnerError::Precondition(format!(
                "the frontend group needs exactly one host, {} has {}",
                frontend.name(),
                frontend.len()
            )));
        }

        debug!(job = %job, access = ?access, "Tracking job");

        Ok(Self {
            job,
            access,
            frontend,
            config,
            backoff,
            state: Mutex::new(ReservationState::Resolving),
            hostnames: OnceCell::new(),
            nodes: OnceCell::new(),
            released: AtomicBool::new(false),
        })
    }

    /// Running or waiting jobs of the frontend user. A failing query counts as no job
    /// at all, finding none is an error.
    pub fn existing_jobs(frontend: &ConnectionGroup, default_image: &str) -> Result<Vec<(JobId, Access)>> {
        let output = match frontend.run_uniform(
            scheduler::USER_JOBS_COMMAND,
            &RunOptions::new().with_output(),
        ) {
            Ok(output) => output.stdout,
            Err(error) if !error.is_transient() => {
                debug!(error = %error, "Job listing failed, assuming there is none");
                String::new()
            }
            Err(error) => return Err(error),
        };

        let jobs = scheduler::parse_jobs(&output)?
            .into_iter()
            .filter(|(_, status)| status.state.is_active())
            .map(|(job, status)| {
                let access = if status.is_reimage_job() {
                    Access::Reimaged(default_image.to_owned())
                } else {
                    Access::Direct
                };

                (job, access)
            })
            .collect_vec();

        if jobs.is_empty() {
            return Err(SchedulerError::NoJobs.into());
        }

        Ok(jobs)
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn is_reimaged(&self) -> bool {
        self.access.is_reimaged()
    }

    pub fn site(&self) -> &str {
        &self.config.frontend.site
    }

    pub fn frontend(&self) -> &ConnectionGroup {
        &self.frontend
    }

    pub fn state(&self) -> ReservationState {
        *self.state.lock()
    }

    fn set_state(&self, state: ReservationState) -> ReservationState {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        debug!(job = %self.job, "{previous:?} → {state:?}");

        previous
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            Err(RunnerError::Precondition(format!(
                "job {} has already been released",
                self.job
            )))
        } else {
            Ok(())
        }
    }

    /// Scheduler record of the job
    pub fn status(&self) -> Result<JobStatus> {
        let output = self
            .frontend
            .run_uniform(&self.job.status_command(), &RunOptions::new().with_output())?;

        Ok(scheduler::parse_status(&output.stdout, self.job)?)
    }

    /// node list of the job on the frontend
    pub fn node_file(&self) -> String {
        self.job.node_file()
    }

    /// Wait until the scheduler assigned nodes to the job
    pub fn resolve(&self) -> Result<()> {
        self.hostnames().map(|_| ())
    }

    /// Hosts of the job in lexicographic order, polling the scheduler with backoff
    /// on first use. Blocks for as long as the job waits for nodes.
    pub fn hostnames(&self) -> Result<&[String]> {
        self.ensure_live()?;

        self.hostnames
            .get_or_try_init(|| self.poll_hostnames())
            .map(Vec::as_slice)
    }

    /// hosts if they are already known, never polls
    pub fn try_hostnames(&self) -> Option<&[String]> {
        self.hostnames.get().map(Vec::as_slice)
    }

    fn poll_hostnames(&self) -> Result<Vec<String>> {
        let mut hosts = self.backoff.retry(&format!("host list of job {}", self.job), |_| {
            let status = self.status()?;

            if !status.assigned_network_address.is_empty() {
                Ok(Attempt::Ready(status.assigned_network_address))
            } else if status.state.is_finished() {
                Err(SchedulerError::Finished {
                    job: self.job,
                    state: String::from(status.state),
                }
                .into())
            } else {
                debug!(job = %self.job, state = ?status.state, "No node assigned yet");
                Ok(Attempt::Pending)
            }
        })?;

        hosts.sort();
        hosts.dedup();
        info!(job = %self.job, "Job runs on {}", hosts.join(", "));
        self.set_state(ReservationState::Resolved);

        Ok(hosts)
    }

    /// Reinstall the nodes with `image`, only for jobs submitted for reimaging
    pub fn reimage(&self, image: &str) -> Result<()> {
        if !self.is_reimaged() {
            return Err(RunnerError::Precondition(format!(
                "job {} was not submitted for reimaging",
                self.job
            )));
        }

        let hosts = self.hostnames()?;
        info!(job = %self.job, image = %image, "Reimaging {} node(s)", hosts.len());

        let previous = self.set_state(ReservationState::Reimaging);
        let result = self
            .frontend
            .run(&self.job.reimage_command(image), &RunOptions::new());
        self.set_state(previous);

        result.map(|_| ())
    }

    /// `reimage` with the image given at submission
    pub fn deploy(&self) -> Result<()> {
        match &self.access {
            Access::Reimaged(image) => self.reimage(image),
            Access::Direct => self.reimage(&self.config.scheduler.default_image),
        }
    }

    /// Connections to the nodes, opened on first use once every node answers
    pub fn nodes(&self) -> Result<&Nodes> {
        self.ensure_live()?;

        self.nodes.get_or_try_init(|| self.connect())
    }

    pub fn all(&self) -> Result<&ConnectionGroup> {
        Ok(&self.nodes()?.all)
    }

    pub fn director(&self) -> Result<&ConnectionGroup> {
        Ok(&self.nodes()?.director)
    }

    pub fn orchestra(&self) -> Result<&ConnectionGroup> {
        Ok(&self.nodes()?.orchestra)
    }

    /// login used on the nodes
    pub fn node_user(&self) -> &str {
        if self.is_reimaged() {
            &self.config.nodes.deploy_user
        } else {
            &self.config.frontend.user
        }
    }

    fn connect(&self) -> Result<Nodes> {
        let hosts = self.hostnames()?;
        let relay: &ConnectionHandle = &self.frontend.members()[0];
        let user = self.node_user();

        let connections: Vec<ConnectionHandle> = hosts
            .iter()
            .map(|host| {
                Arc::new(
                    Connection::new(host.clone(), user, relay.transport().clone())
                        .through(relay.clone()),
                )
            })
            .collect();

        let group = |name: &str, members: &[ConnectionHandle]| {
            ConnectionGroup::new(name, members.to_vec(), self.config.nodes.working_dir.clone())
                .map(|group| group.with_inline_threshold(self.config.transfer.inline_threshold))
        };
        let all = group("allnodes", &connections)?;
        let director = group("director", &connections[..1])?;
        let orchestra = group("orchestra", &connections[1..])?;

        // freshly reimaged nodes refuse connections for a while
        self.backoff
            .retry(&format!("nodes of job {}", self.job), |_| {
                all.run("hostname", &RunOptions::new())?;

                Ok(Attempt::Ready(()))
            })?;

        info!(job = %self.job, user = %user, "Connected to {} node(s)", all.len());
        self.set_state(ReservationState::Connected);

        Ok(Nodes {
            all,
            director,
            orchestra,
        })
    }

    fn sudo(&self) -> &'static str {
        if self.is_reimaged() {
            ""
        } else {
            "sudo-g5k "
        }
    }

    /// Upgrade the nodes and install `packages` with apt
    pub fn apt_install(&self, packages: &[&str]) -> Result<()> {
        let all = self.all()?;
        let sudo = self.sudo();
        let options = RunOptions::new();

        all.run(
            &format!(
                "{sudo}apt-get update && {sudo}DEBIAN_FRONTEND=noninteractive apt-get upgrade -yq"
            ),
            &options,
        )?;

        if packages.is_empty() {
            return Ok(());
        }

        all.run(
            &format!(
                "{sudo}DEBIAN_FRONTEND=noninteractive apt-get install -yq {}",
                packages.iter().map(|package| shell::escape(package)).join(" ")
            ),
            &options,
        )?;

        Ok(())
    }

    /// Let the director log into every orchestra node. Reimaged nodes only, the
    /// reference environment already shares the user's keys.
    pub fn distribute_director_key(&self) -> Result<()> {
        if !self.is_reimaged() {
            debug!(job = %self.job, "Nodes share the user's keys, nothing to distribute");
            return Ok(());
        }

        let nodes = self.nodes()?;
        let home = home_of(self.node_user());
        let in_home = RunOptions::new().in_directory(home.clone());

        nodes.director.run(
            "test -f .ssh/id_rsa || ssh-keygen -b 2048 -t rsa -f .ssh/id_rsa -q -N ''",
            &in_home,
        )?;

        if nodes.orchestra.is_empty() {
            return Ok(());
        }

        let key = NamedTempFile::new()?;
        nodes
            .director
            .download(&format!("{home}/.ssh/id_rsa.pub"), key.path())?;
        nodes.orchestra.upload(key.path(), "director_key.pub")?;
        nodes.orchestra.run(
            &format!(
                "cat {} >> .ssh/authorized_keys",
                shell::escape(&shell::join(nodes.orchestra.working_dir(), "director_key.pub"))
            ),
            &in_home,
        )?;

        // record the host keys under both the full and the short name
        for host in nodes.orchestra.hostnames() {
            let short = host.split('.').next().unwrap_or(host);

            for name in [host, short].into_iter().dedup() {
                nodes.director.run(
                    &format!("ssh -o StrictHostKeyChecking=no {} hostname", shell::escape(name)),
                    &in_home,
                )?;
            }
        }

        Ok(())
    }

    /// Cancel the job. Calling it again does nothing once the scheduler answered. A
    /// frontend that cannot be reached leaves the job live so that release can be retried,
    /// any other failure is only logged since the job may have expired on its own.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(job = %self.job, "Job was already released");
            return;
        }

        match self
            .frontend
            .run(&self.job.cancel_command(), &RunOptions::new())
        {
            Ok(_) => info!(job = %self.job, "Released job"),
            Err(error) if error.is_transient() => {
                self.released.store(false, Ordering::SeqCst);
                error!(job = %self.job, error = %error, "Failed to reach the frontend, job is still reserved");

                return;
            }
            Err(error) => {
                warn!(job = %self.job, error = %error, "Failed to release job, it may already be gone")
            }
        }

        self.set_state(ReservationState::Released);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.config.scheduler.release == ReleasePolicy::OnDrop {
            self.release();
        }
    }
}

fn home_of(user: &str) -> String {
    if user == "root" {
        "/root".to_owned()
    } else {
        format!("/home/{user}")
    }
}
