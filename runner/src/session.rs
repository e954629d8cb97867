use crate::{
    backoff::{Backoff, Sleeper, ThreadSleeper},
    collector::{InformationCollector, PlatformInformation},
    config::RunnerConfig,
    connection::{Connection, ConnectionHandle},
    error::Result,
    group::ConnectionGroup,
    reservation::Reservation,
    scheduler::{Access, JobId, Request, Walltime},
    transport::{SshTransport, Transport},
};
use parking_lot::Mutex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::DefaultFields, format::Format, MakeWriter},
    registry::LookupSpan,
};

/// In-memory sink for the log lines of a session
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

/// appends to a `CommandLog`
pub struct CommandLogWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CommandLogWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(bytes);

        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CommandLog {
    type Writer = CommandLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CommandLogWriter {
            buffer: self.buffer.clone(),
        }
    }
}

impl CommandLog {
    /// everything logged so far, non-ASCII characters dropped
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock())
            .chars()
            .filter(char::is_ascii)
            .collect()
    }
}

/// Everything one orchestration run shares: configuration, the way to reach remote
/// hosts, the pacing of polls and the command log.
pub struct Session {
    config: Arc<RunnerConfig>,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    frontend: ConnectionHandle,
    log: CommandLog,
}

impl Session {
    /// Session over ssh, connecting to the frontend on first use
    pub fn new(config: RunnerConfig) -> Self {
        let transport = Arc::new(SshTransport::load(&config.ssh));

        Self::with_transport(config, transport, Arc::new(ThreadSleeper))
    }

    pub fn with_transport(
        config: RunnerConfig,
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let frontend = Connection::frontend(&config.frontend, transport.clone());

        Self {
            config: Arc::new(config),
            transport,
            sleeper,
            frontend,
            log: CommandLog::default(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::load(&self.config.backoff, self.sleeper.clone())
    }

    /// Group holding the frontend alone, working in the user's home
    pub fn frontend(&self) -> Result<ConnectionGroup> {
        ConnectionGroup::new(
            self.config.frontend.site.clone(),
            vec![self.frontend.clone()],
            self.config.frontend.working_dir(),
        )
        .map(|group| group.with_inline_threshold(self.config.transfer.inline_threshold))
    }

    /// Request preset with the configured job name and queue
    pub fn request(&self, constraint: impl Into<String>, nodes: usize, walltime: Walltime) -> Request {
        Request::new(constraint, nodes, walltime)
            .named(self.config.scheduler.job_name.clone())
            .in_queue(self.config.scheduler.queue.clone())
    }

    pub fn submit(&self, request: &Request) -> Result<Reservation> {
        Reservation::submit(request, self.frontend()?, self.config.clone(), self.backoff())
    }

    pub fn attach(&self, job: JobId, access: Access) -> Result<Reservation> {
        Reservation::attach(job, access, self.frontend()?, self.config.clone(), self.backoff())
    }

    /// Reservations for every running or waiting job of the user
    pub fn existing(&self) -> Result<Vec<Reservation>> {
        Reservation::existing_jobs(&self.frontend()?, &self.config.scheduler.default_image)?
            .into_iter()
            .map(|(job, access)| {
                info!(job = %job, "Attaching to existing job");
                self.attach(job, access)
            })
            .collect()
    }

    /// Layer sending formatted events to the command log of this session. Installing
    /// it is up to the caller.
    pub fn log_layer<S>(&self) -> fmt::Layer<S, DefaultFields, Format, CommandLog>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fmt::layer()
            .with_writer(self.log.clone())
            .with_ansi(false)
            .with_target(false)
    }

    pub fn command_log(&self) -> String {
        self.log.contents()
    }

    /// Write the command log to `path`
    pub fn flush_log(&self, path: &Path) -> Result<()> {
        fs::write(path, self.command_log())?;
        info!(path = ?path, "Wrote command log");

        Ok(())
    }

    /// Collect the platform information of `reservation`, add the command log and
    /// fetch `archive` from its director
    pub fn package(
        &self,
        reservation: &Reservation,
        archive: &str,
        local: &Path,
        information: Option<&PlatformInformation>,
    ) -> Result<PathBuf> {
        let collector = InformationCollector::new(reservation);
        let information = match information {
            Some(information) => information.clone(),
            None => collector.platform_information()?,
        };

        collector.package(archive, local, &information, &self.command_log())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backoff::tests::RecordingSleeper, connection::RunOptions, test_utils::FakeCluster};
    use tracing_subscriber::{layer::SubscriberExt, Registry};

    fn config() -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.frontend.site = "lyon".to_owned();
        config.frontend.user = "alice".to_owned();
        config.scheduler.queue = Some("production".to_owned());
        // tests run outside the testbed
        config.frontend.domain = "testbed.invalid".to_owned();

        config
    }

    fn session(cluster: &FakeCluster) -> Session {
        Session::with_transport(config(), cluster.transport(), Arc::new(RecordingSleeper::default()))
    }

    #[test]
    fn frontend_is_reached_through_the_gateway() {
        let cluster = FakeCluster::new();
        let session = session(&cluster);
        let frontend = session.frontend().unwrap();

        frontend.run("oarstat", &RunOptions::new()).unwrap();

        let endpoint = frontend.members()[0].endpoint();
        assert_eq!(endpoint.destination(), "alice@lyon");
        assert_eq!(endpoint.jumps, ["alice@access.testbed.invalid"]);
        assert_eq!(
            cluster.commands_on("lyon"),
            ["cd /home/alice && oarstat > /dev/null 2>&1"]
        );
    }

    #[test]
    fn default_config_crosses_the_access_gateway() {
        let cluster = FakeCluster::new();
        let mut config = RunnerConfig::default();
        config.frontend.site = "lyon".to_owned();
        config.frontend.user = "alice".to_owned();

        let session = Session::with_transport(config, cluster.transport(), Arc::new(RecordingSleeper::default()));
        let frontend = session.frontend().unwrap();

        let endpoint = frontend.members()[0].endpoint();
        assert_eq!(endpoint.destination(), "alice@lyon");
        assert_eq!(endpoint.jumps, ["alice@access.grid5000.fr"]);
    }

    #[test]
    fn requests_carry_the_configured_queue() {
        let cluster = FakeCluster::new();
        let request = session(&cluster).request("{cluster in ('taurus')}", 2, Walltime::new(1, 0, 0).unwrap());

        assert_eq!(request.name, "orchestra");
        assert_eq!(request.queue.as_deref(), Some("production"));
    }

    #[test]
    fn command_log_captures_group_commands() {
        let cluster = FakeCluster::new();
        let session = session(&cluster);
        let subscriber = Registry::default().with(session.log_layer());

        tracing::subscriber::with_default(subscriber, || {
            session
                .frontend()
                .unwrap()
                .run("uptime", &RunOptions::new())
                .unwrap();
        });

        let log = session.command_log();
        assert!(log.contains("[lyon | /home/alice] uptime"));
        assert!(log.is_ascii());

        let target = tempfile::NamedTempFile::new().unwrap();
        session.flush_log(target.path()).unwrap();
        assert_eq!(fs::read_to_string(target.path()).unwrap(), log);
    }

    #[test]
    fn non_ascii_is_dropped_from_the_log() {
        let log = CommandLog::default();
        io::Write::write_all(&mut log.make_writer(), "put: a → b\n".as_bytes()).unwrap();

        assert_eq!(log.contents(), "put: a  b\n");
    }

    #[test]
    fn existing_jobs_are_attached() {
        let cluster = FakeCluster::new();
        cluster.respond("oarstat -J -u", |_| {
            FakeCluster::ok(r#"{"21": {"state": "Running", "types": ["deploy"]}}"#)
        });

        let reservations = session(&cluster).existing().unwrap();

        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].job(), JobId(21));
        assert_eq!(
            reservations[0].access(),
            &Access::Reimaged("debian9-x64-min".to_owned())
        );
    }

    /// Needs a testbed account: ORCHESTRA_SITE, ORCHESTRA_USER and ORCHESTRA_CLUSTER
    #[test]
    #[ignore]
    fn live_reservation() {
        let mut config = RunnerConfig::default();
        config.frontend.site = std::env::var("ORCHESTRA_SITE").unwrap();
        config.frontend.user = std::env::var("ORCHESTRA_USER").unwrap();
        let cluster = std::env::var("ORCHESTRA_CLUSTER").unwrap();
        assert!(!config.preflight_checks());

        let session = Session::new(config);
        let request = session.request(
            crate::scheduler::cluster_constraint(&[&cluster]),
            2,
            Walltime::new(0, 15, 0).unwrap(),
        );
        let reservation = session.submit(&request).unwrap();

        let hostnames = reservation.hostnames().unwrap().to_vec();
        assert_eq!(hostnames.len(), 2);
        assert!(hostnames.iter().all(|host| host.starts_with(&cluster)));

        let nodes = reservation.nodes().unwrap();
        let pwd = nodes.all.run_uniform("pwd", &RunOptions::new().with_output()).unwrap();
        assert_eq!(pwd.stdout.trim(), "/tmp");
        assert!(!nodes.all.cores().unwrap().is_empty());

        reservation.release();
        reservation.release();
    }
}
