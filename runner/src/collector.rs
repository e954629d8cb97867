use crate::{
    connection::RunOptions,
    error::Result,
    reservation::Reservation,
    scheduler::JobId,
    shell,
};
use itertools::Itertools;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// (name, command) of the values recorded for every node
const PROBES: [(&str, &str); 5] = [
    ("kernel", "uname -r"),
    ("version", "cat /proc/version"),
    ("gcc", "gcc -dumpversion"),
    ("mpi", "mpirun --version | head -n 1"),
    ("cpu", "cat /proc/cpuinfo | grep name | uniq | cut -d: -f2"),
];

/// (file, command creating it) of the raw dumps gathered from every node
const RAW_FILES: [(&str, &str); 5] = [
    ("cpuinfo.txt", "cp /proc/cpuinfo cpuinfo.txt"),
    ("environment.txt", "env > environment.txt"),
    ("topology.xml", "lstopo --force topology.xml"),
    ("lspci.txt", "lspci -v > lspci.txt"),
    ("dmidecode.txt", "dmidecode > dmidecode.txt"),
];

/// staging directory of the raw dumps on the director
const RAW_DIRECTORY: &str = "information";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostInformation {
    /// probe name -> trimmed output
    #[serde(flatten)]
    pub probes: BTreeMap<String, String>,
    /// neighbour -> its `arp -a` entries
    pub arp: BTreeMap<String, Vec<String>>,
}

/// What the nodes of a reservation run on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformInformation {
    pub site: String,
    pub jobid: JobId,
    pub deployment: bool,
    pub command: String,
    pub hosts: BTreeMap<String, HostInformation>,
    /// free-form additions of the caller, e.g. start and stop dates
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Gathers the environment of the nodes of a reservation
pub struct InformationCollector<'a> {
    reservation: &'a Reservation,
}

impl<'a> InformationCollector<'a> {
    pub fn new(reservation: &'a Reservation) -> Self {
        Self { reservation }
    }

    fn sudo(&self, command: &str) -> String {
        if self.reservation.is_reimaged() {
            command.to_owned()
        } else {
            format!("sudo-g5k {command}")
        }
    }

    /// Run every probe on every node. Differences between nodes are only warned about.
    pub fn platform_information(&self) -> Result<PlatformInformation> {
        let all = self.reservation.all()?;
        let mut hosts: BTreeMap<String, HostInformation> = all
            .hostnames()
            .into_iter()
            .map(|host| (host.to_owned(), HostInformation::default()))
            .collect();
        let options = RunOptions::new().with_output();

        for (name, command) in PROBES {
            let outputs = all.run(command, &options)?;

            for (host, output) in &outputs {
                if let Some(information) = hosts.get_mut(host) {
                    information
                        .probes
                        .insert(name.to_owned(), output.stdout.trim().to_owned());
                }
            }

            if outputs.values().map(|output| output.stdout.trim()).unique().count() > 1 {
                warn!("Different settings found for {name} (command {command})");
            }
        }

        for (host, output) in all.run(&self.sudo("arp -a"), &options)? {
            if let Some(information) = hosts.get_mut(&host) {
                information.arp = parse_arp(&output.stdout);
            }
        }

        Ok(PlatformInformation {
            site: self.reservation.site().to_owned(),
            jobid: self.reservation.job(),
            deployment: self.reservation.is_reimaged(),
            command: env::args().join(" "),
            hosts,
            extra: BTreeMap::new(),
        })
    }

    /// Dump raw hardware and environment descriptions of every node into `archive`
    /// on the director
    pub fn collect_raw_information(&self, archive: &str) -> Result<()> {
        let nodes = self.reservation.nodes()?;
        let director = nodes.director.hostnames()[0].to_owned();
        let options = RunOptions::new();

        for host in nodes.all.hostnames() {
            nodes
                .director
                .run(&format!("mkdir -p {}", shell::escape(&format!("{RAW_DIRECTORY}/{host}"))), &options)?;
        }

        for (file, command) in RAW_FILES {
            nodes.all.run(&self.sudo(command), &options)?;
            nodes.director.run(
                &format!("cp {file} {}", shell::escape(&format!("{RAW_DIRECTORY}/{director}"))),
                &options,
            )?;

            for host in nodes.orchestra.hostnames() {
                let remote = shell::join(nodes.orchestra.working_dir(), file);

                nodes.director.run(
                    &format!(
                        "scp {}:{remote} {}",
                        shell::escape(host),
                        shell::escape(&format!("{RAW_DIRECTORY}/{host}"))
                    ),
                    &options,
                )?;
            }
        }

        nodes.director.run(
            &format!("zip -ru {} {RAW_DIRECTORY}", shell::escape(archive)),
            &options,
        )?;
        nodes.director.run(&format!("rm -rf {RAW_DIRECTORY}"), &options)?;

        info!(archive = %archive, "Collected raw information of {} node(s)", nodes.all.len());

        Ok(())
    }

    /// Add `info`, the scheduler record and `command_log` to `archive` on the director,
    /// then fetch it to `local`
    pub fn package(
        &self,
        archive: &str,
        local: &Path,
        info: &PlatformInformation,
        command_log: &str,
    ) -> Result<PathBuf> {
        let director = self.reservation.director()?;
        let status = self.reservation.status()?;

        let files = [
            ("info.yaml", serde_yaml::to_string(info)?),
            ("oarstat.yaml", serde_yaml::to_string(&status)?),
            ("commands.log", command_log.to_owned()),
        ];

        for (name, content) in &files {
            director.write_content(content, &[*name])?;
        }

        let names = files.iter().map(|(name, _)| *name).join(" ");
        let options = RunOptions::new();
        director.run(&format!("zip -u {} {names}", shell::escape(archive)), &options)?;
        director.run(&format!("rm -f {names}"), &options)?;
        director.download(archive, local)?;

        info!(archive = %local.display(), "Packaged results of job {}", self.reservation.job());

        Ok(local.to_path_buf())
    }
}

/// Group the lines of `arp -a` by neighbour
pub fn parse_arp(output: &str) -> BTreeMap<String, Vec<String>> {
    let mut neighbours: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for line in output.lines() {
        let mut words = line.split_whitespace();

        if let Some(neighbour) = words.next() {
            neighbours
                .entry(neighbour.to_owned())
                .or_default()
                .push(words.join(" "));
        }
    }

    neighbours
}
