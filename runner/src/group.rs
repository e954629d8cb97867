use crate::{
    connection::{ConnectionHandle, RunOptions},
    error::{Result, RunnerError},
    shell::{self, DISCARD_OUTPUT},
    topology::{Core, TopologyDiscoverer},
    transport::RunOutput,
};
use itertools::Itertools;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, HashSet},
    io::{self, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument};

/// content below this many characters is written with an inline command
pub const DEFAULT_INLINE_THRESHOLD: usize = 80;

/// per-host results of a group-wide command
pub type GroupOutput = BTreeMap<String, RunOutput>;

/// A named set of connections sharing a working directory. Every command is issued
/// identically to all members.
#[derive(Debug)]
pub struct ConnectionGroup {
    name: String,
    members: Vec<ConnectionHandle>,
    working_dir: String,
    inline_threshold: usize,
    topology: TopologyDiscoverer,
}

impl ConnectionGroup {
    pub fn new(
        name: impl Into<String>,
        members: Vec<ConnectionHandle>,
        working_dir: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();

        let mut seen = HashSet::new();
        if let Some(member) = members.iter().find(|member| !seen.insert(member.host())) {
            return Err(RunnerError::Precondition(format!(
                "{} appears more than once in group {name}",
                member.host()
            )));
        }

        Ok(Self {
            name,
            members,
            working_dir: working_dir.into(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            topology: TopologyDiscoverer::default(),
        })
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[ConnectionHandle] {
        &self.members
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.members.iter().map(|member| member.host()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Run `command` on every member concurrently. The command runs inside the
    /// working directory (or `options.directory` resolved against it) with its output
    /// discarded unless `options.show_output` is set.
    #[instrument(level = "debug", skip_all, fields(group = %self.name))]
    pub fn run(&self, command: &str, options: &RunOptions) -> Result<GroupOutput> {
        let directory = match &options.directory {
            Some(directory) => shell::join(&self.working_dir, directory),
            None => self.working_dir.clone(),
        };

        info!("[{} | {}] {command}", self.name, directory);

        let command = if options.show_output {
            command.to_owned()
        } else {
            format!("{command}{DISCARD_OUTPUT}")
        };
        let member_options = RunOptions {
            directory: (!directory.is_empty()).then_some(directory),
            ..options.clone()
        };

        // one slot per member, filled by its own worker
        let outcomes: Vec<(String, Result<RunOutput>)> = self
            .members
            .par_iter()
            .map(|member| (member.host().to_owned(), member.run(&command, &member_options)))
            .collect();

        let mut results = GroupOutput::new();
        let mut failures = Vec::new();

        for (host, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    results.insert(host, output);
                }
                Err(error) => {
                    error!(host = %host, group = %self.name, "{error}");
                    failures.push((host, error));
                }
            }
        }

        if failures.is_empty() {
            Ok(results)
        } else {
            Err(RunnerError::Group {
                group: self.name.clone(),
                failures,
            })
        }
    }

    /// `run`, additionally requiring every member to print exactly what the first one
    /// printed. Returns the output of the first member.
    pub fn run_uniform(&self, command: &str, options: &RunOptions) -> Result<RunOutput> {
        let Some(first) = self.members.first() else {
            return Err(RunnerError::Precondition(format!(
                "group {} has no member to compare outputs of",
                self.name
            )));
        };

        let mut results = self.run(command, options)?;
        let reference = results.remove(first.host()).ok_or_else(|| {
            RunnerError::Precondition(format!("no output from {}", first.host()))
        })?;

        for member in &self.members[1..] {
            let output = &results[member.host()];

            if output.stdout != reference.stdout || output.stderr != reference.stderr {
                debug!(
                    reference = ?reference.stdout,
                    divergent = ?output.stdout,
                    "Outputs differ in {}",
                    self.name
                );

                return Err(RunnerError::Inconsistency {
                    group: self.name.clone(),
                    reference: reference.host,
                    host: member.host().to_owned(),
                });
            }
        }

        Ok(reference)
    }

    /// Upload `local` to every member, one after the other
    pub fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let remote = shell::join(&self.working_dir, remote);
        info!("[{}] put: {} → {remote}", self.name, local.display());

        let failures = self
            .members
            .iter()
            .filter_map(|member| {
                member
                    .upload(local, &remote)
                    .err()
                    .map(|error| (member.host().to_owned(), error))
            })
            .collect_vec();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Group {
                group: self.name.clone(),
                failures,
            })
        }
    }

    /// Fetch `remote` from the single member of this group
    pub fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let [member] = self.members.as_slice() else {
            return Err(RunnerError::Precondition(format!(
                "download needs exactly one host, {} has {}",
                self.name,
                self.members.len()
            )));
        };

        let remote = shell::join(&self.working_dir, remote);
        info!("[{}] get: {remote} → {}", self.name, local.display());

        member.download(&remote, local)
    }

    /// Write `content` to every path of `targets` on every member. Short content is
    /// piped through `tee` inline, anything else is uploaded once to the first target
    /// and copied remotely to the others.
    #[instrument(level = "debug", skip_all, fields(group = %self.name, targets = targets.len()))]
    pub fn write_content(&self, content: &str, targets: &[&str]) -> Result<()> {
        let Some((first, rest)) = targets.split_first() else {
            return Err(RunnerError::Precondition(
                "write_content needs at least one target".to_owned(),
            ));
        };

        let options = RunOptions::new();

        if content.chars().count() < self.inline_threshold {
            let command = format!(
                "printf %s {} | tee {}",
                shell::escape(content),
                targets.iter().map(|target| shell::escape(target)).join(" ")
            );
            self.run(&command, &options)?;

            return Ok(());
        }

        let file = local_copy(content)?;

        self.upload(file.path(), first)?;

        if !rest.is_empty() {
            let command = format!(
                "cat {} | tee {}",
                shell::escape(first),
                rest.iter().map(|target| shell::escape(target)).join(" ")
            );
            self.run(&command, &options)?;
        }

        Ok(())
    }

    /// Cores of the members, discovered on first use and cached for this group. Fails
    /// when members disagree.
    pub fn cores(&self) -> Result<&[Core]> {
        self.topology.cores_for(self)
    }

    pub fn hyperthreads(&self) -> Result<&[u32]> {
        self.topology.hyperthreads_for(self)
    }

    pub fn set_hyperthreading(&self, enabled: bool) -> Result<()> {
        self.topology.set_hyperthreading(self, enabled)
    }
}

fn local_copy(content: &str) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;

    Ok(file)
}
