use crate::{
    connection::RunOptions,
    error::{Result, RunnerError},
    group::ConnectionGroup,
};
use once_cell::sync::OnceCell;
use roxmltree::{Document, Node, ParsingOptions};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

#[cfg(test)]
mod topology_test;

/// prints the hwloc XML descriptor of the machine on stdout
pub const TOPOLOGY_COMMAND: &str = "lstopo --of xml -";

/// object types that are walked through on the way down to the cores
const CONTAINERS: [&str; 11] = [
    "Machine", "NUMANode", "Package", "Group", "Die", "Cache", "L3Cache", "L2Cache", "L1Cache",
    "L1dCache", "L1iCache",
];

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Topology descriptor is not valid XML")]
    InvalidXml(#[from] roxmltree::Error),
    #[error("Topology descriptor holds no object")]
    Empty,
    #[error("Unexpected {kind} object inside a core")]
    UnexpectedChild { kind: String },
    #[error("Processing unit has no valid os_index: {value:?}")]
    InvalidIndex { value: Option<String> },
}

/// Processing units sharing one physical core. The first one is the physical unit,
/// the others are its hyperthread siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Core(pub Vec<u32>);

impl Core {
    pub fn physical(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn siblings(&self) -> &[u32] {
        self.0.get(1..).unwrap_or_default()
    }
}

/// Parse an hwloc XML descriptor into its cores, in document order
pub fn parse_cores(xml: &str) -> Result<Vec<Core>, TopologyError> {
    // lstopo always emits a DOCTYPE pointing at hwloc.dtd
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let document = Document::parse_with_options(xml, options)?;
    let machine = objects(document.root_element())
        .next()
        .ok_or(TopologyError::Empty)?;

    let mut cores = Vec::new();
    collect_cores(machine, &mut cores)?;

    Ok(cores)
}

/// every sibling hyperthread of `cores`, physical units left out
pub fn hyperthreads(cores: &[Core]) -> Vec<u32> {
    cores.iter().flat_map(|core| core.siblings()).copied().collect()
}

fn objects<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|child| child.is_element() && child.has_tag_name("object"))
}

fn collect_cores(node: Node, cores: &mut Vec<Core>) -> Result<(), TopologyError> {
    for child in objects(node) {
        match child.attribute("type") {
            Some("Core") => cores.push(parse_core(child)?),
            Some(kind) if CONTAINERS.contains(&kind) => collect_cores(child, cores)?,
            // devices, bridges and the like
            _ => {}
        }
    }

    Ok(())
}

fn parse_core(core: Node) -> Result<Core, TopologyError> {
    objects(core)
        .map(|unit| match unit.attribute("type") {
            Some("PU") => {
                let index = unit.attribute("os_index");

                index
                    .and_then(|value| value.parse::<u32>().ok())
                    .ok_or_else(|| TopologyError::InvalidIndex {
                        value: index.map(str::to_owned),
                    })
            }
            kind => Err(TopologyError::UnexpectedChild {
                kind: kind.unwrap_or("untyped").to_owned(),
            }),
        })
        .collect::<Result<_, _>>()
        .map(Core)
}

/// Hardware topology of a homogeneous group, computed once and kept. Each
/// `ConnectionGroup` owns one and only ever passes itself.
#[derive(Debug, Default)]
pub(crate) struct TopologyDiscoverer {
    cores: OnceCell<Vec<Core>>,
    hyperthreads: OnceCell<Vec<u32>>,
}

impl TopologyDiscoverer {
    /// Cores of the members of `group`, which must all report the same topology
    pub(crate) fn cores_for(&self, group: &ConnectionGroup) -> Result<&[Core]> {
        self.cores
            .get_or_try_init(|| discover(group))
            .map(Vec::as_slice)
    }

    pub(crate) fn hyperthreads_for(&self, group: &ConnectionGroup) -> Result<&[u32]> {
        self.hyperthreads
            .get_or_try_init(|| self.cores_for(group).map(hyperthreads))
            .map(Vec::as_slice)
    }

    /// Bring every hyperthread sibling of the group online or offline
    pub(crate) fn set_hyperthreading(&self, group: &ConnectionGroup, enabled: bool) -> Result<()> {
        let paths: Vec<String> = self
            .hyperthreads_for(group)?
            .iter()
            .map(|id| format!("/sys/devices/system/cpu/cpu{id}/online"))
            .collect();

        info!(
            group = %group.name(),
            "{} {} hyperthreads",
            if enabled { "Enabling" } else { "Disabling" },
            paths.len()
        );

        if paths.is_empty() {
            return Ok(());
        }

        let targets: Vec<&str> = paths.iter().map(String::as_str).collect();
        group.write_content(if enabled { "1" } else { "0" }, &targets)
    }
}

fn discover(group: &ConnectionGroup) -> Result<Vec<Core>> {
    let outputs = group.run(TOPOLOGY_COMMAND, &RunOptions::new().with_output())?;
    let mut reference: Option<(&str, Vec<Core>)> = None;

    for host in group.hostnames() {
        let Some(output) = outputs.get(host) else {
            continue;
        };

        let cores = parse_cores(&output.stdout).map_err(|error| {
            error!(host = %host, "Failed to parse the topology: {error}");
            error
        })?;

        match &reference {
            None => reference = Some((host, cores)),
            Some((first, expected)) if *expected != cores => {
                return Err(RunnerError::TopologyMismatch {
                    reference: first.to_string(),
                    host: host.to_owned(),
                })
            }
            Some(_) => {}
        }
    }

    let (host, cores) = reference.ok_or_else(|| {
        RunnerError::Precondition(format!("group {} has no member to inspect", group.name()))
    })?;
    debug!(host = %host, cores = cores.len(), "Discovered the topology of {}", group.name());

    Ok(cores)
}
