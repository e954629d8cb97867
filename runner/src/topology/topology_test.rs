use super::{hyperthreads, parse_cores, Core, TopologyError, TOPOLOGY_COMMAND};
use crate::{
    connection::Connection,
    error::RunnerError,
    group::ConnectionGroup,
    test_utils::FakeCluster,
};
use std::sync::Arc;

/// 2 packages x 2 cores x 2 PUs, hyperthreads numbered after the physical units
const TWO_SOCKETS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE topology SYSTEM "hwloc.dtd">
<topology>
  <object type="Machine" os_index="0">
    <info name="Backend" value="Linux"/>
    <object type="NUMANode" os_index="0">
      <object type="Package" os_index="0">
        <object type="L3Cache" cache_size="15728640">
          <object type="L2Cache">
            <object type="L1Cache">
              <object type="Core" os_index="0">
                <object type="PU" os_index="0"/>
                <object type="PU" os_index="4"/>
              </object>
            </object>
          </object>
          <object type="L2Cache">
            <object type="L1Cache">
              <object type="Core" os_index="1">
                <object type="PU" os_index="1"/>
                <object type="PU" os_index="5"/>
              </object>
            </object>
          </object>
        </object>
      </object>
    </object>
    <object type="NUMANode" os_index="1">
      <object type="Package" os_index="1">
        <object type="Core" os_index="0">
          <object type="PU" os_index="2"/>
          <object type="PU" os_index="6"/>
        </object>
        <object type="Core" os_index="1">
          <object type="PU" os_index="3"/>
          <object type="PU" os_index="7"/>
        </object>
      </object>
    </object>
    <object type="Bridge" os_index="0">
      <object type="PCIDev" os_index="1"/>
    </object>
  </object>
</topology>
"#;

const SINGLE_CORE: &str = r#"<topology>
  <object type="Machine">
    <object type="Core"><object type="PU" os_index="0"/></object>
  </object>
</topology>"#;

fn cluster_with(topologies: &'static [(&'static str, &'static str)]) -> (FakeCluster, ConnectionGroup) {
    let cluster = serving(topologies);
    let group = group_of(&cluster, "allnodes", &["taurus-1", "taurus-2", "taurus-3"]);

    (cluster, group)
}

fn serving(topologies: &'static [(&'static str, &'static str)]) -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.respond(TOPOLOGY_COMMAND, move |request| {
        let xml = topologies
            .iter()
            .find(|(host, _)| *host == request.host)
            .map(|(_, xml)| *xml)
            .unwrap_or(TWO_SOCKETS);

        FakeCluster::ok(xml)
    });

    cluster
}

fn group_of(cluster: &FakeCluster, name: &str, hosts: &[&str]) -> ConnectionGroup {
    let members = hosts
        .iter()
        .map(|host| Arc::new(Connection::new(*host, "root", cluster.transport())))
        .collect();

    ConnectionGroup::new(name, members, "/tmp").unwrap()
}

#[test]
fn cores_are_listed_in_document_order() {
    let cores = parse_cores(TWO_SOCKETS).unwrap();

    assert_eq!(
        cores,
        [
            Core(vec![0, 4]),
            Core(vec![1, 5]),
            Core(vec![2, 6]),
            Core(vec![3, 7])
        ]
    );
    assert_eq!(cores[2].physical(), Some(2));
}

#[test]
fn lstopo_doctype_is_accepted() {
    assert!(TWO_SOCKETS.contains("<!DOCTYPE topology SYSTEM \"hwloc.dtd\">"));
    assert_eq!(parse_cores(TWO_SOCKETS).unwrap().len(), 4);

    let bare = "<!DOCTYPE topology SYSTEM \"hwloc.dtd\"><topology>\
        <object type=\"Machine\"><object type=\"Core\"><object type=\"PU\" os_index=\"3\"/></object></object>\
        </topology>";
    assert_eq!(parse_cores(bare).unwrap(), [Core(vec![3])]);
}

#[test]
fn hyperthreads_are_the_second_units() {
    let cores = parse_cores(TWO_SOCKETS).unwrap();
    let mut siblings = hyperthreads(&cores);
    siblings.sort_unstable();

    assert_eq!(siblings, [4, 5, 6, 7]);
    assert!(hyperthreads(&parse_cores(SINGLE_CORE).unwrap()).is_empty());
}

#[test]
fn foreign_objects_inside_a_core_are_rejected() {
    let xml = r#"<topology><object type="Machine">
        <object type="Core"><object type="L1Cache"/></object>
    </object></topology>"#;

    assert!(matches!(
        parse_cores(xml),
        Err(TopologyError::UnexpectedChild { kind }) if kind == "L1Cache"
    ));
}

#[test]
fn missing_os_index_is_rejected() {
    let xml = r#"<topology><object type="Machine">
        <object type="Core"><object type="PU" os_index="first"/></object>
    </object></topology>"#;

    assert!(matches!(
        parse_cores(xml),
        Err(TopologyError::InvalidIndex { value: Some(value) }) if value == "first"
    ));
    assert!(matches!(parse_cores("<topology/>"), Err(TopologyError::Empty)));
    assert!(matches!(parse_cores("<topology"), Err(TopologyError::InvalidXml(_))));
}

#[test]
fn homogeneous_group_is_discovered_once() {
    let (cluster, group) = cluster_with(&[]);

    assert_eq!(group.cores().unwrap().len(), 4);
    assert_eq!(group.hyperthreads().unwrap().len(), 4);
    assert_eq!(group.cores().unwrap().len(), 4);

    assert_eq!(cluster.count_commands(TOPOLOGY_COMMAND), 3);
}

#[test]
fn heterogeneous_group_names_both_hosts() {
    let (_, group) = cluster_with(&[("taurus-3", SINGLE_CORE)]);

    match group.cores() {
        Err(RunnerError::TopologyMismatch { reference, host }) => {
            assert_eq!(reference, "taurus-1");
            assert_eq!(host, "taurus-3");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn hyperthreading_is_toggled_in_one_write() {
    let (cluster, group) = cluster_with(&[]);

    group.set_hyperthreading(false).unwrap();

    for host in ["taurus-1", "taurus-2", "taurus-3"] {
        let commands = cluster.commands_on(host);
        assert_eq!(commands.len(), 2);
        assert!(commands[1].starts_with("cd /tmp && printf %s 0 | tee /sys/devices/system/cpu/cpu4/online"));

        for id in 4..8 {
            let path = format!("/sys/devices/system/cpu/cpu{id}/online");
            assert_eq!(cluster.file(host, &path).unwrap(), "0");
        }
        assert!(cluster.file(host, "/sys/devices/system/cpu/cpu0/online").is_none());
    }

    // the topology is cached, only the write goes out again
    group.set_hyperthreading(true).unwrap();
    assert_eq!(cluster.commands_on("taurus-1").len(), 3);
    assert_eq!(cluster.file("taurus-1", "/sys/devices/system/cpu/cpu7/online").unwrap(), "1");
}

#[test]
fn every_group_keeps_its_own_topology() {
    let cluster = serving(&[("sagittaire-1", SINGLE_CORE), ("sagittaire-2", SINGLE_CORE)]);
    let taurus = group_of(&cluster, "taurus", &["taurus-1", "taurus-2"]);
    let sagittaire = group_of(&cluster, "sagittaire", &["sagittaire-1", "sagittaire-2"]);

    assert_eq!(taurus.cores().unwrap().len(), 4);
    assert_eq!(sagittaire.cores().unwrap(), [Core(vec![0])]);
    assert!(sagittaire.hyperthreads().unwrap().is_empty());
    assert_eq!(taurus.hyperthreads().unwrap().len(), 4);

    assert_eq!(cluster.count_commands(TOPOLOGY_COMMAND), 4);
}
