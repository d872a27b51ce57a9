//! Process-wide NUMA topology.
//!
//! The topology is discovered once, from sysfs, on first use. A system without `/sys/devices/system/node` is treated
//! as a single node.

use std::{fs, io, path::Path, sync::OnceLock};

use tieralloc_core::{BindError, NodeIndex, NumaTopology};

use crate::platform;

static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();

const SYSFS_NODES: &str = "/sys/devices/system/node";

/// Returns the topology of the system, detecting it on first call.
pub fn detect() -> &'static NumaTopology {
    TOPOLOGY.get_or_init(|| {
        let topology = read_sysfs(Path::new(SYSFS_NODES));

        log::info!("Detected {} NUMA node(s), NUMA {}",
            topology.node_count(), if topology.is_available() { "available" } else { "unavailable" });

        topology
    })
}

/// Returns the node the calling thread is running on, or node 0 if unknown.
pub fn current_node() -> NodeIndex {
    platform::current_cpu()
        .map(|cpu| detect().node_of_cpu(cpu))
        .unwrap_or_default()
}

/// Sets the memory policy of the calling thread to prefer `node`.
pub fn bind_thread(node: NodeIndex) -> Result<(), BindError> {
    let topology = detect();

    if !topology.is_available() {
        return Err(BindError::Unavailable);
    }

    if !topology.contains(node) {
        return Err(BindError::InvalidNode(node));
    }

    let mask: libc::c_ulong = 1 << node.index();

    platform::set_preferred_node(&mask)
}

//
//  Implementation
//

//  Reads the topology described under `root`, laid out as `/sys/devices/system/node`.
fn read_sysfs(root: &Path) -> NumaTopology {
    match read_nodes(root) {
        Ok(nodes) => {
            let descriptions = nodes.iter()
                .map(|(node, cpu_list, meminfo)| (*node, cpu_list.as_str(), meminfo.as_deref()));

            NumaTopology::from_nodes(descriptions)
        },
        Err(error) => {
            log::debug!("No NUMA information under {}: {}", root.display(), error);

            NumaTopology::single_node()
        },
    }
}

fn read_nodes(root: &Path) -> io::Result<Vec<(usize, String, Option<String>)>> {
    let mut nodes = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();

        let Some(node) = name.to_str().and_then(parse_node_name) else { continue };

        let path = entry.path();

        let cpu_list = match fs::read_to_string(path.join("cpulist")) {
            Ok(cpu_list) => cpu_list,
            Err(error) => {
                log::debug!("Skipping {}: {}", path.display(), error);
                continue;
            },
        };

        let meminfo = fs::read_to_string(path.join("meminfo")).ok();

        nodes.push((node, cpu_list, meminfo));
    }

    nodes.sort_unstable_by_key(|(node, _, _)| *node);

    Ok(nodes)
}

//  Parses "node<N>".
fn parse_node_name(name: &str) -> Option<usize> {
    name.strip_prefix("node")?.parse().ok()
}

// mod tests
