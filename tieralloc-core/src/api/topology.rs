//! NUMA Topology.
//!
//! The topology is discovered once per process, and immutable thereafter. This module only models it, and parses the
//! textual formats exposed by the kernel; reading them is the job of the platform.

use core::fmt;

/// Maximum number of NUMA nodes tracked.
pub const MAX_NODES: usize = 64;

/// Maximum number of CPUs tracked.
pub const MAX_CPUS: usize = 1024;

/// Index of a NUMA node.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct NodeIndex(u32);

impl NodeIndex {
    /// Creates a NodeIndex.
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Retrieves the index.
    pub const fn value(&self) -> u32 { self.0 }

    /// Retrieves the index, for indexing per-node tables.
    pub const fn index(&self) -> usize { self.0 as usize }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// NUMA Topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    node_count: usize,
    cpu_to_node: Vec<NodeIndex>,
    node_memory_bytes: Vec<u64>,
    available: bool,
}

impl NumaTopology {
    /// Creates the topology of a system without NUMA information: a single node, with every CPU mapped to it.
    pub fn single_node() -> Self {
        Self {
            node_count: 1,
            cpu_to_node: vec![NodeIndex::default(); MAX_CPUS],
            node_memory_bytes: vec![0],
            available: false,
        }
    }

    /// Creates a topology from per-node descriptions.
    ///
    /// Each node is described by its index, its `cpulist` (such as "0-3,8-11"), and optionally its `meminfo`.
    ///
    /// Nodes beyond `MAX_NODES`, and CPUs beyond `MAX_CPUS`, are ignored. If no node is described, the result is
    /// `single_node()`.
    pub fn from_nodes<'a, I>(nodes: I) -> Self
        where
            I: IntoIterator<Item = (usize, &'a str, Option<&'a str>)>,
    {
        let mut topology = Self::single_node();
        let mut max_node = None;

        for (node, cpu_list, meminfo) in nodes {
            if node >= MAX_NODES {
                continue;
            }

            max_node = max_node.max(Some(node));

            if topology.node_memory_bytes.len() <= node {
                topology.node_memory_bytes.resize(node + 1, 0);
            }

            for cpu in parse_cpu_list(cpu_list) {
                topology.cpu_to_node[cpu] = NodeIndex::new(node as u32);
            }

            if let Some(bytes) = meminfo.and_then(parse_mem_total) {
                topology.node_memory_bytes[node] = bytes;
            }
        }

        if let Some(max_node) = max_node {
            topology.node_count = max_node + 1;
            topology.node_memory_bytes.resize(topology.node_count, 0);
            topology.available = max_node > 0;
        }

        topology
    }

    /// Returns the number of nodes; at least 1.
    pub fn node_count(&self) -> usize { self.node_count }

    /// Returns whether actual NUMA information was available.
    ///
    /// A single-node machine reports `false`: there is no locality to optimize for.
    pub fn is_available(&self) -> bool { self.available }

    /// Returns the node of a given CPU, defaulting to node 0 for unknown CPUs.
    pub fn node_of_cpu(&self, cpu: usize) -> NodeIndex {
        if !self.available {
            return NodeIndex::default();
        }

        self.cpu_to_node.get(cpu).copied().unwrap_or_default()
    }

    /// Returns the memory of the node, in bytes, or 0 if unknown.
    pub fn node_memory_bytes(&self, node: NodeIndex) -> u64 {
        self.node_memory_bytes.get(node.index()).copied().unwrap_or(0)
    }

    /// Returns whether the node exists.
    pub fn contains(&self, node: NodeIndex) -> bool { node.index() < self.node_count }

    /// Returns an iterator over all the nodes.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.node_count as u32).map(NodeIndex::new)
    }
}

impl Default for NumaTopology {
    fn default() -> Self { Self::single_node() }
}

/// Parses a kernel CPU list, such as "0-3,8,10-11", into individual CPU indices.
///
/// Malformed entries, reversed ranges, and CPUs beyond `MAX_CPUS` are skipped.
pub fn parse_cpu_list(list: &str) -> impl Iterator<Item = usize> + '_ {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .flat_map(|token| {
            let range = match token.split_once('-') {
                Some((start, end)) => start.parse::<usize>().ok().zip(end.parse::<usize>().ok()),
                None => token.parse::<usize>().ok().map(|cpu| (cpu, cpu)),
            };

            let (start, end) = range.unwrap_or((1, 0));
            start..=end.min(MAX_CPUS - 1)
        })
}

/// Parses the `MemTotal` line of a per-node `meminfo` file, such as "Node 0 MemTotal: 16318412 kB".
///
/// Returns the size in bytes.
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.contains("MemTotal:"))?;
    let (_, rest) = line.split_once("MemTotal:")?;

    let mut words = rest.split_whitespace();
    let value: u64 = words.next()?.parse().ok()?;

    let multiplier = match words.next() {
        Some("kB") | Some("KB") => 1024,
        Some("MB") => 1024 * 1024,
        None => 1,
        Some(_) => return None,
    };

    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn parse_cpu_list_singles_and_ranges() {
    fn parse(list: &str) -> Vec<usize> { parse_cpu_list(list).collect() }

    assert_eq!(Vec::<usize>::new(), parse(""));
    assert_eq!(vec!(0), parse("0"));
    assert_eq!(vec!(0, 1, 2, 3), parse("0-3"));
    assert_eq!(vec!(0, 1, 2, 3, 8, 10, 11), parse("0-3,8,10-11\n"));
}

#[test]
fn parse_cpu_list_skips_garbage() {
    fn parse(list: &str) -> Vec<usize> { parse_cpu_list(list).collect() }

    assert_eq!(vec!(4), parse("x,4,3-1,a-b"));
    assert_eq!(vec!(1022, 1023), parse("1022-4000"));
}

#[test]
fn parse_mem_total_line() {
    let meminfo = "Node 0 MemTotal:       16318412 kB\nNode 0 MemFree:         1234 kB\n";

    assert_eq!(Some(16318412 * 1024), parse_mem_total(meminfo));
    assert_eq!(None, parse_mem_total("Node 0 MemFree: 12 kB"));
    assert_eq!(None, parse_mem_total("Node 0 MemTotal: lots kB"));
}

#[test]
fn single_node_maps_everything_to_zero() {
    let topology = NumaTopology::single_node();

    assert_eq!(1, topology.node_count());
    assert!(!topology.is_available());
    assert_eq!(NodeIndex::new(0), topology.node_of_cpu(0));
    assert_eq!(NodeIndex::new(0), topology.node_of_cpu(MAX_CPUS + 5));
}

#[test]
fn from_nodes_two_nodes() {
    let topology = NumaTopology::from_nodes(vec!(
        (0, "0-1,4", Some("Node 0 MemTotal: 1024 kB")),
        (1, "2-3,5", Some("Node 1 MemTotal: 2048 kB")),
    ));

    assert_eq!(2, topology.node_count());
    assert!(topology.is_available());

    assert_eq!(NodeIndex::new(0), topology.node_of_cpu(1));
    assert_eq!(NodeIndex::new(1), topology.node_of_cpu(3));
    assert_eq!(NodeIndex::new(0), topology.node_of_cpu(4));
    assert_eq!(NodeIndex::new(1), topology.node_of_cpu(5));

    //  Unknown CPUs default to 0.
    assert_eq!(NodeIndex::new(0), topology.node_of_cpu(4096));

    assert_eq!(1024 * 1024, topology.node_memory_bytes(NodeIndex::new(0)));
    assert_eq!(2048 * 1024, topology.node_memory_bytes(NodeIndex::new(1)));
    assert_eq!(0, topology.node_memory_bytes(NodeIndex::new(7)));

    assert_eq!(vec!(NodeIndex::new(0), NodeIndex::new(1)), topology.nodes().collect::<Vec<_>>());
}

#[test]
fn from_nodes_single_node_is_not_available() {
    let topology = NumaTopology::from_nodes(vec!((0, "0-7", None)));

    assert_eq!(1, topology.node_count());
    assert!(!topology.is_available());
}

#[test]
fn from_nodes_empty() {
    let topology = NumaTopology::from_nodes(Vec::new());

    assert_eq!(NumaTopology::single_node(), topology);
}

}
