//! Core-id and NUMA-node queries.
//!
//! Design note: the original C hard-codes `core < 8 ⇒ node 0;
//! core < 16 ⇒ node 1`, silently dropping counter updates for any core past
//! 16: "a correctness hazard on larger machines". This module instead
//! builds a core→node table once, by reading
//! `/sys/devices/system/node/node*/cpulist`, and falls back to mapping every
//! core to node 0 when the topology can't be read.

use std::sync::OnceLock;

/// Current core id, best-effort (0 if unavailable).
#[cfg(target_os = "linux")]
pub fn current_core() -> usize {
    let c = unsafe { libc::sched_getcpu() };
    if c < 0 {
        0
    } else {
        c as usize
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_core() -> usize {
    0
}

/// A core-id → NUMA-node-id table, built once at first use.
pub struct Topology {
    /// `core_to_node[core] = node`. Cores beyond the observed range map to
    /// node 0 rather than being silently dropped.
    core_to_node: Vec<usize>,
    node_count: usize,
}

impl Topology {
    pub fn node_of(&self, core: usize) -> usize {
        self.core_to_node.get(core).copied().unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    #[cfg(target_os = "linux")]
    fn discover() -> Topology {
        use std::fs;

        let node_dir = std::path::Path::new("/sys/devices/system/node");
        let mut entries = match fs::read_dir(node_dir) {
            Ok(e) => e,
            Err(_) => return Topology::single_node(),
        };

        let mut by_node = Vec::new();
        while let Some(Ok(entry)) = entries.next() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(idx) = name.strip_prefix("node") else {
                continue;
            };
            let Ok(node_id) = idx.parse::<usize>() else {
                continue;
            };
            let cpulist_path = entry.path().join("cpulist");
            let Ok(contents) = fs::read_to_string(cpulist_path) else {
                continue;
            };
            for core in parse_cpulist(contents.trim()) {
                by_node.push((core, node_id));
            }
        }

        if by_node.is_empty() {
            log::warn!("no NUMA topology found under /sys, falling back to a single node");
            return Topology::single_node();
        }

        let max_core = by_node.iter().map(|(c, _)| *c).max().unwrap_or(0);
        let node_count = by_node.iter().map(|(_, n)| *n).max().unwrap_or(0) + 1;
        let mut core_to_node = vec![0usize; max_core + 1];
        for (core, node) in by_node {
            core_to_node[core] = node;
        }

        Topology {
            core_to_node,
            node_count,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn discover() -> Topology {
        Topology::single_node()
    }

    fn single_node() -> Topology {
        Topology {
            core_to_node: Vec::new(),
            node_count: 1,
        }
    }
}

fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for range in s.split(',').filter(|r| !r.is_empty()) {
        if let Some((lo, hi)) = range.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(v) = range.parse::<usize>() {
            out.push(v);
        }
    }
    out
}

static TOPOLOGY: OnceLock<Topology> = OnceLock::new();

/// The process-wide topology table, discovered on first use.
pub fn topology() -> &'static Topology {
    TOPOLOGY.get_or_init(Topology::discover)
}

/// NUMA node for the current core, per the process-wide topology table.
pub fn current_node() -> usize {
    topology().node_of(current_core())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_cpulist_handles_ranges_and_singletons() {
        assert_eq!(parse_cpulist("0-3,7,9-10"), vec![0, 1, 2, 3, 7, 9, 10]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn single_node_maps_everything_to_zero() {
        let t = Topology::single_node();
        assert_eq!(t.node_of(0), 0);
        assert_eq!(t.node_of(999), 0);
        assert_eq!(t.node_count(), 1);
    }

    #[test]
    fn current_node_does_not_panic() {
        let _ = current_node();
    }
}
