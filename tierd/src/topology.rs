// SPDX-License-Identifier: GPL-2.0
//
// Tier and node capacity queries backed by /sys/devices/system/node.
// Read-only; safe to call from every loop concurrently.

use std::fs;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;

use crate::tier::{Tier, TierLayout};

/// System page size in bytes, cached for the process lifetime.
pub static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
});

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeBytes {
    pub total: u64,
    pub free: u64,
}

impl NodeBytes {
    /// Used fraction in [0, 1]; zero-capacity nodes count as empty.
    pub fn used_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total - self.free.min(self.total)) as f64 / self.total as f64
    }
}

/// Capacity view of the two tiers. The trait boundary exists so tests can
/// inject synthetic topologies; everything above it is pure arithmetic.
pub trait TierTopology: Send + Sync {
    fn nodes(&self, tier: Tier) -> &[u32];

    fn node_bytes(&self, node: u32) -> Result<NodeBytes>;

    fn tier_bytes(&self, tier: Tier) -> Result<NodeBytes> {
        let mut sum = NodeBytes::default();
        for &node in self.nodes(tier) {
            let nb = self.node_bytes(node)?;
            sum.total += nb.total;
            sum.free += nb.free;
        }
        Ok(sum)
    }

    fn node_free_pages(&self, node: u32) -> Result<u64> {
        Ok(self.node_bytes(node)?.free / *PAGE_SIZE)
    }

    fn tier_free_pages(&self, tier: Tier) -> Result<u64> {
        Ok(self.tier_bytes(tier)?.free / *PAGE_SIZE)
    }
}

/// Real topology reading node meminfo from sysfs.
pub struct SysfsTopology {
    layout: TierLayout,
}

impl SysfsTopology {
    pub fn new(layout: TierLayout) -> Self {
        Self { layout }
    }
}

impl TierTopology for SysfsTopology {
    fn nodes(&self, tier: Tier) -> &[u32] {
        self.layout.nodes(tier)
    }

    fn node_bytes(&self, node: u32) -> Result<NodeBytes> {
        let path = format!("/sys/devices/system/node/node{}/meminfo", node);
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
        parse_node_meminfo(&content)
            .with_context(|| format!("Malformed meminfo for node {}", node))
    }
}

/// Parse a node meminfo blob. Lines look like
/// `Node 1 MemTotal:       16303612 kB`; values are in kB.
fn parse_node_meminfo(content: &str) -> Result<NodeBytes> {
    let mut total = None;
    let mut free = None;

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        // "Node" / node id / key / value / "kB"
        let key = fields.nth(2);
        let value = fields.next().and_then(|v| v.parse::<u64>().ok());
        match (key, value) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb * 1024),
            (Some("MemFree:"), Some(kb)) => free = Some(kb * 1024),
            _ => {}
        }
        if total.is_some() && free.is_some() {
            break;
        }
    }

    match (total, free) {
        (Some(total), Some(free)) => Ok(NodeBytes { total, free }),
        _ => bail!("MemTotal/MemFree not found"),
    }
}
