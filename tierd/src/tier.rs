// SPDX-License-Identifier: GPL-2.0
use std::collections::HashSet;
use std::fmt;

/// Largest pid accepted from command surfaces; matches the default
/// /proc/sys/kernel/pid_max.
pub const MAX_PID: i32 = 32768;

/// One of the two memory tiers being balanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Dram,
    Nvram,
}

impl Tier {
    pub fn other(self) -> Tier {
        match self {
            Tier::Dram => Tier::Nvram,
            Tier::Nvram => Tier::Dram,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Dram => write!(f, "DRAM"),
            Tier::Nvram => write!(f, "NVRAM"),
        }
    }
}

/// Migration request modes. The discriminant is the wire value of the `mode`
/// field in agent requests; the variant name spells out source and direction
/// so callers never have to reason about which tier a mode drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MigrationMode {
    /// Cold pages out of DRAM, placed on NVRAM nodes.
    DramToNvram = 0,
    /// Hot pages out of NVRAM, placed on DRAM nodes.
    NvramToDram = 1,
    /// Write-heavy NVRAM pages, placed on DRAM nodes.
    NvramWriteback = 2,
    /// Bandwidth drain out of DRAM (count is permille of DRAM traffic).
    BalanceDram = 3,
    /// Bandwidth drain out of NVRAM (count is permille of NVRAM traffic).
    BalanceNvram = 4,
    /// Zero-volume hint asking the agent to flush its dirty-page tracking.
    NvramClearDirty = 5,
}

impl MigrationMode {
    pub fn wire(self) -> i32 {
        self as i32
    }

    /// Tier the pages are being placed into. `None` for the clear-dirty
    /// hint, which never migrates anything.
    pub fn dest_tier(self) -> Option<Tier> {
        match self {
            MigrationMode::DramToNvram | MigrationMode::BalanceDram => Some(Tier::Nvram),
            MigrationMode::NvramToDram
            | MigrationMode::NvramWriteback
            | MigrationMode::BalanceNvram => Some(Tier::Dram),
            MigrationMode::NvramClearDirty => None,
        }
    }

    /// Mode migrating into the given tier, for the console `send` command.
    pub fn into_tier(dest: Tier) -> MigrationMode {
        match dest {
            Tier::Dram => MigrationMode::NvramToDram,
            Tier::Nvram => MigrationMode::DramToNvram,
        }
    }
}

/// Static node sets for both tiers; configured at startup, never relearned.
#[derive(Debug, Clone)]
pub struct TierLayout {
    pub dram_nodes: Vec<u32>,
    pub nvram_nodes: Vec<u32>,
}

impl TierLayout {
    pub fn parse(dram: &str, nvram: &str) -> Result<Self, String> {
        let dram_nodes = parse_node_list(dram)?;
        let nvram_nodes = parse_node_list(nvram)?;
        if dram_nodes.is_empty() || nvram_nodes.is_empty() {
            return Err("both tiers need at least one node".to_string());
        }
        if dram_nodes.iter().any(|n| nvram_nodes.contains(n)) {
            return Err("a node cannot belong to both tiers".to_string());
        }
        Ok(Self {
            dram_nodes,
            nvram_nodes,
        })
    }

    pub fn nodes(&self, tier: Tier) -> &[u32] {
        match tier {
            Tier::Dram => &self.dram_nodes,
            Tier::Nvram => &self.nvram_nodes,
        }
    }
}

/// Parse a NUMA node list in the usual "0-1,4" form. Order is preserved:
/// the migration executor fills destination nodes in the order given here.
pub fn parse_node_list(optarg: &str) -> Result<Vec<u32>, String> {
    let mut nodes = Vec::new();
    let mut seen = HashSet::new();

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in node list".to_string());
    }

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<u32>()
                .map_err(|_| "Invalid range start".to_string())?;
            let end = end_str
                .trim()
                .parse::<u32>()
                .map_err(|_| "Invalid range end".to_string())?;
            if start > end {
                return Err(format!("Invalid node range: {}-{}", start, end));
            }
            for i in start..=end {
                if seen.insert(i) {
                    nodes.push(i);
                }
            }
        } else {
            let node = token
                .parse::<u32>()
                .map_err(|_| format!("Invalid node: {}", token))?;
            if seen.insert(node) {
                nodes.push(node);
            }
        }
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_node() {
        assert_eq!(parse_node_list("2").unwrap(), vec![2]);
    }

    #[test]
    fn parses_range_and_single() {
        assert_eq!(parse_node_list("0-2,5").unwrap(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn rejects_bad_chars() {
        assert!(parse_node_list("0-2,a").is_err());
    }

    #[test]
    fn layout_rejects_overlap() {
        assert!(TierLayout::parse("0,1", "1,2").is_err());
        let layout = TierLayout::parse("0", "1-2").unwrap();
        assert_eq!(layout.nodes(Tier::Nvram), &[1, 2]);
    }

    #[test]
    fn mode_directions() {
        assert_eq!(MigrationMode::DramToNvram.dest_tier(), Some(Tier::Nvram));
        assert_eq!(MigrationMode::NvramWriteback.dest_tier(), Some(Tier::Dram));
        assert_eq!(MigrationMode::BalanceDram.dest_tier(), Some(Tier::Nvram));
        assert_eq!(MigrationMode::NvramClearDirty.dest_tier(), None);
        assert_eq!(MigrationMode::into_tier(Tier::Dram).wire(), 1);
    }
}
