//! Cluster topology parsing (`CLUSTER NODES` text and slot ranges)

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::node::NodeAddr;

/// Number of hash slots in a cluster
pub const SLOT_COUNT: u32 = 16384;

/// An inclusive run of hash slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn slots(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Parse `0-5460 5462 7000-7001` style slot lists
///
/// Migration markers such as `[93->-id]` are skipped.
pub fn parse_slot_ranges(text: &str) -> Result<Vec<SlotRange>, String> {
    let mut ranges = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim();
        if token.is_empty() || token.starts_with('[') {
            continue;
        }
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => (parse_slot(a, token)?, parse_slot(b, token)?),
            None => {
                let slot = parse_slot(token, token)?;
                (slot, slot)
            }
        };
        if start > end {
            return Err(format!("slot range '{token}' is reversed"));
        }
        ranges.push(SlotRange::new(start, end));
    }
    Ok(ranges)
}

fn parse_slot(raw: &str, token: &str) -> Result<u16, String> {
    match raw.parse::<u32>() {
        Ok(slot) if slot < SLOT_COUNT => Ok(slot as u16),
        _ => Err(format!("invalid slot in '{token}'")),
    }
}

/// One line of `CLUSTER NODES`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub addr: NodeAddr,
    pub flags: Vec<String>,
    /// Primary's node id, for replicas
    pub master_id: Option<String>,
    pub link_state: String,
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_replica(&self) -> bool {
        self.has_flag("slave") || self.has_flag("replica")
    }

    pub fn is_failed(&self) -> bool {
        self.has_flag("fail") || self.has_flag("noaddr")
    }

    pub fn is_connected(&self) -> bool {
        self.link_state == "connected"
    }
}

/// Parse the full `CLUSTER NODES` reply
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<ClusterNode>, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(parse_node_line)
        .collect()
}

fn parse_node_line(line: &str) -> Result<ClusterNode, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(format!("short CLUSTER NODES line: '{line}'"));
    }

    // ip:port@cport[,hostname]
    let endpoint = fields[1]
        .split(['@', ','])
        .next()
        .unwrap_or_default();
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| format!("bad node address in '{line}'"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("bad node port in '{line}'"))?;

    let master_id = match fields[3] {
        "-" => None,
        id => Some(id.to_string()),
    };

    Ok(ClusterNode {
        id: fields[0].to_string(),
        addr: NodeAddr::new(host, port),
        flags: fields[2].split(',').map(str::to_string).collect(),
        master_id,
        link_state: fields[7].to_string(),
        slots: parse_slot_ranges(&fields[8..].join(" "))?,
    })
}

/// The node flagged `myself`
pub fn find_myself(nodes: &[ClusterNode]) -> Option<&ClusterNode> {
    nodes.iter().find(|n| n.is_myself())
}
