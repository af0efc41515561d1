// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel forest with MPTT persistence.
//!
//! Channels are persisted as flat nested-set rows (`left`, `right`) numbered by
//! a pre-order walk over the whole forest. Reading rebuilds parent/child links
//! purely by interval containment:
//!
//! ```text
//!  1 Master 8            Master
//!    2 Channel 5   <=>     ├── Channel
//!      3 Sub 4             │     └── Sub
//!    6 Other 7             └── Other
//! ```
//!
//! The numbers of all rows together must form the contiguous range `1..=2n`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{DatasourceError, Result};
use crate::model::ChannelId;

/// A channel with its sub-channels, as passed to `save_structure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub children: Vec<Channel>,
}

impl Channel {
    #[must_use]
    pub fn new(id: ChannelId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Channel) -> Self {
        self.children.push(child);
        self
    }
}

/// Persisted nested-set row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNode {
    pub id: ChannelId,
    pub name: String,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone)]
struct NodeInfo {
    parent: Option<ChannelId>,
    root: ChannelId,
    name: String,
}

/// Validated, indexed channel forest.
#[derive(Debug, Clone, Default)]
pub struct ChannelTree {
    roots: Vec<Channel>,
    index: HashMap<ChannelId, NodeInfo>,
    preorder: Vec<ChannelId>,
}

impl ChannelTree {
    /// Validate and index a forest. Ids must be positive and unique across
    /// every tree of the forest.
    pub fn new(roots: Vec<Channel>) -> Result<Self> {
        let mut tree = Self {
            roots: Vec::new(),
            index: HashMap::new(),
            preorder: Vec::new(),
        };
        for root in &roots {
            tree.index_subtree(root, None, root.id)?;
        }
        tree.roots = roots;
        Ok(tree)
    }

    fn index_subtree(
        &mut self,
        channel: &Channel,
        parent: Option<ChannelId>,
        root: ChannelId,
    ) -> Result<()> {
        if channel.id == 0 {
            return Err(DatasourceError::StructureValidation(format!(
                "channel '{}' has id 0, ids must be positive",
                channel.name
            )));
        }
        let info = NodeInfo {
            parent,
            root,
            name: channel.name.clone(),
        };
        if self.index.insert(channel.id, info).is_some() {
            return Err(DatasourceError::StructureValidation(format!(
                "channel id {} is used more than once",
                channel.id
            )));
        }
        self.preorder.push(channel.id);
        for child in &channel.children {
            self.index_subtree(child, Some(channel.id), root)?;
        }
        Ok(())
    }

    /// Rebuild a forest from persisted rows by interval containment.
    pub fn from_nodes(mut nodes: Vec<ChannelNode>) -> Result<Self> {
        nodes.sort_by_key(|n| n.left);
        let mut roots = Vec::new();
        let mut stack: Vec<(ChannelNode, Vec<Channel>)> = Vec::new();

        for node in nodes {
            if node.left >= node.right {
                return Err(DatasourceError::StructureValidation(format!(
                    "channel {} has left {} >= right {}",
                    node.id, node.left, node.right
                )));
            }
            while stack.last().is_some_and(|(top, _)| top.right < node.left) {
                close_top(&mut stack, &mut roots);
            }
            if let Some((top, _)) = stack.last() {
                if node.right >= top.right {
                    return Err(DatasourceError::StructureValidation(format!(
                        "channel {} [{}, {}] partially overlaps channel {} [{}, {}]",
                        node.id, node.left, node.right, top.id, top.left, top.right
                    )));
                }
            }
            stack.push((node, Vec::new()));
        }
        while !stack.is_empty() {
            close_top(&mut stack, &mut roots);
        }
        Self::new(roots)
    }

    /// Pre-order MPTT numbering over the whole forest, starting at 1.
    pub fn to_nodes(&self) -> Vec<ChannelNode> {
        fn walk(channel: &Channel, counter: &mut u32, out: &mut Vec<ChannelNode>) {
            let slot = out.len();
            *counter += 1;
            out.push(ChannelNode {
                id: channel.id,
                name: channel.name.clone(),
                left: *counter,
                right: 0,
            });
            for child in &channel.children {
                walk(child, counter, out);
            }
            *counter += 1;
            out[slot].right = *counter;
        }

        let mut out = Vec::with_capacity(self.preorder.len());
        let mut counter = 0;
        for root in &self.roots {
            walk(root, &mut counter, &mut out);
        }
        out
    }

    pub fn roots(&self) -> &[Channel] {
        &self.roots
    }

    pub fn root_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.roots.iter().map(|r| r.id)
    }

    /// All channel ids in pre-order.
    pub fn channel_ids(&self) -> &[ChannelId] {
        &self.preorder
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn parent(&self, id: ChannelId) -> Option<ChannelId> {
        self.index.get(&id).and_then(|n| n.parent)
    }

    pub fn root_of(&self, id: ChannelId) -> Option<ChannelId> {
        self.index.get(&id).map(|n| n.root)
    }

    pub fn name(&self, id: ChannelId) -> Option<&str> {
        self.index.get(&id).map(|n| n.name.as_str())
    }

    /// `id` followed by its ancestors up to the forest root.
    pub fn path_to_root(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut path = Vec::new();
        let mut current = self.index.contains_key(&id).then_some(id);
        while let Some(channel) = current {
            path.push(channel);
            current = self.parent(channel);
        }
        path
    }

    pub fn len(&self) -> usize {
        self.preorder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preorder.is_empty()
    }
}

fn close_top(stack: &mut Vec<(ChannelNode, Vec<Channel>)>, roots: &mut Vec<Channel>) {
    if let Some((node, children)) = stack.pop() {
        let channel = Channel {
            id: node.id,
            name: node.name,
            children,
        };
        match stack.last_mut() {
            Some((_, siblings)) => siblings.push(channel),
            None => roots.push(channel),
        }
    }
}

/// Outcome of a consistency check over persisted channel rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub findings: Vec<String>,
    pub repaired: bool,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Inspect persisted rows. Returns the findings and, when the forest can still
/// be rebuilt by containment, the rebuilt tree for renumbering.
pub fn inspect_nodes(nodes: &[ChannelNode]) -> (Vec<String>, Option<ChannelTree>) {
    let mut findings = Vec::new();

    let mut ids = HashSet::new();
    for node in nodes {
        if node.id == 0 {
            findings.push(format!("channel '{}' has id 0", node.name));
        }
        if !ids.insert(node.id) {
            findings.push(format!("channel id {} appears more than once", node.id));
        }
        if node.left >= node.right {
            findings.push(format!(
                "channel {} has left {} >= right {}",
                node.id, node.left, node.right
            ));
        }
    }

    let mut bounds: Vec<u32> = nodes.iter().flat_map(|n| [n.left, n.right]).collect();
    bounds.sort_unstable();
    for (expected, actual) in (1u32..).zip(bounds.iter()) {
        if expected != *actual {
            findings.push(format!(
                "MPTT numbering is not contiguous: expected {expected}, found {actual}"
            ));
            break;
        }
    }

    let rebuilt = match ChannelTree::from_nodes(nodes.to_vec()) {
        Ok(tree) => Some(tree),
        Err(DatasourceError::StructureValidation(reason)) => {
            if !findings.contains(&reason) {
                findings.push(reason);
            }
            None
        }
        Err(e) => {
            findings.push(e.to_string());
            None
        }
    };
    (findings, rebuilt)
}
