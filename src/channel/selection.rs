//! Per-session channel selection and the fallback scope derived from it.

use std::collections::{BTreeMap, HashMap};

use super::tree::ChannelTree;
use crate::error::{DatasourceError, Result};
use crate::model::{ChannelId, ObjectRow};

/// Selected channel per forest, keyed by forest root.
///
/// Forests without an entry resolve to their root. Entries that no longer
/// match the current tree are ignored on read and dropped by [`reconcile`].
///
/// [`reconcile`]: ChannelSelection::reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSelection {
    selected: BTreeMap<ChannelId, ChannelId>,
}

impl ChannelSelection {
    /// Select `id`, replacing only the slot of its forest.
    pub fn select(&mut self, tree: &ChannelTree, id: ChannelId) -> Result<()> {
        let root = tree.root_of(id).ok_or(DatasourceError::UnknownChannel(id))?;
        self.selected.insert(root, id);
        Ok(())
    }

    /// Drop entries whose channel vanished or moved to another forest.
    pub fn reconcile(&mut self, tree: &ChannelTree) {
        self.selected
            .retain(|root, channel| tree.root_of(*channel) == Some(*root));
    }

    /// One selected channel per forest, in forest order.
    pub fn channels(&self, tree: &ChannelTree) -> Vec<ChannelId> {
        tree.root_ids()
            .map(|root| match self.selected.get(&root) {
                Some(channel) if tree.root_of(*channel) == Some(root) => *channel,
                _ => root,
            })
            .collect()
    }

    pub fn scope(&self, tree: &ChannelTree) -> ChannelScope {
        ChannelScope::new(
            self.channels(tree)
                .into_iter()
                .map(|channel| tree.path_to_root(channel))
                .collect(),
        )
    }
}

/// The channels visible from a selection, each ranked by distance from the
/// selected channel of its forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScope {
    chains: Vec<Vec<ChannelId>>,
    rank: HashMap<ChannelId, usize>,
}

impl ChannelScope {
    fn new(chains: Vec<Vec<ChannelId>>) -> Self {
        let rank = chains
            .iter()
            .flat_map(|chain| chain.iter().enumerate().map(|(depth, id)| (*id, depth)))
            .collect();
        Self { chains, rank }
    }

    /// Scope seeing `channel` in its forest and the roots of all other forests.
    pub fn for_channel(tree: &ChannelTree, channel: ChannelId) -> Result<Self> {
        let mut selection = ChannelSelection::default();
        selection.select(tree, channel)?;
        Ok(selection.scope(tree))
    }

    /// Cache key component identifying this scope.
    pub fn key(&self) -> Vec<ChannelId> {
        self.chains.iter().filter_map(|c| c.first().copied()).collect()
    }

    /// Fallback chains, selected channel first.
    pub fn chains(&self) -> &[Vec<ChannelId>] {
        &self.chains
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.chains.iter().flatten().copied().collect()
    }

    /// Distance from the selected channel; `None` when not visible.
    pub fn rank(&self, channel: ChannelId) -> Option<usize> {
        self.rank.get(&channel).copied()
    }

    /// The variant nearest the selected channel among `variants`.
    pub fn pick<'a, I>(&self, variants: I) -> Option<&'a ObjectRow>
    where
        I: IntoIterator<Item = &'a ObjectRow>,
    {
        variants
            .into_iter()
            .filter_map(|row| self.rank(row.channel_id).map(|rank| (rank, row)))
            .min_by_key(|(rank, row)| (*rank, row.id))
            .map(|(_, row)| row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tree::Channel;
    use std::collections::BTreeMap as Map;

    fn tree() -> ChannelTree {
        ChannelTree::new(vec![
            Channel::new(1, "Master")
                .with_child(Channel::new(2, "Channel").with_child(Channel::new(3, "Sub"))),
            Channel::new(10, "Other"),
        ])
        .unwrap()
    }

    fn row(id: u64, channel_id: ChannelId) -> ObjectRow {
        ObjectRow {
            id,
            obj_type: 1,
            channelset_id: 100,
            channel_id,
            content_id: format!("1.{id}"),
            updated_at: 0,
            optimized: Map::new(),
        }
    }

    #[test]
    fn test_defaults_to_roots() {
        let selection = ChannelSelection::default();
        assert_eq!(selection.channels(&tree()), vec![1, 10]);
    }

    #[test]
    fn test_select_replaces_only_its_forest() {
        let tree = tree();
        let mut selection = ChannelSelection::default();
        selection.select(&tree, 3).unwrap();
        assert_eq!(selection.channels(&tree), vec![3, 10]);
        selection.select(&tree, 2).unwrap();
        assert_eq!(selection.channels(&tree), vec![2, 10]);
    }

    #[test]
    fn test_unknown_channel() {
        let mut selection = ChannelSelection::default();
        assert!(matches!(
            selection.select(&tree(), 99),
            Err(DatasourceError::UnknownChannel(99))
        ));
    }

    #[test]
    fn test_reconcile_drops_vanished_channels() {
        let mut selection = ChannelSelection::default();
        selection.select(&tree(), 3).unwrap();
        let smaller = ChannelTree::new(vec![Channel::new(1, "Master"), Channel::new(10, "Other")]).unwrap();
        assert_eq!(selection.channels(&smaller), vec![1, 10]);
        selection.reconcile(&smaller);
        assert_eq!(selection, ChannelSelection::default());
    }

    #[test]
    fn test_scope_picks_nearest_variant() {
        let tree = tree();
        let scope = ChannelScope::for_channel(&tree, 3).unwrap();
        assert_eq!(scope.key(), vec![3, 10]);
        let master = row(1, 1);
        let channel = row(2, 2);
        let unrelated = row(3, 10);
        assert_eq!(scope.pick([&master, &channel]).map(|r| r.id), Some(2));
        assert_eq!(scope.pick([&master]).map(|r| r.id), Some(1));

        let root_scope = ChannelScope::for_channel(&tree, 1).unwrap();
        assert_eq!(root_scope.pick([&channel]), None);
        assert_eq!(root_scope.pick([&unrelated]).map(|r| r.id), Some(3));
    }
}
