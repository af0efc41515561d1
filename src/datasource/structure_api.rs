//! Channel structure and per-session channel selection.

use std::sync::Arc;
use tracing::{info, warn};

use super::{observed, Datasource};
use crate::channel::tree::inspect_nodes;
use crate::channel::{Channel, ChannelTree, ConsistencyReport};
use crate::error::{DatasourceError, Result};
use crate::model::ChannelId;

impl Datasource {
    /// Replace the whole channel forest.
    ///
    /// Ids must be positive and unique. On any violation the persisted
    /// structure is left untouched.
    #[tracing::instrument(skip(self, roots), fields(roots = roots.len()))]
    pub fn save_structure(&self, roots: Vec<Channel>) -> Result<()> {
        let result: Result<()> = (|| {
            let tree = ChannelTree::new(roots)?;
            let nodes = tree.to_nodes();
            self.core
                .backend
                .transact(&mut |tx| Ok(tx.replace_channel_nodes(&nodes)?))?;
            self.core.cache.invalidate_structure();
            self.selection.write().reconcile(&tree);
            info!(channels = tree.len(), "Channel structure saved");
            Ok(())
        })();
        observed("save_structure", result)
    }

    /// The persisted channel forest.
    pub fn get_structure(&self) -> Result<Arc<ChannelTree>> {
        observed("get_structure", self.core.tree())
    }

    /// Inspect the persisted MPTT rows. With `auto_repair`, a forest that can
    /// still be rebuilt by containment is renumbered instead of failing.
    #[tracing::instrument(skip(self))]
    pub fn check_structure(&self, auto_repair: bool) -> Result<ConsistencyReport> {
        let result: Result<ConsistencyReport> = (|| {
            let nodes = self.core.backend.load_channel_nodes()?;
            let (findings, rebuilt) = inspect_nodes(&nodes);
            if findings.is_empty() {
                return Ok(ConsistencyReport::default());
            }
            match rebuilt {
                Some(tree) if auto_repair => {
                    let repaired = tree.to_nodes();
                    self.core
                        .backend
                        .transact(&mut |tx| Ok(tx.replace_channel_nodes(&repaired)?))?;
                    self.core.cache.invalidate_structure();
                    warn!(findings = findings.len(), "Channel structure renumbered");
                    Ok(ConsistencyReport {
                        findings,
                        repaired: true,
                    })
                }
                _ => Err(DatasourceError::ConsistencyCheckFailure { findings }),
            }
        })();
        observed("check_structure", result)
    }

    /// Select `id` in its forest for this session.
    pub fn set_channel(&self, id: ChannelId) -> Result<()> {
        let tree = self.core.tree()?;
        self.selection.write().select(&tree, id)
    }

    /// Selected channel per forest, the root where nothing was selected.
    pub fn get_channels(&self) -> Result<Vec<ChannelId>> {
        let tree = self.core.tree()?;
        Ok(self.selection.read().channels(&tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelNode;
    use crate::config::DatasourceConfig;
    use crate::storage::{MemoryBackend, RelationalBackend};

    fn datasource() -> Datasource {
        Datasource::new(Arc::new(MemoryBackend::new()), DatasourceConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_structure_keeps_previous() {
        let ds = datasource();
        ds.save_structure(vec![Channel::new(1, "Master")]).unwrap();

        let err = ds
            .save_structure(vec![Channel::new(1, "A"), Channel::new(1, "B")])
            .unwrap_err();
        assert!(matches!(err, DatasourceError::StructureValidation(_)));

        let err = ds.save_structure(vec![Channel::new(0, "Zero")]).unwrap_err();
        assert!(matches!(err, DatasourceError::StructureValidation(_)));

        ds.clear_caches();
        assert_eq!(ds.get_structure().unwrap().channel_ids(), &[1]);
    }

    #[test]
    fn test_selection_is_per_forest_and_per_session() {
        let ds = datasource();
        ds.save_structure(vec![
            Channel::new(1, "Master").with_child(Channel::new(2, "Web")),
            Channel::new(10, "Second").with_child(Channel::new(11, "Print")),
        ])
        .unwrap();

        assert_eq!(ds.get_channels().unwrap(), vec![1, 10]);
        ds.set_channel(2).unwrap();
        ds.set_channel(11).unwrap();
        assert_eq!(ds.get_channels().unwrap(), vec![2, 11]);

        let other = ds.session();
        assert_eq!(other.get_channels().unwrap(), vec![1, 10]);

        assert!(matches!(ds.set_channel(99), Err(DatasourceError::UnknownChannel(99))));
        assert_eq!(ds.get_channels().unwrap(), vec![2, 11]);
    }

    #[test]
    fn test_saving_structure_drops_vanished_selection() {
        let ds = datasource();
        ds.save_structure(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Web"))])
            .unwrap();
        ds.set_channel(2).unwrap();
        ds.save_structure(vec![Channel::new(1, "Master")]).unwrap();
        assert_eq!(ds.get_channels().unwrap(), vec![1]);
    }

    #[test]
    fn test_check_structure_repairs_numbering() {
        let backend = Arc::new(MemoryBackend::new());
        let ds = Datasource::new(backend.clone(), DatasourceConfig::default()).unwrap();
        ds.save_structure(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Web"))])
            .unwrap();
        assert!(ds.check_structure(false).unwrap().is_consistent());

        // widen the intervals, leaving gaps but keeping containment
        let gapped = vec![
            ChannelNode {
                id: 1,
                name: "Master".into(),
                left: 1,
                right: 10,
            },
            ChannelNode {
                id: 2,
                name: "Web".into(),
                left: 3,
                right: 4,
            },
        ];
        backend
            .transact(&mut |tx| Ok(tx.replace_channel_nodes(&gapped)?))
            .unwrap();

        let err = ds.check_structure(false).unwrap_err();
        assert!(matches!(err, DatasourceError::ConsistencyCheckFailure { .. }));

        let report = ds.check_structure(true).unwrap();
        assert!(report.repaired);
        assert!(!report.findings.is_empty());
        assert!(ds.check_structure(false).unwrap().is_consistent());
    }
}
