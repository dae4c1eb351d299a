//! Transform stage applied between the change log and the wire.

use batchsync_core::ConfigRegistry;
use batchsync_protocol::ChangeRecord;
use std::sync::Arc;

/// Maps a source record onto the statements written for a target group.
///
/// One input may produce zero or more outputs.
pub trait TransformStage: Send + Sync {
    /// Applies the transforms of `source_group -> target_group` to `record`.
    fn apply(&self, source_group: &str, target_group: &str, record: ChangeRecord) -> Vec<ChangeRecord>;

    /// How many target statements one row of `table` becomes, at least 1.
    fn multiplier(&self, source_group: &str, target_group: &str, table: &str) -> u64;
}

/// Passes records through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransforms;

impl TransformStage for NoTransforms {
    fn apply(&self, _source_group: &str, _target_group: &str, record: ChangeRecord) -> Vec<ChangeRecord> {
        vec![record]
    }

    fn multiplier(&self, _source_group: &str, _target_group: &str, _table: &str) -> u64 {
        1
    }
}

/// Table transforms from the configuration registry.
///
/// Each configured transform of a table emits one copy of the record
/// renamed to its target table. Tables without transforms pass through.
#[derive(Debug, Clone)]
pub struct TableTransforms {
    registry: Arc<ConfigRegistry>,
}

impl TableTransforms {
    /// Creates a stage reading `registry`.
    pub fn new(registry: Arc<ConfigRegistry>) -> Self {
        Self { registry }
    }
}

impl TransformStage for TableTransforms {
    fn apply(&self, source_group: &str, target_group: &str, record: ChangeRecord) -> Vec<ChangeRecord> {
        let transforms = self
            .registry
            .transforms_for(source_group, target_group, &record.table_name);
        if transforms.is_empty() {
            return vec![record];
        }
        transforms
            .into_iter()
            .map(|t| {
                let mut out = record.clone();
                out.table_name = t.target_table_name;
                out
            })
            .collect()
    }

    fn multiplier(&self, source_group: &str, target_group: &str, table: &str) -> u64 {
        (self
            .registry
            .transforms_for(source_group, target_group, table)
            .len() as u64)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_core::{Node, TransformTable};
    use batchsync_protocol::DataEventType;

    fn registry() -> Arc<ConfigRegistry> {
        let registry = Arc::new(ConfigRegistry::new(Node::new("00000", "corp")));
        for target in ["orders_a", "orders_b"] {
            registry.add_transform(TransformTable {
                transform_id: target.into(),
                source_node_group_id: "corp".into(),
                target_node_group_id: "store".into(),
                source_table_name: "orders".into(),
                target_table_name: target.into(),
            });
        }
        registry
    }

    #[test]
    fn fan_out_renames_per_transform() {
        let stage = TableTransforms::new(registry());
        let record = ChangeRecord::new("orders", DataEventType::Insert, "default");
        let out = stage.apply("corp", "store", record);
        let tables: Vec<_> = out.iter().map(|r| r.table_name.as_str()).collect();
        assert_eq!(tables, vec!["orders_a", "orders_b"]);
        assert_eq!(stage.multiplier("corp", "store", "orders"), 2);
    }

    #[test]
    fn untransformed_tables_pass_through() {
        let stage = TableTransforms::new(registry());
        let record = ChangeRecord::new("items", DataEventType::Insert, "default");
        assert_eq!(stage.apply("corp", "store", record.clone()), vec![record]);
        assert_eq!(stage.multiplier("corp", "store", "items"), 1);
        assert_eq!(NoTransforms.multiplier("corp", "store", "orders"), 1);
    }
}
