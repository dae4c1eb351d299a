//! Configuration model: nodes, channels, triggers, routers and transforms.

use serde::{Deserialize, Serialize};

/// Channel that carries reload batches unless a trigger names its own.
pub const RELOAD_CHANNEL: &str = "reload";
/// Channel for configuration changes.
pub const CONFIG_CHANNEL: &str = "config";
/// Default extract queue.
pub const DEFAULT_QUEUE: &str = "default";

/// A lane of changes with its own batching policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id.
    pub channel_id: String,
    /// Extract queue that serves this channel.
    pub queue: String,
    /// Ordering among channels when sending.
    pub processing_order: i32,
    /// Rows per batch.
    pub max_batch_size: u64,
    /// Whether this channel carries reload batches.
    pub reload_flag: bool,
    /// Disabled channels are neither routed nor extracted.
    pub enabled: bool,
}

impl Channel {
    /// Creates an enabled channel on the default queue.
    pub fn new(channel_id: impl Into<String>, max_batch_size: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            queue: DEFAULT_QUEUE.to_string(),
            processing_order: 1,
            max_batch_size,
            reload_flag: false,
            enabled: true,
        }
    }

    /// Marks the channel as a reload channel.
    #[must_use]
    pub fn reload(mut self) -> Self {
        self.reload_flag = true;
        self
    }

    /// Assigns the channel to a queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

/// Operator switches for one (node, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelControl {
    /// Target node.
    pub node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Batches stay pending until resumed.
    pub suspend: bool,
    /// Batches are discarded as OK.
    pub ignore: bool,
}

/// Captures changes on one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger id.
    pub trigger_id: String,
    /// Table the trigger watches.
    pub source_table_name: String,
    /// Channel of captured changes.
    pub channel_id: String,
    /// Channel used when this table is reloaded.
    pub reload_channel_id: String,
}

impl Trigger {
    /// Creates a trigger reloaded through [`RELOAD_CHANNEL`].
    pub fn new(
        trigger_id: impl Into<String>,
        source_table_name: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            source_table_name: source_table_name.into(),
            channel_id: channel_id.into(),
            reload_channel_id: RELOAD_CHANNEL.to_string(),
        }
    }
}

/// Sends changes from one node group to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Router id.
    pub router_id: String,
    /// Group the changes originate in.
    pub source_node_group_id: String,
    /// Group that receives them.
    pub target_node_group_id: String,
}

impl Router {
    /// Creates a router between two groups.
    pub fn new(
        router_id: impl Into<String>,
        source_node_group_id: impl Into<String>,
        target_node_group_id: impl Into<String>,
    ) -> Self {
        Self {
            router_id: router_id.into(),
            source_node_group_id: source_node_group_id.into(),
            target_node_group_id: target_node_group_id.into(),
        }
    }
}

/// A trigger paired with a router, plus its initial load settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRouter {
    /// The trigger.
    pub trigger: Trigger,
    /// The router.
    pub router: Router,
    /// Operator order for initial loads; ties fall back to table dependencies.
    pub initial_load_order: i32,
    /// Predicate applied to the initial load select.
    pub initial_load_select: Option<String>,
    /// Statement used instead of a plain delete when deleting first.
    pub initial_load_delete_stmt: Option<String>,
    /// Disabled pairs take no part in routing or reloads.
    pub enabled: bool,
}

impl TriggerRouter {
    /// Pairs a trigger with a router.
    pub fn new(trigger: Trigger, router: Router) -> Self {
        Self {
            trigger,
            router,
            initial_load_order: 1,
            initial_load_select: None,
            initial_load_delete_stmt: None,
            enabled: true,
        }
    }

    /// Sets the initial load order.
    #[must_use]
    pub fn with_load_order(mut self, order: i32) -> Self {
        self.initial_load_order = order;
        self
    }

    /// Restricts the initial load select.
    #[must_use]
    pub fn with_load_select(mut self, predicate: impl Into<String>) -> Self {
        self.initial_load_select = Some(predicate.into());
        self
    }

    /// Trigger id.
    pub fn trigger_id(&self) -> &str {
        &self.trigger.trigger_id
    }

    /// Router id.
    pub fn router_id(&self) -> &str {
        &self.router.router_id
    }

    /// Source table.
    pub fn table_name(&self) -> &str {
        &self.trigger.source_table_name
    }
}

/// A version of a trigger's table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerHistory {
    /// History id stamped on captured records.
    pub trigger_hist_id: u32,
    /// Trigger this history belongs to.
    pub trigger_id: String,
    /// Source table at that version.
    pub source_table_name: String,
    /// Column names at that version.
    pub column_names: Vec<String>,
    /// Primary key columns at that version.
    pub pk_column_names: Vec<String>,
}

/// A participant in synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub node_id: String,
    /// Group the node belongs to.
    pub node_group_id: String,
    /// Disabled nodes are not routed to.
    pub sync_enabled: bool,
}

impl Node {
    /// Creates an enabled node.
    pub fn new(node_id: impl Into<String>, node_group_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            sync_enabled: true,
        }
    }
}

/// Per-node load bookkeeping kept at the source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSecurity {
    /// Node id.
    pub node_id: String,
    /// A full initial load is wanted for this node.
    pub initial_load_enabled: bool,
    /// Load currently sending to this node, 0 if none.
    pub initial_load_id: u64,
    /// When the load was queued.
    pub initial_load_time: Option<u64>,
    /// When the load finished.
    pub initial_load_end_time: Option<u64>,
    /// Who asked for the load.
    pub initial_load_create_by: Option<String>,
    /// A reverse initial load (this node's data sent back) is wanted.
    pub rev_initial_load_enabled: bool,
    /// Reverse load currently in flight, 0 if none.
    pub rev_initial_load_id: u64,
}

impl NodeSecurity {
    /// Row for a node with nothing pending.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

/// Maps one source table onto a target table for a group link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformTable {
    /// Transform id.
    pub transform_id: String,
    /// Source group of the link.
    pub source_node_group_id: String,
    /// Target group of the link.
    pub target_node_group_id: String,
    /// Table read at the source.
    pub source_table_name: String,
    /// Table written at the target.
    pub target_table_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_router_accessors() {
        let tr = TriggerRouter::new(
            Trigger::new("orders", "orders", "default"),
            Router::new("corp_2_store", "corp", "store"),
        )
        .with_load_order(5)
        .with_load_select("status = 'open'");
        assert_eq!(tr.trigger_id(), "orders");
        assert_eq!(tr.router_id(), "corp_2_store");
        assert_eq!(tr.table_name(), "orders");
        assert_eq!(tr.trigger.reload_channel_id, RELOAD_CHANNEL);
        assert_eq!(tr.initial_load_select.as_deref(), Some("status = 'open'"));
    }
}
