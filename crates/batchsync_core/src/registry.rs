//! In-memory configuration registry.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    Channel, ChannelControl, Node, Trigger, TriggerHistory, TriggerRouter, TransformTable,
};

#[derive(Debug, Default)]
struct RegistryState {
    nodes: BTreeMap<String, Node>,
    channels: BTreeMap<String, Channel>,
    controls: BTreeMap<(String, String), ChannelControl>,
    trigger_routers: Vec<TriggerRouter>,
    histories: BTreeMap<u32, TriggerHistory>,
    transforms: Vec<TransformTable>,
}

/// Configuration shared by the engine's services.
///
/// Writers call the `add_*`/`set_*` methods; readers get clones, so nothing
/// holds the lock while doing real work.
#[derive(Debug)]
pub struct ConfigRegistry {
    identity: Node,
    state: RwLock<RegistryState>,
}

impl ConfigRegistry {
    /// Creates a registry for the local node.
    pub fn new(identity: Node) -> Self {
        let mut state = RegistryState::default();
        state.nodes.insert(identity.node_id.clone(), identity.clone());
        Self {
            identity,
            state: RwLock::new(state),
        }
    }

    /// The local node.
    pub fn identity(&self) -> &Node {
        &self.identity
    }

    /// Registers or replaces a node.
    pub fn add_node(&self, node: Node) {
        self.state.write().nodes.insert(node.node_id.clone(), node);
    }

    /// Looks a node up.
    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.state.read().nodes.get(node_id).cloned()
    }

    /// Enabled nodes of a group, by id.
    pub fn nodes_in_group(&self, group: &str) -> Vec<Node> {
        self.state
            .read()
            .nodes
            .values()
            .filter(|n| n.node_group_id == group && n.sync_enabled)
            .cloned()
            .collect()
    }

    /// Registers or replaces a channel.
    pub fn add_channel(&self, channel: Channel) {
        self.state
            .write()
            .channels
            .insert(channel.channel_id.clone(), channel);
    }

    /// Looks a channel up.
    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.state.read().channels.get(channel_id).cloned()
    }

    /// Looks a channel up or fails with `NotFound`.
    pub fn require_channel(&self, channel_id: &str) -> CoreResult<Channel> {
        self.channel(channel_id)
            .ok_or_else(|| CoreError::not_found(format!("channel {channel_id}")))
    }

    /// All channels, by id.
    pub fn channels(&self) -> Vec<Channel> {
        self.state.read().channels.values().cloned().collect()
    }

    /// Sets suspend/ignore for one (node, channel) pair.
    pub fn set_channel_control(&self, control: ChannelControl) {
        self.state.write().controls.insert(
            (control.node_id.clone(), control.channel_id.clone()),
            control,
        );
    }

    /// Suspend/ignore switches for `node_id`, keyed by channel.
    pub fn channel_controls(&self, node_id: &str) -> BTreeMap<String, ChannelControl> {
        self.state
            .read()
            .controls
            .values()
            .filter(|c| c.node_id == node_id)
            .map(|c| (c.channel_id.clone(), c.clone()))
            .collect()
    }

    /// Registers a trigger/router pair.
    pub fn add_trigger_router(&self, trigger_router: TriggerRouter) {
        let mut state = self.state.write();
        state.trigger_routers.retain(|tr| {
            tr.trigger_id() != trigger_router.trigger_id()
                || tr.router_id() != trigger_router.router_id()
        });
        state.trigger_routers.push(trigger_router);
    }

    /// All trigger/router pairs in registration order.
    pub fn trigger_routers(&self) -> Vec<TriggerRouter> {
        self.state.read().trigger_routers.clone()
    }

    /// Trigger of a given id.
    pub fn trigger(&self, trigger_id: &str) -> Option<Trigger> {
        self.state
            .read()
            .trigger_routers
            .iter()
            .find(|tr| tr.trigger_id() == trigger_id)
            .map(|tr| tr.trigger.clone())
    }

    /// Records a new table definition version.
    pub fn add_history(&self, history: TriggerHistory) {
        self.state
            .write()
            .histories
            .insert(history.trigger_hist_id, history);
    }

    /// Looks a history up by id.
    pub fn history(&self, trigger_hist_id: u32) -> Option<TriggerHistory> {
        self.state.read().histories.get(&trigger_hist_id).cloned()
    }

    /// Newest history of a trigger.
    pub fn latest_history(&self, trigger_id: &str) -> Option<TriggerHistory> {
        self.state
            .read()
            .histories
            .values()
            .rev()
            .find(|h| h.trigger_id == trigger_id)
            .cloned()
    }

    /// Registers a table transform.
    pub fn add_transform(&self, transform: TransformTable) {
        self.state.write().transforms.push(transform);
    }

    /// Transforms of `source_table` on the link `source_group -> target_group`.
    pub fn transforms_for(
        &self,
        source_group: &str,
        target_group: &str,
        source_table: &str,
    ) -> Vec<TransformTable> {
        self.state
            .read()
            .transforms
            .iter()
            .filter(|t| {
                t.source_node_group_id == source_group
                    && t.target_node_group_id == target_group
                    && t.source_table_name.eq_ignore_ascii_case(source_table)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Router;

    fn registry() -> ConfigRegistry {
        let registry = ConfigRegistry::new(Node::new("00000", "corp"));
        registry.add_node(Node::new("001", "store"));
        registry.add_node(Node::new("002", "store"));
        registry
    }

    #[test]
    fn nodes_by_group() {
        let registry = registry();
        let stores: Vec<_> = registry
            .nodes_in_group("store")
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(stores, vec!["001", "002"]);
        assert!(registry.node("00000").is_some());
    }

    #[test]
    fn trigger_router_replaces_same_pair() {
        let registry = registry();
        let tr = TriggerRouter::new(
            Trigger::new("orders", "orders", "default"),
            Router::new("corp_2_store", "corp", "store"),
        );
        registry.add_trigger_router(tr.clone());
        registry.add_trigger_router(tr.with_load_order(9));
        let all = registry.trigger_routers();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].initial_load_order, 9);
    }

    #[test]
    fn latest_history_wins() {
        let registry = registry();
        for id in [1, 4, 2] {
            registry.add_history(TriggerHistory {
                trigger_hist_id: id,
                trigger_id: "orders".into(),
                source_table_name: "orders".into(),
                column_names: vec!["id".into()],
                pk_column_names: vec!["id".into()],
            });
        }
        assert_eq!(registry.latest_history("orders").map(|h| h.trigger_hist_id), Some(4));
        assert!(registry.latest_history("items").is_none());
    }
}
