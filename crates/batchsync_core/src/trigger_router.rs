//! Cached view of trigger/router configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TimedCache;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::model::TriggerRouter;
use crate::registry::ConfigRegistry;

/// Trigger/router lookups served from a [`TimedCache`].
///
/// Entries are keyed by source node group and refreshed once older than
/// the TTL, or at once after [`TriggerRouterService::invalidate`].
#[derive(Debug)]
pub struct TriggerRouterService {
    registry: Arc<ConfigRegistry>,
    cache: TimedCache<String, Arc<Vec<TriggerRouter>>>,
}

impl TriggerRouterService {
    /// Creates a service over `registry`.
    pub fn new(registry: Arc<ConfigRegistry>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: TimedCache::new(clock, ttl),
        }
    }

    /// Enabled trigger/routers whose router starts at `source_group`.
    pub fn trigger_routers_for_source_group(&self, source_group: &str) -> Arc<Vec<TriggerRouter>> {
        let key = source_group.to_string();
        let loaded: Result<_, std::convert::Infallible> = self.cache.get_or_try_load(&key, || {
            tracing::debug!(group = source_group, "loading trigger routers");
            Ok(Arc::new(
                self.registry
                    .trigger_routers()
                    .into_iter()
                    .filter(|tr| tr.enabled && tr.router.source_node_group_id == source_group)
                    .collect(),
            ))
        });
        match loaded {
            Ok(routers) => routers,
            Err(never) => match never {},
        }
    }

    /// Trigger/routers that send from `source_group` to `target_group`.
    pub fn trigger_routers_for_link(
        &self,
        source_group: &str,
        target_group: &str,
    ) -> Vec<TriggerRouter> {
        self.trigger_routers_for_source_group(source_group)
            .iter()
            .filter(|tr| tr.router.target_node_group_id == target_group)
            .cloned()
            .collect()
    }

    /// Finds one pair on the link or fails with a validation error.
    pub fn find(
        &self,
        source_group: &str,
        trigger_id: &str,
        router_id: &str,
    ) -> CoreResult<TriggerRouter> {
        self.trigger_routers_for_source_group(source_group)
            .iter()
            .find(|tr| tr.trigger_id() == trigger_id && tr.router_id() == router_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::validation(format!(
                    "no trigger router configured for trigger '{trigger_id}' and router '{router_id}'"
                ))
            })
    }

    /// Drops cached entries so the next lookup reads the registry.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}
