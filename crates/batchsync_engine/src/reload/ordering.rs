//! Table order for initial loads.

use batchsync_core::{SourceDatabase, TriggerRouter};
use std::collections::{BTreeMap, BTreeSet};

/// A table to order: name, operator load order and referenced tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNode {
    /// Table name.
    pub name: String,
    /// Operator load order, lower first.
    pub load_order: i32,
    /// Tables this one references.
    pub dependencies: Vec<String>,
}

/// Sorts tables so every table comes after the tables it references.
///
/// Among tables that are ready at the same time, lower load order wins,
/// then the name. Dependencies on tables outside the set are ignored.
/// Tables caught in a cycle are appended in the same order once nothing
/// else is ready.
pub fn sort_tables(tables: &[TableNode]) -> Vec<String> {
    let names: BTreeSet<String> = tables.iter().map(|t| t.name.to_lowercase()).collect();
    let mut pending: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut rank: BTreeMap<String, (i32, String)> = BTreeMap::new();
    for table in tables {
        let key = table.name.to_lowercase();
        let deps = table
            .dependencies
            .iter()
            .map(|d| d.to_lowercase())
            .filter(|d| *d != key && names.contains(d))
            .collect();
        pending.insert(key.clone(), deps);
        rank.insert(key, (table.load_order, table.name.clone()));
    }

    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let mut ready: Vec<&(i32, String)> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .filter_map(|(key, _)| rank.get(key))
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = pending.keys().map(String::as_str).collect();
            tracing::warn!(tables = ?stuck, "cyclic table dependencies, loading the rest in load order");
            let mut rest: Vec<&(i32, String)> = pending.keys().filter_map(|k| rank.get(k)).collect();
            rest.sort();
            ordered.extend(rest.into_iter().map(|(_, name)| name.clone()));
            break;
        }
        ready.sort();
        let next = ready[0].1.clone();
        let key = next.to_lowercase();
        pending.remove(&key);
        for deps in pending.values_mut() {
            deps.remove(&key);
        }
        ordered.push(next);
    }
    ordered
}

/// Orders trigger routers for a load, keeping routers of one table together.
pub fn order_trigger_routers(
    trigger_routers: Vec<TriggerRouter>,
    source: &dyn SourceDatabase,
) -> Vec<TriggerRouter> {
    let mut by_table: BTreeMap<String, Vec<TriggerRouter>> = BTreeMap::new();
    for tr in trigger_routers {
        by_table.entry(tr.table_name().to_lowercase()).or_default().push(tr);
    }
    let nodes: Vec<TableNode> = by_table
        .values()
        .filter_map(|group| group.first())
        .map(|tr| TableNode {
            name: tr.table_name().to_string(),
            load_order: tr.initial_load_order,
            dependencies: source
                .table(tr.table_name())
                .map(|def| def.dependencies().map(str::to_string).collect())
                .unwrap_or_default(),
        })
        .collect();
    sort_tables(&nodes)
        .into_iter()
        .filter_map(|name| by_table.remove(&name.to_lowercase()))
        .flatten()
        .collect()
}
