//! Extract requests, table reload requests, reload status and node security rows.

use batchsync_protocol::{ExtractRequest, ExtractStatus, TableReloadRequest, TableReloadStatus};
use std::collections::BTreeSet;

use crate::database::Tables;
use crate::error::{CoreError, CoreResult};
use crate::model::NodeSecurity;

impl Tables {
    /// Inserts a new extract request.
    pub fn insert_extract_request(&mut self, request: ExtractRequest) -> CoreResult<()> {
        if self.extract_requests.contains_key(&request.request_id) {
            return Err(CoreError::duplicate(format!(
                "extract request {}",
                request.request_id
            )));
        }
        self.extract_requests.insert(request.request_id, request);
        Ok(())
    }

    /// Looks a request up.
    pub fn extract_request(&self, request_id: u64) -> Option<&ExtractRequest> {
        self.extract_requests.get(&request_id)
    }

    /// Writes a request row back.
    pub fn update_extract_request(&mut self, request: &ExtractRequest) -> CoreResult<()> {
        let stored = self
            .extract_requests
            .get_mut(&request.request_id)
            .ok_or_else(|| CoreError::not_found(format!("extract request {}", request.request_id)))?;
        *stored = request.clone();
        Ok(())
    }

    /// All requests in id order.
    pub fn extract_requests(&self) -> impl Iterator<Item = &ExtractRequest> {
        self.extract_requests.values()
    }

    /// (node, queue) pairs that have root requests waiting.
    pub fn extract_request_queues(&self) -> BTreeSet<(String, String)> {
        self.extract_requests
            .values()
            .filter(|r| !r.is_child() && r.status != ExtractStatus::Ok)
            .map(|r| (r.node_id.clone(), r.queue.clone()))
            .collect()
    }

    /// Root requests of (node, queue) that are not OK, in id order.
    pub fn pending_extract_requests(&self, node_id: &str, queue: &str) -> Vec<ExtractRequest> {
        self.extract_requests
            .values()
            .filter(|r| {
                r.node_id == node_id
                    && r.queue == queue
                    && !r.is_child()
                    && r.status != ExtractStatus::Ok
            })
            .cloned()
            .collect()
    }

    /// Children of a request, in id order.
    pub fn child_extract_requests(&self, parent_request_id: u64) -> Vec<ExtractRequest> {
        self.extract_requests
            .values()
            .filter(|r| r.parent_request_id == parent_request_id && parent_request_id != 0)
            .cloned()
            .collect()
    }

    /// Requests of a load, in id order.
    pub fn extract_requests_for_load(&self, load_id: u64) -> Vec<ExtractRequest> {
        self.extract_requests
            .values()
            .filter(|r| r.load_id == load_id)
            .cloned()
            .collect()
    }

    /// Request of `node_id` whose batch range covers `batch_id`.
    pub fn extract_request_for_batch(&self, node_id: &str, batch_id: u64) -> Option<&ExtractRequest> {
        self.extract_requests
            .values()
            .find(|r| r.node_id == node_id && r.contains_batch(batch_id))
    }

    /// Marks every request of a load OK. Returns how many changed.
    pub fn cancel_extract_requests(&mut self, load_id: u64, now: u64) -> usize {
        let mut changed = 0;
        for request in self.extract_requests.values_mut() {
            if request.load_id == load_id && request.status != ExtractStatus::Ok {
                request.status = ExtractStatus::Ok;
                request.last_update_time = now;
                changed += 1;
            }
        }
        changed
    }

    /// Turns children of finished parents into roots.
    ///
    /// A child is only processed alongside its parent, so a child left
    /// behind by a parent that already finished would never run.
    pub fn release_missed_extract_requests(&mut self, now: u64) -> usize {
        let done_parents: BTreeSet<u64> = self
            .extract_requests
            .values()
            .filter(|r| r.status == ExtractStatus::Ok)
            .map(|r| r.request_id)
            .collect();
        let mut released = 0;
        for request in self.extract_requests.values_mut() {
            if request.is_child()
                && request.status != ExtractStatus::Ok
                && done_parents.contains(&request.parent_request_id)
            {
                tracing::info!(
                    request_id = request.request_id,
                    parent = request.parent_request_id,
                    node_id = %request.node_id,
                    "releasing missed extract request"
                );
                request.parent_request_id = 0;
                request.last_update_time = now;
                released += 1;
            }
        }
        released
    }

    /// Queues an operator reload request.
    pub fn insert_reload_request(&mut self, request: TableReloadRequest) {
        self.reload_requests.push(request);
    }

    /// Reload requests not yet turned into a load, oldest first.
    pub fn unprocessed_reload_requests(&self) -> Vec<TableReloadRequest> {
        let mut pending: Vec<_> = self
            .reload_requests
            .iter()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.create_time);
        pending
    }

    /// Reload requests that belong to a load.
    pub fn reload_requests_for_load(&self, load_id: u64) -> Vec<TableReloadRequest> {
        self.reload_requests
            .iter()
            .filter(|r| r.load_id == load_id)
            .cloned()
            .collect()
    }

    /// Marks the requests of one group processed under `load_id`.
    pub fn mark_reload_requests_processed(
        &mut self,
        target_node_id: &str,
        source_node_id: &str,
        create_time: u64,
        load_id: u64,
        now: u64,
    ) -> usize {
        let mut changed = 0;
        for request in self.reload_requests.iter_mut().filter(|r| {
            !r.processed
                && r.target_node_id == target_node_id
                && r.source_node_id == source_node_id
                && r.create_time == create_time
        }) {
            request.processed = true;
            request.load_id = load_id;
            request.last_update_time = now;
            changed += 1;
        }
        changed
    }

    /// Tags the unprocessed requests of one group with `load_id` without
    /// processing them, so a retry of a failed load reuses the id.
    pub fn assign_load_to_reload_requests(
        &mut self,
        target_node_id: &str,
        source_node_id: &str,
        create_time: u64,
        load_id: u64,
        now: u64,
    ) -> usize {
        let mut changed = 0;
        for request in self.reload_requests.iter_mut().filter(|r| {
            !r.processed
                && r.target_node_id == target_node_id
                && r.source_node_id == source_node_id
                && r.create_time == create_time
        }) {
            request.load_id = load_id;
            request.last_update_time = now;
            changed += 1;
        }
        changed
    }

    /// Nodes waiting for a reverse initial load.
    pub fn nodes_needing_reverse_load(&self) -> Vec<NodeSecurity> {
        self.node_security
            .values()
            .filter(|s| s.rev_initial_load_enabled)
            .cloned()
            .collect()
    }

    /// Inserts or replaces a load's status row.
    pub fn put_reload_status(&mut self, status: TableReloadStatus) {
        self.reload_status.insert(status.load_id, status);
    }

    /// Looks a load's status up.
    pub fn reload_status(&self, load_id: u64) -> Option<&TableReloadStatus> {
        self.reload_status.get(&load_id)
    }

    /// Mutable access to a load's status.
    pub fn reload_status_mut(&mut self, load_id: u64) -> Option<&mut TableReloadStatus> {
        self.reload_status.get_mut(&load_id)
    }

    /// All load status rows by load id.
    pub fn reload_statuses(&self) -> impl Iterator<Item = &TableReloadStatus> {
        self.reload_status.values()
    }

    /// Loads from `source_node_id` still in flight.
    pub fn active_loads(&self, source_node_id: &str) -> Vec<TableReloadStatus> {
        self.reload_status
            .values()
            .filter(|s| s.source_node_id == source_node_id && s.is_active())
            .cloned()
            .collect()
    }

    /// Looks a node security row up.
    pub fn node_security(&self, node_id: &str) -> Option<&NodeSecurity> {
        self.node_security.get(node_id)
    }

    /// Inserts or replaces a node security row.
    pub fn put_node_security(&mut self, security: NodeSecurity) {
        self.node_security.insert(security.node_id.clone(), security);
    }

    /// Nodes waiting for a full initial load.
    pub fn nodes_needing_initial_load(&self) -> Vec<NodeSecurity> {
        self.node_security
            .values()
            .filter(|s| s.initial_load_enabled)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, node: &str, parent: u64, start: u64, end: u64) -> ExtractRequest {
        ExtractRequest {
            request_id: id,
            node_id: node.into(),
            queue: "default".into(),
            status: ExtractStatus::New,
            start_batch_id: start,
            end_batch_id: end,
            trigger_id: "orders".into(),
            router_id: "corp_2_store".into(),
            trigger_hist_id: 1,
            load_id: 7,
            table_name: "orders".into(),
            rows: 10,
            parent_request_id: parent,
            last_loaded_batch_id: 0,
            loaded_rows: 0,
            loaded_millis: 0,
            create_time: 0,
            last_update_time: 0,
        }
    }

    #[test]
    fn pending_roots_exclude_children() {
        let mut t = Tables::default();
        t.insert_extract_request(request(1, "001", 0, 10, 12)).unwrap();
        t.insert_extract_request(request(2, "002", 1, 13, 15)).unwrap();
        assert_eq!(t.pending_extract_requests("001", "default").len(), 1);
        assert!(t.pending_extract_requests("002", "default").is_empty());
        assert_eq!(t.child_extract_requests(1).len(), 1);
        assert_eq!(t.extract_request_for_batch("002", 14).map(|r| r.request_id), Some(2));
        assert_eq!(
            t.extract_request_queues().into_iter().collect::<Vec<_>>(),
            vec![("001".to_string(), "default".to_string())]
        );
    }

    #[test]
    fn release_missed_turns_orphans_into_roots() {
        let mut t = Tables::default();
        let mut parent = request(1, "001", 0, 10, 12);
        parent.status = ExtractStatus::Ok;
        t.insert_extract_request(parent).unwrap();
        t.insert_extract_request(request(2, "002", 1, 13, 15)).unwrap();
        t.insert_extract_request(request(3, "003", 4, 16, 18)).unwrap();

        assert_eq!(t.release_missed_extract_requests(5), 1);
        assert!(!t.extract_request(2).unwrap().is_child());
        assert!(t.extract_request(3).unwrap().is_child());
    }

    #[test]
    fn cancel_marks_load_requests_ok() {
        let mut t = Tables::default();
        t.insert_extract_request(request(1, "001", 0, 10, 12)).unwrap();
        t.insert_extract_request(request(2, "002", 1, 13, 15)).unwrap();
        let mut other = request(3, "001", 0, 20, 20);
        other.load_id = 8;
        t.insert_extract_request(other).unwrap();

        assert_eq!(t.cancel_extract_requests(7, 1), 2);
        assert_eq!(t.cancel_extract_requests(7, 1), 0);
        assert_eq!(t.extract_request(3).unwrap().status, ExtractStatus::New);
    }

    #[test]
    fn reload_requests_grouped_processing() {
        let mut t = Tables::default();
        t.insert_reload_request(TableReloadRequest::full_load("001", "00000", 5));
        t.insert_reload_request(TableReloadRequest::new("002", "00000", "orders", "r", 3));
        assert_eq!(t.unprocessed_reload_requests()[0].target_node_id, "002");
        assert_eq!(t.mark_reload_requests_processed("001", "00000", 5, 11, 6), 1);
        assert_eq!(t.unprocessed_reload_requests().len(), 1);
        assert_eq!(t.reload_requests_for_load(11).len(), 1);
    }

    #[test]
    fn failed_load_id_is_kept_on_requests() {
        let mut t = Tables::default();
        t.insert_reload_request(TableReloadRequest::new("002", "00000", "orders", "r", 3));
        assert_eq!(t.assign_load_to_reload_requests("002", "00000", 3, 9, 4), 1);
        let pending = t.unprocessed_reload_requests();
        assert_eq!((pending.len(), pending[0].load_id), (1, 9));
    }
}
