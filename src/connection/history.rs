use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentConnection {
    pub network_id: String,
    /// Unix seconds
    pub timestamp: i64,
    pub display_name: String,
    pub gateway_address: String,
}

/// Most-recent-first connection history, one entry per network.
#[derive(Clone)]
pub struct ConnectionHistory {
    entries: Arc<RwLock<Vec<RecentConnection>>>,
    limit: usize,
}

impl ConnectionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            limit: limit.max(1),
        }
    }

    /// Seed from persisted records, newest first after sorting.
    pub fn restore(&self, mut entries: Vec<RecentConnection>) {
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut deduped: Vec<RecentConnection> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !deduped.iter().any(|e| e.network_id == entry.network_id) {
                deduped.push(entry);
            }
        }
        deduped.truncate(self.limit);
        *self.entries.write() = deduped;
    }

    /// Replace any entry for the same network and put this one first.
    pub fn save(&self, entry: RecentConnection) -> Vec<RecentConnection> {
        let mut entries = self.entries.write();
        entries.retain(|e| e.network_id != entry.network_id);
        entries.insert(0, entry);
        entries.truncate(self.limit);
        entries.clone()
    }

    pub fn list(&self) -> Vec<RecentConnection> {
        self.entries.read().clone()
    }

    pub fn find(&self, network_id: &str) -> Option<RecentConnection> {
        self.entries
            .read()
            .iter()
            .find(|e| e.network_id == network_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(network_id: &str, timestamp: i64) -> RecentConnection {
        RecentConnection {
            network_id: network_id.to_string(),
            timestamp,
            display_name: format!("net {}", network_id),
            gateway_address: "10.147.17.1".to_string(),
        }
    }

    #[test]
    fn saving_same_network_keeps_one_entry() {
        let history = ConnectionHistory::new(10);
        history.save(entry("a", 1));
        history.save(entry("b", 2));
        let list = history.save(entry("a", 3));

        assert_eq!(list.len(), 2);
        assert_eq!(list[0], entry("a", 3));
        assert_eq!(list[1].network_id, "b");
    }

    #[test]
    fn history_is_capped() {
        let history = ConnectionHistory::new(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            history.save(entry(id, i as i64));
        }
        let ids: Vec<_> = history.list().into_iter().map(|e| e.network_id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn restore_orders_and_dedups() {
        let history = ConnectionHistory::new(10);
        history.restore(vec![entry("a", 1), entry("b", 5), entry("a", 7)]);
        let list = history.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].timestamp, 7);
        assert_eq!(history.find("b").unwrap().timestamp, 5);
    }
}
