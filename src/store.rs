use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Live table of owned records, hostname to IPv4 address.
///
/// Shared between the query path (readers) and the management API (writers).
/// Operations are total and atomic per key; there is no cross-key
/// transactional guarantee. Keys are stored exactly as given, callers
/// normalize.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Arc<RwLock<HashMap<String, String>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from an initial hostname to address map.
    pub fn from_map(records: HashMap<String, String>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Look up the address for a hostname.
    pub fn get(&self, name: &str) -> Option<String> {
        let records = self.records.read();
        records.get(name).cloned()
    }

    /// Insert or replace a record.
    pub fn put(&self, name: impl Into<String>, address: impl Into<String>) {
        let name = name.into();
        let address = address.into();
        debug!("record {} => {}", name, address);

        let mut records = self.records.write();
        records.insert(name, address);
    }

    /// Remove a record, returning the address it held.
    pub fn remove(&self, name: &str) -> Option<String> {
        let mut records = self.records.write();
        let removed = records.remove(name);
        if removed.is_some() {
            debug!("record {} removed", name);
        }
        removed
    }

    /// Snapshot of the whole table.
    pub fn list(&self) -> HashMap<String, String> {
        let records = self.records.read();
        records.clone()
    }

    pub fn len(&self) -> usize {
        let records = self.records.read();
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
