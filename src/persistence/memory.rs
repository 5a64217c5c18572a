//! In-memory persistence, the default store

use super::{PersistedPacket, Persistence, PersistenceKey};
use crate::error::{MqttError, MqttResult};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Keeps records for the lifetime of the process. Sharing one instance between
/// successive clients (via `Arc`) simulates a restart with durable storage.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<PersistenceKey, PersistedPacket>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MqttResult<std::sync::MutexGuard<'_, HashMap<PersistenceKey, PersistedPacket>>> {
        self.records
            .lock()
            .map_err(|_| MqttError::persistence("memory store lock poisoned"))
    }
}

impl Persistence for MemoryPersistence {
    fn store(&self, key: PersistenceKey, packet: &PersistedPacket) -> MqttResult<()> {
        self.lock()?.insert(key, packet.clone());
        Ok(())
    }

    fn retrieve(&self, key: PersistenceKey) -> MqttResult<Option<PersistedPacket>> {
        Ok(self.lock()?.get(&key).cloned())
    }

    fn remove(&self, key: PersistenceKey) -> MqttResult<()> {
        self.lock()?.remove(&key);
        Ok(())
    }

    fn all_keys(&self) -> MqttResult<HashSet<PersistenceKey>> {
        Ok(self.lock()?.keys().copied().collect())
    }

    fn clear(&self) -> MqttResult<()> {
        self.lock()?.clear();
        Ok(())
    }
}
