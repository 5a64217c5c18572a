//! File-backed persistence: one JSON document per record
//!
//! Records live in a per-client directory as `<key>.json` (`s-12.json`,
//! `r-4.json`). Writes go to a temporary file first and are renamed into place so
//! a crash never leaves a half-written record behind.

use super::{PersistedPacket, Persistence, PersistenceKey};
use crate::error::{MqttError, MqttResult};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug)]
pub struct FilePersistence {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl FilePersistence {
    /// Open (creating if needed) a store rooted at `directory`
    pub fn open(directory: impl Into<PathBuf>) -> MqttResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| {
            MqttError::persistence(format!(
                "cannot create store directory {}: {e}",
                directory.display()
            ))
        })?;
        debug!(directory = %directory.display(), "Opened file persistence");
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the store for one client below a shared base directory
    pub fn for_client(base: impl AsRef<Path>, client_id: &str) -> MqttResult<Self> {
        Self::open(base.as_ref().join(client_id))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, key: PersistenceKey) -> PathBuf {
        self.directory.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    fn guard(&self) -> MqttResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| MqttError::persistence("file store lock poisoned"))
    }
}

impl Persistence for FilePersistence {
    fn store(&self, key: PersistenceKey, packet: &PersistedPacket) -> MqttResult<()> {
        let _guard = self.guard()?;
        let path = self.record_path(key);
        let temp = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(packet)?;
        fs::write(&temp, body)
            .and_then(|_| fs::rename(&temp, &path))
            .map_err(|e| MqttError::persistence(format!("cannot write {key}: {e}")))
    }

    fn retrieve(&self, key: PersistenceKey) -> MqttResult<Option<PersistedPacket>> {
        let _guard = self.guard()?;
        match fs::read(self.record_path(key)) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MqttError::persistence(format!("cannot read {key}: {e}"))),
        }
    }

    fn remove(&self, key: PersistenceKey) -> MqttResult<()> {
        let _guard = self.guard()?;
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MqttError::persistence(format!("cannot remove {key}: {e}"))),
        }
    }

    fn all_keys(&self) -> MqttResult<HashSet<PersistenceKey>> {
        let _guard = self.guard()?;
        let entries = fs::read_dir(&self.directory)
            .map_err(|e| MqttError::persistence(format!("cannot list store: {e}")))?;

        let mut keys = HashSet::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MqttError::persistence(format!("cannot list store: {e}")))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match stem.parse::<PersistenceKey>() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Ignoring stray file in store"),
            }
        }
        Ok(keys)
    }

    fn clear(&self) -> MqttResult<()> {
        let keys = self.all_keys()?;
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}
